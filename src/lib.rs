//! pageforge: batch orchestration for large document analysis jobs.
//!
//! This library splits multi-page analysis jobs into batches of page
//! tasks, dispatches them across per-channel worker pools, tracks progress
//! and reassembles ordered results, with cooperative cancellation.

// Core modules
pub mod analysis;
pub mod cli;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use analysis::AnalysisError;
pub use engine::{ConfigError, EngineConfig, Orchestrator, ProgressSnapshot};
pub use error::EngineError;
pub use model::{FailurePolicy, FinalResult, JobStatus, JobSubmission, PageInput};
pub use scheduler::QueueError;
