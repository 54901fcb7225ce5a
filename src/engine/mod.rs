//! The orchestration engine.
//!
//! - [`JobDecomposer`]: submission → job state, ordered batches, seed work
//! - [`PageExecutor`]: one analysis attempt per page delivery, with retry
//!   scheduling
//! - [`BatchCoordinator`]: edge-triggered batch and job settlement
//! - [`ProgressTracker`]: counter-based progress snapshots
//! - [`ResultAggregator`]: ordered final payload, summary and reporting
//! - [`CancellationCoordinator`]: cooperative cancellation
//! - [`Orchestrator`]: facade over all of the above

pub mod aggregator;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod decomposer;
pub mod executor;
pub mod orchestrator;
pub mod progress;
pub mod retry;

pub use aggregator::{fallback_summary, ResultAggregator};
pub use cancellation::CancellationCoordinator;
pub use config::{ConfigError, EngineConfig};
pub use coordinator::BatchCoordinator;
pub use decomposer::{plan_batches, Decomposition, JobDecomposer};
pub use executor::{ExecutionOutcome, PageExecutor};
pub use orchestrator::Orchestrator;
pub use progress::{BatchCounts, ProgressSnapshot, ProgressTracker};
pub use retry::{RetryDecision, RetryPolicy};
