//! Error types for pageforge operations.
//!
//! Defines the error taxonomy surfaced by the orchestration engine:
//! - Submission errors (invalid or duplicate jobs, backpressure)
//! - Lookup errors (unknown identifiers, results requested too early)
//! - Terminal job outcomes that are not a success payload
//!
//! Task-level failures (transient or permanent vision-model errors) are
//! not represented here. They are contained by the page executor and
//! recorded as page state, see [`crate::analysis::AnalysisError`].

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::{Channel, QueueError};

/// Errors returned by the orchestration engine's public surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job {0} already exists")]
    DuplicateJob(Uuid),

    #[error("Channel '{channel}' is over capacity ({depth} pending, high-water mark {high_water}); retry later")]
    Backpressure {
        channel: Channel,
        depth: usize,
        high_water: usize,
    },

    #[error("Result for job {0} is not ready yet")]
    NotReady(Uuid),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} was cancelled")]
    JobCancelled(Uuid),

    #[error("Job {job_id} failed with {pages_failed} failed page(s){}", .first_failure.as_ref().map(|f| format!(": {}", f)).unwrap_or_default())]
    JobFailed {
        job_id: Uuid,
        pages_failed: usize,
        first_failure: Option<String>,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl EngineError {
    /// Returns whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Backpressure { .. } | EngineError::NotReady(_))
    }
}
