//! Cooperative job cancellation.
//!
//! Cancelling raises the job's flag and cancels pending batches at once.
//! Active batches keep running: an attempt already talking to the vision
//! model finishes, but no retry and no new attempt starts afterwards, so
//! each active batch settles as `cancelled` through its own pages.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{JobStatus, StatusCode};
use crate::store::StateStore;

use super::coordinator::BatchCoordinator;

pub struct CancellationCoordinator {
    store: Arc<StateStore>,
    coordinator: Arc<BatchCoordinator>,
}

impl CancellationCoordinator {
    pub fn new(store: Arc<StateStore>, coordinator: Arc<BatchCoordinator>) -> Self {
        Self { store, coordinator }
    }

    /// Cancels a job and returns the status it had before.
    ///
    /// Cancelling a terminal job changes nothing and returns its status.
    pub async fn cancel(&self, job_id: &Uuid) -> Result<JobStatus, EngineError> {
        let job = self.store.get(job_id).ok_or(EngineError::NotFound(*job_id))?;
        let previous = job.status();
        if previous.is_terminal() {
            return Ok(previous);
        }

        if job.request_cancel() {
            info!(job_id = %job_id, previous_status = %previous, "Cancellation requested");
        }
        self.coordinator.sweep_pending(&job).await;
        Ok(previous)
    }
}
