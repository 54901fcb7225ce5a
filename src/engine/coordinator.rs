//! Batch coordination.
//!
//! A batch has no thread of its own. Dispatching a batch routes its page
//! items; after that the batch is a passive record, and the worker whose
//! page drives the batch's remaining count to zero closes it. Closing the
//! last batch of a job settles the job and hands it to the aggregator
//! through a high-priority finalize item.
//!
//! ```text
//! DispatchBatch ──► pending → active ──► AnalyzePage × len
//!                                             │
//!                       page settled ◄────────┘
//!                            │ remaining == 0 ?
//!                            ▼
//!                  close batch (completed | failed | cancelled)
//!                            │ last batch of job ?
//!                            ▼
//!                  settle job ──► FinalizeJob
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::model::{BatchStatus, FailurePolicy, JobStatus, PageStatus};
use crate::scheduler::{Priority, PriorityClass, QueueRouter, WorkItem, WorkPayload};
use crate::store::{BatchState, JobState};

use super::progress::ProgressTracker;

const LIVE_JOB: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Processing];

/// Moves a live job to a terminal status and records the transition.
///
/// Returns `false` if the job was already terminal.
pub(crate) fn finish_job(job: &JobState, to: JobStatus, metrics: &MetricsCollector) -> bool {
    if job.status.transition(&LIVE_JOB, to).is_err() {
        return false;
    }
    job.mark_finished();
    metrics.record_job(&to.to_string());
    metrics.dec_jobs_in_progress();
    true
}

/// Edge-triggered batch and job settlement.
pub struct BatchCoordinator {
    router: Arc<QueueRouter>,
    progress: ProgressTracker,
    metrics: MetricsCollector,
}

impl BatchCoordinator {
    pub fn new(router: Arc<QueueRouter>, progress: ProgressTracker) -> Self {
        Self {
            router,
            progress,
            metrics: MetricsCollector::new(),
        }
    }

    /// Activates a batch and routes one page item per page.
    ///
    /// Redelivery is safe: an already active batch re-routes only its pages
    /// that are still pending, and duplicate page items are ignored by the
    /// executor.
    pub async fn dispatch(&self, job: &JobState, batch_index: usize) -> Result<(), EngineError> {
        let job_id = job.id();
        let Some(batch) = job.batch(batch_index) else {
            warn!(job_id = %job_id, batch_index = batch_index, "Dispatch for unknown batch");
            return Ok(());
        };

        if !job.activate_batch(batch_index) && batch.status.load() != BatchStatus::Active {
            debug!(
                job_id = %job_id,
                batch_index = batch_index,
                status = %batch.status.load(),
                "Batch not dispatchable"
            );
            return Ok(());
        }

        info!(
            job_id = %job_id,
            batch_index = batch_index,
            start = batch.range.start,
            end = batch.range.end,
            "Dispatching batch"
        );

        let priority = Priority::by_age(PriorityClass::Normal, job.spec().created_at);
        for page_index in batch.range.clone() {
            let Some(page) = job.page(page_index) else {
                continue;
            };
            if page.status.load() != PageStatus::Pending {
                continue;
            }
            if job.should_abandon() {
                if page.cancel_idle() {
                    self.page_settled(job, page_index, PageStatus::Cancelled)
                        .await;
                }
                continue;
            }
            self.router
                .route(WorkItem::new(
                    WorkPayload::AnalyzePage { job_id, page_index },
                    priority,
                ))
                .await?;
        }
        Ok(())
    }

    /// Handles a page that reached a terminal status.
    ///
    /// Must be called exactly once per page, by whoever settled it.
    pub async fn page_settled(&self, job: &JobState, page_index: usize, status: PageStatus) {
        self.progress.record_page_completion(job, page_index, status);

        let Some(batch) = job.page(page_index).and_then(|p| job.batch(p.batch_index)) else {
            return;
        };
        if batch.settle_page(status) {
            self.close_batch(job, batch).await;
        }
    }

    async fn close_batch(&self, job: &JobState, batch: &BatchState) {
        let status = batch.settled_status(job.is_cancel_requested());
        if batch
            .status
            .compare_and_set(BatchStatus::Active, status)
            .is_err()
        {
            warn!(
                job_id = %job.id(),
                batch_index = batch.index,
                status = %batch.status.load(),
                "Closing a batch that is not active"
            );
            return;
        }

        self.progress.record_batch_settled(job, status);
        self.metrics.record_batch(&status.to_string());
        info!(
            job_id = %job.id(),
            batch_index = batch.index,
            status = %status,
            pages_completed = batch.pages_completed(),
            pages_failed = batch.pages_failed(),
            "Batch closed"
        );

        if status == BatchStatus::Failed && job.spec().policy == FailurePolicy::FailFast {
            self.fail_job(job).await;
        }

        if job.retire_batch() {
            self.job_settled(job).await;
        }
    }

    /// Fails a fail-fast job and stops work that has not started yet.
    async fn fail_job(&self, job: &JobState) {
        if !finish_job(job, JobStatus::Failed, &self.metrics) {
            return;
        }
        error!(
            job_id = %job.id(),
            pages_failed = job.progress.pages_failed.load(std::sync::atomic::Ordering::Acquire),
            first_failure = job.first_failure().unwrap_or("unknown"),
            "Job failed"
        );
        self.sweep_pending(job).await;
    }

    /// Cancels every batch that is still pending.
    ///
    /// Active batches are left to settle through their own pages.
    pub async fn sweep_pending(&self, job: &JobState) {
        let mut swept = 0;
        for batch in job.batches() {
            if batch
                .status
                .compare_and_set(BatchStatus::Pending, BatchStatus::Cancelled)
                .is_err()
            {
                continue;
            }
            swept += 1;
            for page_index in batch.range.clone() {
                if job
                    .page(page_index)
                    .map(|p| p.cancel_idle())
                    .unwrap_or(false)
                {
                    self.progress
                        .record_page_completion(job, page_index, PageStatus::Cancelled);
                }
            }
            self.progress.record_batch_cancelled(job);
            self.metrics.record_batch("cancelled");

            if job.retire_batch() {
                self.job_settled(job).await;
            }
        }
        if swept > 0 {
            debug!(job_id = %job.id(), batches = swept, "Pending batches cancelled");
        }
    }

    /// Runs once, when the last batch of a job reaches a terminal status.
    async fn job_settled(&self, job: &JobState) {
        if job.is_cancel_requested() && finish_job(job, JobStatus::Cancelled, &self.metrics) {
            info!(job_id = %job.id(), "Job cancelled");
        }

        let item = WorkItem::new(
            WorkPayload::FinalizeJob { job_id: job.id() },
            Priority::by_age(PriorityClass::High, job.spec().created_at),
        );
        if let Err(e) = self.router.route(item).await {
            error!(job_id = %job.id(), error = %e, "Failed to route job finalization");
        }
    }
}
