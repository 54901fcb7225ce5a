//! Page task executor.
//!
//! Runs one attempt of one page task per delivery. The retry loop is not
//! a loop in code: a transient failure parks the page in
//! `retry_scheduled` and routes a fresh page item after the backoff
//! delay, so the next attempt can land on any worker. The cancellation
//! flag is checked before every attempt and before every retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::analysis::{AnalysisError, PageRequest, VisionAnalyzer};
use crate::metrics::MetricsCollector;
use crate::model::{PageInput, PageOutcome, PageStatus};
use crate::scheduler::{Priority, PriorityClass, QueueRouter, WorkItem, WorkPayload};
use crate::store::{JobState, PageState};

use super::retry::{RetryDecision, RetryPolicy};

/// What a single delivery of a page item did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionOutcome {
    /// The page reached a terminal status during this delivery.
    Settled(PageStatus),
    /// The attempt failed transiently and another one is scheduled.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Nothing was done: duplicate delivery, already terminal page or
    /// unknown page index.
    Skipped,
}

/// Executes page tasks against a [`VisionAnalyzer`].
pub struct PageExecutor {
    analyzer: Arc<dyn VisionAnalyzer>,
    router: Arc<QueueRouter>,
    retry: RetryPolicy,
    task_timeout: Duration,
    metrics: MetricsCollector,
}

impl PageExecutor {
    pub fn new(
        analyzer: Arc<dyn VisionAnalyzer>,
        router: Arc<QueueRouter>,
        retry: RetryPolicy,
        task_timeout: Duration,
    ) -> Self {
        Self {
            analyzer,
            router,
            retry,
            task_timeout,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs one attempt of page `page_index` of `job`.
    pub async fn execute(&self, job: &JobState, page_index: usize) -> ExecutionOutcome {
        let job_id = job.id();
        let Some(page) = job.page(page_index) else {
            warn!(job_id = %job_id, page_index = page_index, "Page item for unknown page index");
            return ExecutionOutcome::Skipped;
        };

        if job.should_abandon() {
            return self.cancel_page(job, page);
        }

        let Some(attempt) = page.begin_attempt() else {
            debug!(
                job_id = %job_id,
                page_index = page_index,
                status = ?page.status.load(),
                "Ignoring duplicate page delivery"
            );
            return ExecutionOutcome::Skipped;
        };

        let start = Instant::now();
        let result = self.run_attempt(job, page).await;
        self.metrics
            .observe_page_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(text) => {
                if !page.settle(PageOutcome::Completed { text }) {
                    return ExecutionOutcome::Skipped;
                }
                self.metrics.record_page("completed");
                debug!(job_id = %job_id, page_index = page_index, attempt = attempt, "Page completed");
                ExecutionOutcome::Settled(PageStatus::Completed)
            }
            Err(error) => match self.retry.decide(attempt, error.is_retryable()) {
                RetryDecision::Retry { delay } => self.schedule_retry(job, page, attempt, delay, &error),
                RetryDecision::GiveUp => {
                    let detail = error.detail().to_string();
                    warn!(
                        job_id = %job_id,
                        page_index = page_index,
                        attempt = attempt,
                        retryable = error.is_retryable(),
                        error = %detail,
                        "Page failed permanently"
                    );
                    let first_failure =
                        format!("page {}: {}", job.spec().page_number(page_index), detail);
                    if !page.settle(PageOutcome::Failed {
                        error: detail,
                        attempts: attempt,
                    }) {
                        return ExecutionOutcome::Skipped;
                    }
                    job.record_first_failure(first_failure);
                    self.metrics.record_page("failed");
                    ExecutionOutcome::Settled(PageStatus::Failed)
                }
            },
        }
    }

    async fn run_attempt(&self, job: &JobState, page: &PageState) -> Result<String, AnalysisError> {
        if let PageInput::Text(text) = &page.input {
            return Ok(text.clone());
        }

        let spec = job.spec();
        let request = PageRequest {
            job_id: spec.id,
            page_index: page.index,
            total_pages: spec.total_pages,
            doc_type: &spec.doc_type,
            input: &page.input,
        };

        match tokio::time::timeout(self.task_timeout, self.analyzer.analyze(request)).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::Retryable(format!(
                "analysis timed out after {:?}",
                self.task_timeout
            ))),
        }
    }

    fn schedule_retry(
        &self,
        job: &JobState,
        page: &PageState,
        attempt: u32,
        delay: Duration,
        error: &AnalysisError,
    ) -> ExecutionOutcome {
        if job.should_abandon() {
            return self.abandon_attempt(job, page, attempt);
        }
        if !page.schedule_retry(error.detail()) {
            return ExecutionOutcome::Skipped;
        }

        info!(
            job_id = %job.id(),
            page_index = page.index,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient page failure, retry scheduled"
        );
        self.metrics.record_retry();

        let item = WorkItem::new(
            WorkPayload::AnalyzePage {
                job_id: job.id(),
                page_index: page.index,
            },
            Priority::by_age(PriorityClass::Normal, job.spec().created_at),
        );
        self.router.route_after(item, delay);
        ExecutionOutcome::RetryScheduled { attempt, delay }
    }

    /// Cancels a page on a delivery that holds no attempt.
    ///
    /// A page another worker is running is left alone; that worker settles
    /// it when its attempt returns.
    fn cancel_page(&self, job: &JobState, page: &PageState) -> ExecutionOutcome {
        if page.cancel_idle() {
            debug!(job_id = %job.id(), page_index = page.index, "Page cancelled before attempt");
            self.metrics.record_page("cancelled");
            ExecutionOutcome::Settled(PageStatus::Cancelled)
        } else {
            ExecutionOutcome::Skipped
        }
    }

    /// Cancels a page whose attempt this worker holds, instead of retrying.
    fn abandon_attempt(&self, job: &JobState, page: &PageState, attempt: u32) -> ExecutionOutcome {
        if !page.settle(PageOutcome::Cancelled) {
            return ExecutionOutcome::Skipped;
        }
        info!(
            job_id = %job.id(),
            page_index = page.index,
            attempt = attempt,
            "Job cancelled, page not retried"
        );
        self.metrics.record_page("cancelled");
        ExecutionOutcome::Settled(PageStatus::Cancelled)
    }
}
