//! Result aggregation.
//!
//! Runs on the orchestration channel once every batch of a job is
//! terminal. A job still `processing` at that point has no fail-fast
//! failure and no cancellation, so its pages are assembled in page order,
//! summarized and published as the final result. Every terminal job,
//! whatever its status, is reported to the [`ResultSink`] exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::analysis::{JobReport, ResultSink, Summarizer, SummaryRequest};
use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::model::{
    FinalResult, JobStatus, PageEntry, PageOutcome, ResultMetadata, StatusCode, Summary,
};
use crate::scheduler::{Priority, PriorityClass, QueueRouter, WorkItem, WorkPayload};
use crate::store::JobState;

use super::coordinator::finish_job;

/// Orders page results and builds the final payload of a job.
pub struct ResultAggregator {
    summarizer: Arc<dyn Summarizer>,
    sink: Arc<dyn ResultSink>,
    router: Arc<QueueRouter>,
    summary_timeout: Duration,
    metrics: MetricsCollector,
}

impl ResultAggregator {
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        sink: Arc<dyn ResultSink>,
        router: Arc<QueueRouter>,
        summary_timeout: Duration,
    ) -> Self {
        Self {
            summarizer,
            sink,
            router,
            summary_timeout,
            metrics: MetricsCollector::new(),
        }
    }

    /// Finalizes a job whose batches have all settled.
    pub async fn finalize(&self, job: &JobState) -> Result<(), EngineError> {
        if job.is_cancel_requested() {
            finish_job(job, JobStatus::Cancelled, &self.metrics);
        }

        match job.status() {
            JobStatus::Processing => self.aggregate(job).await,
            JobStatus::Queued => {
                warn!(job_id = %job.id(), "Finalize requested for a job that never started");
                return Ok(());
            }
            _ => {}
        }

        if job.status().is_terminal() && job.claim_report() {
            self.report(job).await;
            if job.status() == JobStatus::Completed && job.spec().generate_audio {
                let item = WorkItem::new(
                    WorkPayload::GenerateAudio { job_id: job.id() },
                    Priority::by_age(PriorityClass::Normal, job.spec().created_at),
                );
                self.router.route(item).await?;
            }
        }
        Ok(())
    }

    async fn aggregate(&self, job: &JobState) {
        let spec = job.spec();
        let pages = ordered_entries(job);
        let content = render_content(&pages);
        let page_texts: Vec<String> = pages.iter().filter_map(|p| p.text.clone()).collect();
        let pages_failed = pages.len() - page_texts.len();

        let request = SummaryRequest {
            job_id: spec.id,
            doc_type: &spec.doc_type,
            total_pages: spec.total_pages,
            page_texts: &page_texts,
            content: &content,
        };
        let summary = match tokio::time::timeout(
            self.summary_timeout,
            self.summarizer.summarize(request),
        )
        .await
        {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                warn!(job_id = %spec.id, error = %e, "Summarizer failed, using fallback summary");
                fallback_summary(&spec.doc_type, spec.total_pages, page_texts.len())
            }
            Err(_) => {
                warn!(job_id = %spec.id, "Summarizer timed out, using fallback summary");
                fallback_summary(&spec.doc_type, spec.total_pages, page_texts.len())
            }
        };

        // Cancellation may land while the summarizer runs.
        if job.is_cancel_requested() {
            if finish_job(job, JobStatus::Cancelled, &self.metrics) {
                info!(job_id = %spec.id, "Job cancelled during aggregation");
            }
            return;
        }

        let result = FinalResult {
            job_id: spec.id,
            owner_id: spec.owner_id.clone(),
            doc_type: spec.doc_type.clone(),
            metadata: ResultMetadata {
                total_pages: spec.total_pages,
                pages_processed: page_texts.len(),
                pages_failed,
                processing_time_ms: job.elapsed().as_millis() as u64,
                completed_at: Utc::now(),
            },
            pages,
            content,
            summary,
        };

        // The result is published before the status flips so a reader that
        // sees `completed` always finds it.
        if !job.set_result(result) {
            warn!(job_id = %spec.id, "Result already set");
        }
        if finish_job(job, JobStatus::Completed, &self.metrics) {
            info!(
                job_id = %spec.id,
                pages_processed = page_texts.len(),
                pages_failed = pages_failed,
                elapsed_ms = job.elapsed().as_millis() as u64,
                "Job completed"
            );
        }
    }

    async fn report(&self, job: &JobState) {
        let report = JobReport {
            job_id: job.id(),
            owner_id: job.spec().owner_id.clone(),
            status: job.status(),
            result: job.result().cloned(),
            processing_time: job.elapsed().as_secs_f64(),
            pages_processed: job
                .progress
                .pages_completed
                .load(std::sync::atomic::Ordering::Acquire),
            completed_at: job.finished_at().unwrap_or_else(Utc::now),
        };
        if let Err(e) = self.sink.deliver(&report).await {
            error!(job_id = %job.id(), error = %e, "Failed to deliver job report");
        }
    }
}

/// One entry per page, ordered by page index. Pages without a completed
/// result become gaps.
pub fn ordered_entries(job: &JobState) -> Vec<PageEntry> {
    let spec = job.spec();
    let mut entries: Vec<PageEntry> = job
        .pages()
        .iter()
        .map(|page| match page.outcome() {
            Some(PageOutcome::Completed { text }) => PageEntry {
                page_index: page.index,
                page_number: spec.page_number(page.index),
                text: Some(text.clone()),
                error: None,
            },
            Some(PageOutcome::Failed { error, .. }) => PageEntry {
                page_index: page.index,
                page_number: spec.page_number(page.index),
                text: None,
                error: Some(error.clone()),
            },
            Some(PageOutcome::Cancelled) | None => PageEntry {
                page_index: page.index,
                page_number: spec.page_number(page.index),
                text: None,
                error: Some("page was not processed".to_string()),
            },
        })
        .collect();
    entries.sort_by_key(|entry| entry.page_index);
    entries
}

/// Renders the content payload: one section per page, headed by its
/// document page number.
pub fn render_content(pages: &[PageEntry]) -> String {
    pages
        .iter()
        .map(|entry| {
            let body = match (&entry.text, &entry.error) {
                (Some(text), _) => text.clone(),
                (None, Some(error)) => format!("Error processing this page: {}", error),
                (None, None) => "Error processing this page".to_string(),
            };
            format!("**Page {} Analysis:**\n{}\n\n", entry.page_number, body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Summary used when the summarizer is unavailable.
pub fn fallback_summary(doc_type: &str, total_pages: usize, pages_processed: usize) -> Summary {
    Summary {
        summary: format!(
            "Analysis of {}-page {} document completed. Processed {} pages.",
            total_pages, doc_type, pages_processed
        ),
        elevator_pitch: format!(
            "Document analysis completed with {} pages processed successfully.",
            pages_processed
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisError;
    use crate::model::{FailurePolicy, JobSpec, PageInput};
    use crate::scheduler::{Channel, ChannelLimits, InMemoryWorkQueue, WorkQueue};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct FixedSummarizer {
        reply: Result<Summary, AnalysisError>,
        seen: Mutex<Vec<usize>>,
        delay: Duration,
    }

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, request: SummaryRequest<'_>) -> Result<Summary, AnalysisError> {
            self.seen.lock().unwrap().push(request.page_texts.len());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone()
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<JobReport>>,
    }

    #[async_trait]
    impl ResultSink for CollectingSink {
        async fn deliver(&self, report: &JobReport) -> anyhow::Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    fn job(total_pages: usize, generate_audio: bool) -> JobState {
        let spec = JobSpec {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            doc_type: "pdf".to_string(),
            total_pages,
            batch_size: 25,
            policy: FailurePolicy::BestEffort,
            created_at: Utc::now(),
            fallback_text: None,
            generate_audio,
            selected_pages: None,
        };
        let inputs = (0..total_pages).map(|_| PageInput::png(vec![0])).collect();
        JobState::new(spec, vec![0..total_pages], inputs)
    }

    fn settle_all(job: &JobState, failed: &[usize]) {
        assert!(job.activate_batch(0));
        // Settle out of order.
        for page in job.pages().iter().rev() {
            let outcome = if failed.contains(&page.index) {
                PageOutcome::Failed {
                    error: "unreadable".to_string(),
                    attempts: 5,
                }
            } else {
                PageOutcome::Completed {
                    text: format!("text {}", page.index),
                }
            };
            assert!(page.settle(outcome));
        }
    }

    fn aggregator(
        reply: Result<Summary, AnalysisError>,
    ) -> (Arc<InMemoryWorkQueue>, Arc<CollectingSink>, ResultAggregator) {
        slow_aggregator(reply, Duration::ZERO)
    }

    fn slow_aggregator(
        reply: Result<Summary, AnalysisError>,
        delay: Duration,
    ) -> (Arc<InMemoryWorkQueue>, Arc<CollectingSink>, ResultAggregator) {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let router = Arc::new(QueueRouter::new(queue.clone(), ChannelLimits::default()));
        let sink = Arc::new(CollectingSink::default());
        let summarizer = Arc::new(FixedSummarizer {
            reply,
            seen: Mutex::new(Vec::new()),
            delay,
        });
        let aggregator =
            ResultAggregator::new(summarizer, sink.clone(), router, Duration::from_secs(5));
        (queue, sink, aggregator)
    }

    #[tokio::test]
    async fn test_finalize_orders_pages_and_marks_gaps() {
        let summary = Summary {
            summary: "short".to_string(),
            elevator_pitch: "pitch".to_string(),
        };
        let (_queue, sink, aggregator) = aggregator(Ok(summary.clone()));
        let job = job(4, false);
        settle_all(&job, &[2]);

        aggregator.finalize(&job).await.expect("finalize");

        assert_eq!(job.status(), JobStatus::Completed);
        let result = job.result().expect("result");
        let indices: Vec<usize> = result.pages.iter().map(|p| p.page_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(result.gaps(), vec![2]);
        assert_eq!(result.metadata.pages_processed, 3);
        assert_eq!(result.metadata.pages_failed, 1);
        assert_eq!(result.summary, summary);
        assert!(result
            .content
            .starts_with("**Page 1 Analysis:**\ntext 0\n\n"));
        assert!(result
            .content
            .contains("**Page 3 Analysis:**\nError processing this page: unreadable"));

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_summarizer_failure_uses_fallback() {
        let (_queue, _sink, aggregator) =
            aggregator(Err(AnalysisError::Retryable("503".to_string())));
        let job = job(2, false);
        settle_all(&job, &[]);

        aggregator.finalize(&job).await.expect("finalize");
        let result = job.result().expect("result");
        assert_eq!(
            result.summary.summary,
            "Analysis of 2-page pdf document completed. Processed 2 pages."
        );
        assert_eq!(
            result.summary.elevator_pitch,
            "Document analysis completed with 2 pages processed successfully."
        );
    }

    #[tokio::test]
    async fn test_duplicate_finalize_reports_once() {
        let (queue, sink, aggregator) = aggregator(Ok(Summary::default()));
        let job = job(1, true);
        settle_all(&job, &[]);

        aggregator.finalize(&job).await.expect("finalize");
        aggregator.finalize(&job).await.expect("finalize again");

        assert_eq!(sink.reports.lock().unwrap().len(), 1);
        assert_eq!(queue.depth(Channel::AudioGeneration).await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_not_aggregated() {
        let (_queue, sink, aggregator) = aggregator(Ok(Summary::default()));
        let job = job(2, false);
        settle_all(&job, &[]);
        job.request_cancel();

        aggregator.finalize(&job).await.expect("finalize");
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.result().is_none());

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports[0].status, JobStatus::Cancelled);
        assert!(reports[0].result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_summary_wins() {
        let (queue, sink, aggregator) =
            slow_aggregator(Ok(Summary::default()), Duration::from_millis(80));
        let job = job(2, true);
        settle_all(&job, &[]);

        let finalize = aggregator.finalize(&job);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            job.request_cancel();
        };
        let (finalized, ()) = tokio::join!(finalize, cancel);
        finalized.expect("finalize");

        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.result().is_none());
        assert_eq!(queue.depth(Channel::AudioGeneration).await.expect("depth"), 0);
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, JobStatus::Cancelled);
    }

    #[test]
    fn test_entries_carry_selected_page_numbers() {
        let spec = JobSpec {
            selected_pages: Some(vec![5, 2, 9]),
            ..job(3, false).spec().clone()
        };
        let inputs = (0..3).map(|_| PageInput::png(vec![0])).collect();
        let job = JobState::new(spec, vec![0..3], inputs);
        settle_all(&job, &[1]);

        let entries = ordered_entries(&job);
        let numbers: Vec<usize> = entries.iter().map(|e| e.page_number).collect();
        assert_eq!(numbers, vec![5, 2, 9]);

        let content = render_content(&entries);
        assert!(content.starts_with("**Page 5 Analysis:**\ntext 0\n\n"));
        assert!(content.contains("**Page 2 Analysis:**\nError processing this page: unreadable"));
        assert!(content.contains("**Page 9 Analysis:**\ntext 2"));
    }

    #[test]
    fn test_render_content_joins_sections() {
        let pages = vec![
            PageEntry {
                page_index: 0,
                page_number: 1,
                text: Some("a".to_string()),
                error: None,
            },
            PageEntry {
                page_index: 1,
                page_number: 2,
                text: Some("b".to_string()),
                error: None,
            },
        ];
        assert_eq!(
            render_content(&pages),
            "**Page 1 Analysis:**\na\n\n\n**Page 2 Analysis:**\nb\n\n"
        );
    }
}
