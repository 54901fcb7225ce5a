//! End-to-end scenarios for the orchestration engine.
//!
//! Most scenarios drive the in-memory queue by hand, handing each item to
//! the orchestrator the way a worker would, so interleavings are
//! deterministic. The remaining ones run the real worker pool.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use pageforge::analysis::{
    AnalysisError, AudioGenerator, JobReport, PageRequest, ResultSink, Summarizer,
    SummaryRequest, VisionAnalyzer,
};
use pageforge::engine::{EngineConfig, Orchestrator};
use pageforge::model::{
    BatchStatus, FailurePolicy, FinalResult, JobStatus, JobSubmission, PageInput, PageStatus,
    Summary,
};
use pageforge::scheduler::{
    Channel, ChannelLimits, InMemoryWorkQueue, Priority, PriorityClass, WorkHandler, WorkItem,
    WorkPayload, WorkQueue, WorkerPoolConfig,
};
use pageforge::EngineError;

// ============================================================================
// Mock collaborators
// ============================================================================

#[derive(Default)]
struct MockAnalyzer {
    transient_pages: HashSet<usize>,
    permanent_pages: HashSet<usize>,
    delay: Duration,
    calls: Mutex<HashMap<usize, u32>>,
}

impl MockAnalyzer {
    fn failing(transient: &[usize], permanent: &[usize]) -> Self {
        Self {
            transient_pages: transient.iter().copied().collect(),
            permanent_pages: permanent.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls_for(&self, page_index: usize) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&page_index)
            .copied()
            .unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl VisionAnalyzer for MockAnalyzer {
    async fn analyze(&self, request: PageRequest<'_>) -> Result<String, AnalysisError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.page_index)
            .or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.permanent_pages.contains(&request.page_index) {
            return Err(AnalysisError::Permanent(format!(
                "malformed image on page {}",
                request.page_number()
            )));
        }
        if self.transient_pages.contains(&request.page_index) {
            return Err(AnalysisError::Retryable("503 Service Unavailable".to_string()));
        }
        Ok(format!("analysis of page {}", request.page_number()))
    }
}

#[derive(Default)]
struct MockSummarizer {
    seen: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, request: SummaryRequest<'_>) -> Result<Summary, AnalysisError> {
        self.seen.lock().unwrap().push(request.page_texts.to_vec());
        Ok(Summary {
            summary: format!("{} pages summarized", request.page_texts.len()),
            elevator_pitch: "pitch".to_string(),
        })
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

#[derive(Default)]
struct RecordingAudio {
    jobs: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl AudioGenerator for RecordingAudio {
    async fn generate(&self, result: &FinalResult) -> Result<String, AnalysisError> {
        self.jobs.lock().unwrap().push(result.job_id);
        Ok(format!("audio/{}.mp3", result.job_id))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    queue: Arc<InMemoryWorkQueue>,
    analyzer: Arc<MockAnalyzer>,
    summarizer: Arc<MockSummarizer>,
    sink: Arc<CollectingSink>,
    orchestrator: Arc<Orchestrator>,
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_backoff(Duration::from_millis(2), Duration::from_millis(10))
        .with_jitter(0.0)
        .with_task_timeout(Duration::from_secs(5))
}

fn harness(config: EngineConfig, analyzer: MockAnalyzer) -> Harness {
    build(config, analyzer, None)
}

fn build(
    config: EngineConfig,
    analyzer: MockAnalyzer,
    audio: Option<Arc<RecordingAudio>>,
) -> Harness {
    let queue = Arc::new(InMemoryWorkQueue::new());
    let analyzer = Arc::new(analyzer);
    let summarizer = Arc::new(MockSummarizer::default());
    let sink = Arc::new(CollectingSink::default());
    let mut orchestrator = Orchestrator::new(
        config,
        queue.clone(),
        analyzer.clone(),
        summarizer.clone(),
    )
    .with_sink(sink.clone());
    if let Some(audio) = audio {
        orchestrator = orchestrator.with_audio(audio);
    }

    Harness {
        queue,
        analyzer,
        summarizer,
        sink,
        orchestrator: Arc::new(orchestrator),
    }
}

fn pages(n: usize) -> Vec<PageInput> {
    (0..n).map(|i| PageInput::png(vec![i as u8; 4])).collect()
}

fn submission(n: usize) -> JobSubmission {
    JobSubmission::new("owner-1", "pdf").with_pages(pages(n))
}

/// Takes one item from `channel`, handles and acknowledges it.
async fn handle_one(h: &Harness, channel: Channel) -> Option<WorkItem> {
    let item = h
        .queue
        .dequeue(channel, Duration::from_millis(1))
        .await
        .expect("dequeue")?;
    h.orchestrator.handle(&item).await.expect("handle");
    h.queue.ack(channel, item.id).await.expect("ack");
    Some(item)
}

/// Handles items until every channel stays empty, delayed retries included.
async fn drain(h: &Harness) {
    let mut idle_rounds = 0;
    while idle_rounds < 5 {
        let mut handled = false;
        for channel in Channel::ALL {
            while handle_one(h, channel).await.is_some() {
                handled = true;
            }
        }
        if handled {
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn wait_terminal(h: &Harness, job_id: &Uuid) -> JobStatus {
    tokio::time::timeout(
        Duration::from_secs(20),
        h.orchestrator
            .wait_for_terminal(job_id, Duration::from_millis(10)),
    )
    .await
    .expect("job did not finish in time")
    .expect("job is known")
}

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(5))
}

// ============================================================================
// Worker pool scenarios
// ============================================================================

#[tokio::test]
async fn test_sixty_pages_run_as_three_batches_with_ordered_result() {
    let h = harness(config(), MockAnalyzer::default());
    let mut pool = h.orchestrator.worker_pool(pool_config());
    pool.start().await.expect("pool start");

    let job_id = h.orchestrator.submit_job(submission(60)).await.expect("submit");

    let sizes: Vec<usize> = (0..3)
        .map(|i| {
            h.orchestrator
                .store()
                .batch_record(&job_id, i)
                .map(|b| b.range().len())
                .unwrap_or(0)
        })
        .collect();
    assert_eq!(sizes, vec![25, 25, 10]);
    assert!(h.orchestrator.store().batch_record(&job_id, 3).is_none());

    // Fraction complete never goes backwards while workers run.
    let poller = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move {
            let mut last = 0.0;
            loop {
                let snapshot = orchestrator.get_job_progress(&job_id).expect("progress");
                assert!(
                    snapshot.fraction_complete >= last,
                    "fraction went from {} to {}",
                    last,
                    snapshot.fraction_complete
                );
                last = snapshot.fraction_complete;
                if snapshot.status == JobStatus::Completed {
                    return last;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    assert_eq!(wait_terminal(&h, &job_id).await, JobStatus::Completed);
    let last_fraction = tokio::time::timeout(Duration::from_secs(5), poller)
        .await
        .expect("poller finished")
        .expect("poller panicked");
    assert!((last_fraction - 1.0).abs() < 1e-9);

    let result = h.orchestrator.get_job_result(&job_id).expect("result");
    assert_eq!(result.pages.len(), 60);
    for (i, entry) in result.pages.iter().enumerate() {
        assert_eq!(entry.page_index, i);
        assert_eq!(entry.text.as_deref(), Some(format!("analysis of page {}", i + 1).as_str()));
    }
    assert!(result.gaps().is_empty());
    assert_eq!(result.metadata.pages_processed, 60);
    assert_eq!(result.summary.summary, "60 pages summarized");

    let snapshot = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(snapshot.current_page_index, Some(59));
    assert_eq!(snapshot.batches.completed, 3);
    assert_eq!(snapshot.batches.active, 0);

    pool.shutdown().await.expect("shutdown");
    let stats = h.orchestrator.get_queue_stats().await.expect("stats");
    let pages = stats
        .iter()
        .find(|s| s.channel == Channel::PageAnalysis)
        .expect("page channel");
    assert_eq!(pages.processed, 60);
    assert_eq!(pages.depth, 0);
    assert_eq!(h.sink.reports.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_page_failing_all_attempts_leaves_gap_under_best_effort() {
    let h = harness(config(), MockAnalyzer::failing(&[7], &[]));
    let mut pool = h.orchestrator.worker_pool(pool_config());
    pool.start().await.expect("pool start");

    let job_id = h.orchestrator.submit_job(submission(12)).await.expect("submit");
    assert_eq!(wait_terminal(&h, &job_id).await, JobStatus::Completed);
    pool.shutdown().await.expect("shutdown");

    let result = h.orchestrator.get_job_result(&job_id).expect("result");
    assert_eq!(result.pages.len(), 12);
    assert_eq!(result.gaps(), vec![7]);
    assert_eq!(result.metadata.pages_failed, 1);
    assert_eq!(result.metadata.pages_processed, 11);
    assert!(result
        .content
        .contains("**Page 8 Analysis:**\nError processing this page: 503 Service Unavailable"));

    assert_eq!(h.analyzer.calls_for(7), 5);
    let page = h
        .orchestrator
        .store()
        .page_record(&job_id, 7)
        .expect("page record");
    assert_eq!(page.status, PageStatus::Failed);
    assert_eq!(page.attempts, 5);

    let snapshot = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(snapshot.pages_failed, 1);
    assert_eq!(snapshot.batches.failed, 1);
}

// ============================================================================
// Hand-driven scenarios
// ============================================================================

#[tokio::test]
async fn test_duplicate_job_id_is_rejected_without_new_batches() {
    let h = harness(config(), MockAnalyzer::default());
    let job_id = Uuid::new_v4();

    h.orchestrator
        .submit_job(submission(60).with_job_id(job_id))
        .await
        .expect("first submit");
    let err = h
        .orchestrator
        .submit_job(submission(60).with_job_id(job_id))
        .await
        .expect_err("second submit");

    assert!(matches!(err, EngineError::DuplicateJob(id) if id == job_id));
    assert_eq!(h.orchestrator.store().len(), 1);
    assert_eq!(
        h.queue.depth(Channel::BatchCoordination).await.expect("depth"),
        3
    );
}

#[tokio::test]
async fn test_cancel_with_two_active_batches() {
    let h = harness(
        config().with_batch_size(2).with_batching_threshold(0),
        MockAnalyzer::default(),
    );
    let job_id = h.orchestrator.submit_job(submission(8)).await.expect("submit");
    assert_eq!(
        h.queue.depth(Channel::BatchCoordination).await.expect("depth"),
        4
    );

    // Two batches get dispatched before the cancellation arrives.
    handle_one(&h, Channel::BatchCoordination).await.expect("batch 0");
    handle_one(&h, Channel::BatchCoordination).await.expect("batch 1");
    assert_eq!(
        h.orchestrator.get_job_progress(&job_id).expect("progress").batches.active,
        2
    );

    let previous = h.orchestrator.cancel_job(&job_id).await.expect("cancel");
    assert_eq!(previous, JobStatus::Processing);

    let snapshot = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(snapshot.batches.cancelled, 2);
    assert_eq!(snapshot.batches.active, 2);
    assert_eq!(snapshot.status, JobStatus::Processing);
    assert!(matches!(
        h.orchestrator.get_job_result(&job_id),
        Err(EngineError::NotReady(_))
    ));

    drain(&h).await;

    assert_eq!(h.analyzer.total_calls(), 0);
    let snapshot = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert_eq!(snapshot.batches.cancelled, 4);
    for i in 0..4 {
        assert_eq!(
            h.orchestrator
                .store()
                .batch_record(&job_id, i)
                .map(|b| b.status),
            Some(BatchStatus::Cancelled)
        );
    }
    assert!(matches!(
        h.orchestrator.get_job_result(&job_id),
        Err(EngineError::JobCancelled(_))
    ));
    assert_eq!(
        h.orchestrator.cancel_job(&job_id).await.expect("cancel again"),
        JobStatus::Cancelled
    );

    let reports = h.sink.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, JobStatus::Cancelled);
    assert!(reports[0].result.is_none());
}

#[tokio::test]
async fn test_cancel_lets_in_flight_attempt_finish() {
    let h = harness(
        config().with_batch_size(2).with_batching_threshold(0),
        MockAnalyzer::default().slow(Duration::from_millis(150)),
    );
    let job_id = h.orchestrator.submit_job(submission(4)).await.expect("submit");
    handle_one(&h, Channel::BatchCoordination).await.expect("batch 0");

    let page_zero = h
        .queue
        .dequeue(Channel::PageAnalysis, Duration::from_millis(1))
        .await
        .expect("dequeue")
        .expect("page 0 item");
    let in_flight = {
        let orchestrator = h.orchestrator.clone();
        let item = page_zero.clone();
        tokio::spawn(async move { orchestrator.handle(&item).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        h.orchestrator.cancel_job(&job_id).await.expect("cancel"),
        JobStatus::Processing
    );

    // A redelivery of the running page must not settle it a second time.
    h.orchestrator.handle(&page_zero).await.expect("redelivery");
    let snapshot = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(snapshot.batches.active, 1);
    assert_eq!(snapshot.batches.cancelled, 1);
    assert_eq!(snapshot.pages_completed, 0);

    in_flight.await.expect("task panicked").expect("handle");
    assert_eq!(h.analyzer.calls_for(0), 1);
    assert_eq!(
        h.orchestrator
            .store()
            .page_record(&job_id, 0)
            .map(|p| p.status),
        Some(PageStatus::Completed)
    );

    drain(&h).await;

    assert_eq!(h.analyzer.total_calls(), 1);
    let snapshot = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert_eq!(snapshot.pages_completed, 1);
    assert_eq!(snapshot.batches.active, 0);
    assert_eq!(snapshot.batches.cancelled, 2);

    let batch = h
        .orchestrator
        .store()
        .batch_record(&job_id, 0)
        .expect("batch 0");
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.pages_completed, 1);
    let statuses: Vec<PageStatus> = (0..4)
        .filter_map(|i| h.orchestrator.store().page_record(&job_id, i))
        .map(|p| p.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            PageStatus::Completed,
            PageStatus::Cancelled,
            PageStatus::Cancelled,
            PageStatus::Cancelled
        ]
    );
    assert_eq!(h.sink.reports.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_stops_retries_of_in_flight_page() {
    let h = harness(
        config(),
        MockAnalyzer::failing(&[0], &[]).slow(Duration::from_millis(100)),
    );
    let job_id = h.orchestrator.submit_job(submission(2)).await.expect("submit");
    handle_one(&h, Channel::BatchCoordination).await.expect("dispatch");

    let page_zero = h
        .queue
        .dequeue(Channel::PageAnalysis, Duration::from_millis(1))
        .await
        .expect("dequeue")
        .expect("page 0 item");
    let in_flight = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle(&page_zero).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.orchestrator.cancel_job(&job_id).await.expect("cancel");
    in_flight.await.expect("task panicked").expect("handle");

    drain(&h).await;

    assert_eq!(h.analyzer.calls_for(0), 1);
    assert_eq!(h.analyzer.calls_for(1), 0);
    let page = h
        .orchestrator
        .store()
        .page_record(&job_id, 0)
        .expect("page 0");
    assert_eq!(page.status, PageStatus::Cancelled);
    assert_eq!(page.attempts, 1);
    assert_eq!(
        h.orchestrator.get_job_progress(&job_id).expect("progress").status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn test_duplicate_deliveries_do_not_double_count() {
    let h = harness(config(), MockAnalyzer::default());
    let job_id = h.orchestrator.submit_job(submission(3)).await.expect("submit");

    let dispatch = handle_one(&h, Channel::BatchCoordination)
        .await
        .expect("dispatch item");
    // Redelivered dispatch before any page started.
    h.orchestrator.handle(&dispatch).await.expect("redelivery");
    assert_eq!(h.queue.depth(Channel::PageAnalysis).await.expect("depth"), 6);

    let page_item = handle_one(&h, Channel::PageAnalysis).await.expect("page item");
    h.orchestrator.handle(&page_item).await.expect("redelivery");

    drain(&h).await;

    for page in 0..3 {
        assert_eq!(h.analyzer.calls_for(page), 1, "page {} analyzed twice", page);
    }
    let snapshot = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(snapshot.pages_completed, 3);
    assert!((snapshot.fraction_complete - 1.0).abs() < 1e-9);
    assert_eq!(snapshot.status, JobStatus::Completed);

    // A late duplicate finalize changes nothing.
    let finalize = WorkItem::new(
        WorkPayload::FinalizeJob { job_id },
        Priority::by_age(PriorityClass::High, Utc::now()),
    );
    h.orchestrator.handle(&finalize).await.expect("finalize");
    assert_eq!(h.sink.reports.lock().unwrap().len(), 1);
    assert_eq!(h.summarizer.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_fail_fast_reports_first_failure() {
    let h = harness(
        config().with_batch_size(2).with_batching_threshold(0),
        MockAnalyzer::failing(&[], &[1]),
    );
    let job_id = h
        .orchestrator
        .submit_job(submission(4).with_policy(FailurePolicy::FailFast))
        .await
        .expect("submit");

    drain(&h).await;

    assert_eq!(h.analyzer.calls_for(1), 1);
    match h.orchestrator.get_job_result(&job_id) {
        Err(EngineError::JobFailed {
            pages_failed,
            first_failure,
            ..
        }) => {
            assert_eq!(pages_failed, 1);
            assert_eq!(first_failure.as_deref(), Some("page 2: malformed image on page 2"));
        }
        other => panic!("expected JobFailed, got {:?}", other),
    }
    let err = h.orchestrator.get_job_result(&job_id).expect_err("failed job");
    assert!(err.to_string().contains("malformed image"));

    let reports = h.sink.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, JobStatus::Failed);
    assert!(h.summarizer.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_backpressure_rejects_new_jobs_only() {
    let mut limits = ChannelLimits::default();
    limits.set(Channel::BatchCoordination, 1);
    let h = harness(config().with_channel_limits(limits), MockAnalyzer::default());

    h.orchestrator.submit_job(submission(60)).await.expect("first job admitted");

    let rejected_id = Uuid::new_v4();
    let err = h
        .orchestrator
        .submit_job(submission(60).with_job_id(rejected_id))
        .await
        .expect_err("channel over capacity");
    assert!(matches!(
        err,
        EngineError::Backpressure {
            channel: Channel::BatchCoordination,
            depth: 3,
            high_water: 1
        }
    ));
    assert!(err.is_retryable());
    assert!(matches!(
        h.orchestrator.get_job_progress(&rejected_id),
        Err(EngineError::NotFound(_))
    ));

    // Text-only jobs seed the page channel, which still has room.
    h.orchestrator
        .submit_job(JobSubmission::new("owner-1", "txt").with_fallback_text("notes"))
        .await
        .expect("text job admitted");
}

#[tokio::test]
async fn test_text_only_job_skips_vision() {
    let h = harness(config(), MockAnalyzer::default());
    let job_id = h
        .orchestrator
        .submit_job(JobSubmission::new("owner-1", "txt").with_fallback_text("plain text body"))
        .await
        .expect("submit");
    assert_eq!(
        h.queue.depth(Channel::BatchCoordination).await.expect("depth"),
        0
    );
    assert_eq!(h.queue.depth(Channel::PageAnalysis).await.expect("depth"), 1);

    drain(&h).await;

    assert_eq!(h.analyzer.total_calls(), 0);
    let result = h.orchestrator.get_job_result(&job_id).expect("result");
    assert_eq!(result.pages.len(), 1);
    assert_eq!(result.content, "**Page 1 Analysis:**\nplain text body\n\n");
    assert_eq!(
        h.summarizer.seen.lock().unwrap().as_slice(),
        &[vec!["plain text body".to_string()]]
    );
}

#[tokio::test]
async fn test_selected_pages_keep_document_page_numbers() {
    let h = harness(config(), MockAnalyzer::failing(&[], &[1]));
    let job_id = h
        .orchestrator
        .submit_job(submission(20).with_selected_pages(vec![14, 3, 7]))
        .await
        .expect("submit");

    drain(&h).await;

    assert_eq!(h.analyzer.total_calls(), 3);
    let progress = h.orchestrator.get_job_progress(&job_id).expect("progress");
    assert_eq!(progress.total_pages, 3);

    let result = h.orchestrator.get_job_result(&job_id).expect("result");
    let numbers: Vec<usize> = result.pages.iter().map(|p| p.page_number).collect();
    assert_eq!(numbers, vec![14, 3, 7]);
    assert_eq!(result.gaps(), vec![1]);
    assert_eq!(result.metadata.total_pages, 3);
    assert!(result
        .content
        .starts_with("**Page 14 Analysis:**\nanalysis of page 1\n\n"));
    assert!(result.content.contains("**Page 3 Analysis:**\nError processing this page"));
    assert!(result.content.contains("**Page 7 Analysis:**\nanalysis of page 3"));
}

#[tokio::test]
async fn test_out_of_range_selection_is_rejected() {
    let h = harness(config(), MockAnalyzer::default());
    let err = h
        .orchestrator
        .submit_job(submission(5).with_selected_pages(vec![2, 6]))
        .await
        .expect_err("page 6 of 5");
    assert!(matches!(err, EngineError::InvalidJob(_)));
    assert!(err.to_string().contains("1-5"));
    assert!(h.orchestrator.store().is_empty());
}

#[tokio::test]
async fn test_invalid_submission() {
    let h = harness(config(), MockAnalyzer::default());
    let err = h
        .orchestrator
        .submit_job(JobSubmission::new("owner-1", "pdf"))
        .await
        .expect_err("empty job");
    assert!(matches!(err, EngineError::InvalidJob(_)));
    assert!(h.orchestrator.store().is_empty());
}

#[tokio::test]
async fn test_unknown_job_lookups() {
    let h = harness(config(), MockAnalyzer::default());
    let unknown = Uuid::new_v4();
    assert!(matches!(
        h.orchestrator.get_job_progress(&unknown),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.get_job_result(&unknown),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.cancel_job(&unknown).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_evict_only_terminal_jobs() {
    let h = harness(config(), MockAnalyzer::default());
    let done = h.orchestrator.submit_job(submission(2)).await.expect("submit");
    drain(&h).await;

    let running = h.orchestrator.submit_job(submission(2)).await.expect("submit");
    assert!(matches!(
        h.orchestrator.evict_job(&running),
        Err(EngineError::NotReady(_))
    ));

    h.orchestrator.evict_job(&done).expect("evict");
    assert!(matches!(
        h.orchestrator.get_job_result(&done),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(h.orchestrator.store().len(), 1);
}

#[tokio::test]
async fn test_queue_stats_cover_all_channels() {
    let h = harness(config(), MockAnalyzer::default());
    h.orchestrator.submit_job(submission(60)).await.expect("submit");

    let stats = h.orchestrator.get_queue_stats().await.expect("stats");
    assert_eq!(stats.len(), Channel::ALL.len());
    let batches = stats
        .iter()
        .find(|s| s.channel == Channel::BatchCoordination)
        .expect("batch channel");
    assert_eq!(batches.depth, 3);
    assert_eq!(batches.high_water, 500);
    assert_eq!(batches.active_workers, 0);
}

#[tokio::test]
async fn test_audio_follow_up_for_completed_job() {
    let audio = Arc::new(RecordingAudio::default());
    let h = build(config(), MockAnalyzer::default(), Some(audio.clone()));

    let job_id = h
        .orchestrator
        .submit_job(submission(2).with_audio())
        .await
        .expect("submit");
    drain(&h).await;

    assert_eq!(audio.jobs.lock().unwrap().as_slice(), &[job_id]);
    assert_eq!(h.analyzer.total_calls(), 2);
    assert_eq!(h.sink.reports.lock().unwrap().len(), 1);
}
