//! Per-job shared state.
//!
//! A `JobState` is created once at submission with every batch and page
//! pre-registered. After that nothing is added or removed; all mutation
//! happens through atomics (status compare-and-set, counter increments,
//! write-once result cells), so workers touching different pages of the
//! same job never contend on a lock.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    AtomicStatus, BatchRecord, BatchStatus, FinalResult, JobRecord, JobSpec, JobStatus,
    PageInput, PageOutcome, PageRecord, PageStatus, StatusCode,
};

const NON_TERMINAL_PAGE: [PageStatus; 3] = [
    PageStatus::Pending,
    PageStatus::Running,
    PageStatus::RetryScheduled,
];

/// Aggregate progress counters for one job.
///
/// Updated with `fetch_add`/`fetch_max` by whichever worker settles a page
/// or batch; read by the progress tracker to build snapshots.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub pages_completed: AtomicUsize,
    pub pages_failed: AtomicUsize,
    pub pages_cancelled: AtomicUsize,
    /// Highest completed page index plus one; zero while nothing completed.
    pub highest_completed: AtomicUsize,
    pub batches_active: AtomicUsize,
    pub batches_completed: AtomicUsize,
    pub batches_failed: AtomicUsize,
    pub batches_cancelled: AtomicUsize,
    /// Moving average of the interval between page settlements, in
    /// seconds, as `f64` bits.
    pub avg_interval_bits: AtomicU64,
    /// Intervals folded into the moving average so far.
    pub interval_samples: AtomicU64,
    /// Microseconds since job start of the previous page settlement.
    pub last_settled_us: AtomicU64,
    /// Unix milliseconds of the last counter update.
    pub last_update_ms: AtomicI64,
}

/// Shared state of one batch.
#[derive(Debug)]
pub struct BatchState {
    pub id: Uuid,
    pub index: usize,
    pub range: Range<usize>,
    pub status: AtomicStatus<BatchStatus>,
    remaining: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl BatchState {
    fn new(job_id: Uuid, index: usize, range: Range<usize>) -> Self {
        Self {
            id: Uuid::new_v5(&job_id, format!("batch-{}", index).as_bytes()),
            index,
            remaining: AtomicUsize::new(range.len()),
            range,
            status: AtomicStatus::new(BatchStatus::Pending),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Counts one settled page and decrements the remaining count.
    ///
    /// Returns `true` for exactly one caller: the one whose page drove the
    /// remaining count to zero.
    pub fn settle_page(&self, status: PageStatus) -> bool {
        match status {
            PageStatus::Completed => self.completed.fetch_add(1, Ordering::AcqRel),
            PageStatus::Failed => self.failed.fetch_add(1, Ordering::AcqRel),
            _ => self.cancelled.fetch_add(1, Ordering::AcqRel),
        };
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Terminal status once every page has settled.
    pub fn settled_status(&self, cancel_requested: bool) -> BatchStatus {
        if cancel_requested || self.cancelled.load(Ordering::Acquire) > 0 {
            BatchStatus::Cancelled
        } else if self.failed.load(Ordering::Acquire) > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        }
    }

    pub fn pages_completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn pages_failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    pub fn pages_remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn to_record(&self, job_id: Uuid) -> BatchRecord {
        BatchRecord {
            id: self.id,
            job_id,
            index: self.index,
            start: self.range.start,
            end: self.range.end,
            status: self.status.load(),
            pages_completed: self.pages_completed(),
            pages_failed: self.pages_failed(),
        }
    }
}

/// Shared state of one page task.
#[derive(Debug)]
pub struct PageState {
    pub id: Uuid,
    pub index: usize,
    pub batch_index: usize,
    pub input: PageInput,
    pub status: AtomicStatus<PageStatus>,
    attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
    outcome: OnceLock<PageOutcome>,
}

impl PageState {
    fn new(job_id: Uuid, index: usize, batch_index: usize, input: PageInput) -> Self {
        Self {
            id: Uuid::new_v5(&job_id, format!("page-{}", index).as_bytes()),
            index,
            batch_index,
            input,
            status: AtomicStatus::new(PageStatus::Pending),
            attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
            outcome: OnceLock::new(),
        }
    }

    /// Claims the page for an attempt and returns the attempt number.
    ///
    /// Returns `None` if the page is already running elsewhere or terminal,
    /// which is how duplicate deliveries are ignored.
    pub fn begin_attempt(&self) -> Option<u32> {
        self.status
            .transition(
                &[PageStatus::Pending, PageStatus::RetryScheduled],
                PageStatus::Running,
            )
            .ok()
            .map(|_| self.attempts.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Records a transient failure and parks the page until its retry runs.
    pub fn schedule_retry(&self, error: impl Into<String>) -> bool {
        self.set_last_error(error.into());
        self.status
            .compare_and_set(PageStatus::Running, PageStatus::RetryScheduled)
            .is_ok()
    }

    /// Moves the page to its terminal state. Only the first caller wins.
    pub fn settle(&self, outcome: PageOutcome) -> bool {
        if self
            .status
            .transition(&NON_TERMINAL_PAGE, outcome.status())
            .is_err()
        {
            return false;
        }
        if let PageOutcome::Failed { error, .. } = &outcome {
            self.set_last_error(error.clone());
        }
        let _ = self.outcome.set(outcome);
        true
    }

    /// Cancels a page that no worker is running.
    ///
    /// Returns `false` if the page is running or already terminal. A running
    /// attempt settles its own page through [`PageState::settle`].
    pub fn cancel_idle(&self) -> bool {
        if self
            .status
            .transition(
                &[PageStatus::Pending, PageStatus::RetryScheduled],
                PageStatus::Cancelled,
            )
            .is_err()
        {
            return false;
        }
        let _ = self.outcome.set(PageOutcome::Cancelled);
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn outcome(&self) -> Option<&PageOutcome> {
        self.outcome.get()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("page error lock poisoned")
            .clone()
    }

    fn set_last_error(&self, error: String) {
        *self.last_error.lock().expect("page error lock poisoned") = Some(error);
    }

    pub fn to_record(&self, batch_id: Uuid) -> PageRecord {
        let result = match self.outcome() {
            Some(PageOutcome::Completed { text }) => Some(text.clone()),
            _ => None,
        };
        PageRecord {
            id: self.id,
            batch_id,
            page_index: self.index,
            input_ref: self.input.describe(),
            status: self.status.load(),
            attempts: self.attempts(),
            last_error: self.last_error(),
            result,
        }
    }
}

/// Shared state of one job, its batches and its pages.
#[derive(Debug)]
pub struct JobState {
    spec: JobSpec,
    pub status: AtomicStatus<JobStatus>,
    cancel_requested: AtomicBool,
    remaining_batches: AtomicUsize,
    batches: Vec<BatchState>,
    pages: Vec<PageState>,
    pub progress: ProgressCounters,
    first_failure: OnceLock<String>,
    result: OnceLock<FinalResult>,
    reported: AtomicBool,
    started: Instant,
    finished_at: OnceLock<DateTime<Utc>>,
}

impl JobState {
    /// Builds a job with every batch and page pre-registered.
    ///
    /// `ranges` must partition `0..inputs.len()` in order.
    pub fn new(spec: JobSpec, ranges: Vec<Range<usize>>, inputs: Vec<PageInput>) -> Self {
        let job_id = spec.id;
        let mut batch_of_page = vec![0; inputs.len()];
        for (batch_index, range) in ranges.iter().enumerate() {
            for page in range.clone() {
                if let Some(slot) = batch_of_page.get_mut(page) {
                    *slot = batch_index;
                }
            }
        }

        let pages = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| PageState::new(job_id, index, batch_of_page[index], input))
            .collect();
        let batches: Vec<BatchState> = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| BatchState::new(job_id, index, range))
            .collect();

        Self {
            spec,
            status: AtomicStatus::new(JobStatus::Queued),
            cancel_requested: AtomicBool::new(false),
            remaining_batches: AtomicUsize::new(batches.len()),
            batches,
            pages,
            progress: ProgressCounters::default(),
            first_failure: OnceLock::new(),
            result: OnceLock::new(),
            reported: AtomicBool::new(false),
            started: Instant::now(),
            finished_at: OnceLock::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.spec.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn status(&self) -> JobStatus {
        self.status.load()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Raises the cancellation flag. Returns `false` if it was already set.
    pub fn request_cancel(&self) -> bool {
        !self.cancel_requested.swap(true, Ordering::AcqRel)
    }

    /// Whether workers should stop doing new work for this job.
    pub fn should_abandon(&self) -> bool {
        self.is_cancel_requested() || self.status().is_terminal()
    }

    pub fn batches(&self) -> &[BatchState] {
        &self.batches
    }

    pub fn batch(&self, index: usize) -> Option<&BatchState> {
        self.batches.get(index)
    }

    pub fn pages(&self) -> &[PageState] {
        &self.pages
    }

    pub fn page(&self, index: usize) -> Option<&PageState> {
        self.pages.get(index)
    }

    /// Moves a batch from `pending` to `active` and the job to `processing`.
    ///
    /// Returns `false` if the batch was not pending, e.g. already dispatched
    /// by an earlier delivery or swept by cancellation.
    pub fn activate_batch(&self, index: usize) -> bool {
        let Some(batch) = self.batch(index) else {
            return false;
        };
        if batch
            .status
            .compare_and_set(BatchStatus::Pending, BatchStatus::Active)
            .is_err()
        {
            return false;
        }
        self.progress.batches_active.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .status
            .compare_and_set(JobStatus::Queued, JobStatus::Processing);
        true
    }

    /// Counts one batch as terminal. Returns `true` for the last one.
    pub fn retire_batch(&self) -> bool {
        self.remaining_batches.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn batches_remaining(&self) -> usize {
        self.remaining_batches.load(Ordering::Acquire)
    }

    /// Keeps the first permanent failure detail; later ones are dropped.
    pub fn record_first_failure(&self, detail: impl Into<String>) {
        let _ = self.first_failure.set(detail.into());
    }

    pub fn first_failure(&self) -> Option<&str> {
        self.first_failure.get().map(String::as_str)
    }

    pub fn set_result(&self, result: FinalResult) -> bool {
        self.result.set(result).is_ok()
    }

    pub fn result(&self) -> Option<&FinalResult> {
        self.result.get()
    }

    /// Claims the right to deliver the job's report. Only the first caller wins.
    pub fn claim_report(&self) -> bool {
        !self.reported.swap(true, Ordering::AcqRel)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn mark_finished(&self) {
        let _ = self.finished_at.set(Utc::now());
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at.get().copied()
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            spec: self.spec.clone(),
            status: self.status(),
            cancel_requested: self.is_cancel_requested(),
            batch_ids: self.batches.iter().map(|b| b.id).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailurePolicy;

    fn spec(total_pages: usize) -> JobSpec {
        JobSpec {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            doc_type: "pdf".to_string(),
            total_pages,
            batch_size: 2,
            policy: FailurePolicy::BestEffort,
            created_at: Utc::now(),
            fallback_text: None,
            generate_audio: false,
            selected_pages: None,
        }
    }

    fn inputs(n: usize) -> Vec<PageInput> {
        (0..n).map(|i| PageInput::png(vec![i as u8])).collect()
    }

    #[test]
    fn test_job_state_registers_batches_and_pages() {
        let job = JobState::new(spec(5), vec![0..2, 2..4, 4..5], inputs(5));

        assert_eq!(job.batches().len(), 3);
        assert_eq!(job.pages().len(), 5);
        assert_eq!(job.batches_remaining(), 3);
        assert_eq!(job.page(3).map(|p| p.batch_index), Some(1));
        assert_eq!(job.page(4).map(|p| p.batch_index), Some(2));
        assert_eq!(job.status(), JobStatus::Queued);

        let ids: std::collections::HashSet<_> = job.batches().iter().map(|b| b.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_batch_settle_last_page_closes() {
        let job = JobState::new(spec(3), vec![0..3], inputs(3));
        let batch = job.batch(0).expect("batch");

        assert!(!batch.settle_page(PageStatus::Completed));
        assert!(!batch.settle_page(PageStatus::Failed));
        assert!(batch.settle_page(PageStatus::Completed));
        assert_eq!(batch.settled_status(false), BatchStatus::Failed);
        assert_eq!(batch.settled_status(true), BatchStatus::Cancelled);
        assert_eq!(batch.pages_completed(), 2);
        assert_eq!(batch.pages_failed(), 1);
    }

    #[test]
    fn test_batch_settle_concurrent_single_closer() {
        let job = std::sync::Arc::new(JobState::new(spec(64), vec![0..64], inputs(64)));
        let closers = std::sync::Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let job = job.clone();
                let closers = closers.clone();
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        if job
                            .batch(0)
                            .map(|b| b.settle_page(PageStatus::Completed))
                            .unwrap_or(false)
                        {
                            closers.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(closers.load(Ordering::SeqCst), 1);
        assert_eq!(job.batch(0).map(|b| b.pages_remaining()), Some(0));
    }

    #[test]
    fn test_page_attempt_claims_are_exclusive() {
        let job = JobState::new(spec(1), vec![0..1], inputs(1));
        let page = job.page(0).expect("page");

        assert_eq!(page.begin_attempt(), Some(1));
        assert_eq!(page.begin_attempt(), None);

        assert!(page.schedule_retry("rate limited"));
        assert_eq!(page.last_error().as_deref(), Some("rate limited"));
        assert_eq!(page.begin_attempt(), Some(2));

        assert!(page.settle(PageOutcome::Completed {
            text: "done".to_string()
        }));
        assert!(!page.settle(PageOutcome::Cancelled));
        assert_eq!(page.status.load(), PageStatus::Completed);
        assert_eq!(page.begin_attempt(), None);

        let record = page.to_record(Uuid::nil());
        assert_eq!(record.attempts, 2);
        assert_eq!(record.result.as_deref(), Some("done"));
    }

    #[test]
    fn test_cancel_idle_leaves_running_page_to_its_worker() {
        let job = JobState::new(spec(3), vec![0..3], inputs(3));

        let running = job.page(0).expect("page 0");
        assert_eq!(running.begin_attempt(), Some(1));
        assert!(!running.cancel_idle());
        assert_eq!(running.status.load(), PageStatus::Running);
        assert!(running.settle(PageOutcome::Completed {
            text: "done".to_string()
        }));

        let waiting = job.page(1).expect("page 1");
        assert_eq!(waiting.begin_attempt(), Some(1));
        assert!(waiting.schedule_retry("503"));
        assert!(waiting.cancel_idle());
        assert_eq!(waiting.outcome(), Some(&PageOutcome::Cancelled));

        let pending = job.page(2).expect("page 2");
        assert!(pending.cancel_idle());
        assert!(!pending.cancel_idle());
        assert_eq!(pending.begin_attempt(), None);
    }

    #[test]
    fn test_cancel_flag_and_first_failure() {
        let job = JobState::new(spec(2), vec![0..2], inputs(2));
        assert!(!job.should_abandon());
        assert!(job.request_cancel());
        assert!(!job.request_cancel());
        assert!(job.should_abandon());

        job.record_first_failure("page 1: broken");
        job.record_first_failure("page 2: broken");
        assert_eq!(job.first_failure(), Some("page 1: broken"));
    }

    #[test]
    fn test_activate_batch_once() {
        let job = JobState::new(spec(4), vec![0..2, 2..4], inputs(4));
        assert!(job.activate_batch(1));
        assert!(!job.activate_batch(1));
        assert!(!job.activate_batch(7));
        assert_eq!(job.status(), JobStatus::Processing);
        assert_eq!(job.batch(1).map(|b| b.status.load()), Some(BatchStatus::Active));
        assert_eq!(job.progress.batches_active.load(Ordering::SeqCst), 1);

        let first = job.batch(0).expect("batch 0");
        assert!(first
            .status
            .compare_and_set(BatchStatus::Pending, BatchStatus::Cancelled)
            .is_ok());
        assert!(!job.activate_batch(0));

        assert!(job.claim_report());
        assert!(!job.claim_report());
    }

    #[test]
    fn test_retire_batch_last() {
        let job = JobState::new(spec(4), vec![0..2, 2..4], inputs(4));
        assert!(!job.retire_batch());
        assert!(job.retire_batch());
    }
}
