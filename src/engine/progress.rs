//! Progress tracking.
//!
//! Page and batch events update the per-job [`ProgressCounters`] with
//! single atomic operations; a snapshot is assembled from those counters
//! without scanning pages. Counters only grow, so the completed fraction
//! of a job never decreases between snapshots.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{BatchStatus, JobStatus, PageStatus, StatusCode};
use crate::store::{JobState, ProgressCounters, StateStore};

/// Weight of the newest interval in the completion-rate moving average.
const EWMA_ALPHA: f64 = 0.2;

/// Batch counts of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub completed: usize,
    pub active: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Point-in-time progress of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Settled (completed or failed) pages over total pages, in [0, 1].
    pub fraction_complete: f64,
    /// Highest page index with a completed result. Completion is out of
    /// order, so lower pages may still be in progress.
    pub current_page_index: Option<usize>,
    pub total_pages: usize,
    pub pages_completed: usize,
    pub pages_failed: usize,
    pub batches: BatchCounts,
    pub estimated_seconds_remaining: Option<f64>,
    pub last_update: DateTime<Utc>,
}

/// Converts page and batch events into job progress.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    store: Arc<StateStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Records a page reaching a terminal status.
    pub fn record_page_completion(&self, job: &JobState, page_index: usize, outcome: PageStatus) {
        let counters = &job.progress;
        match outcome {
            PageStatus::Completed => {
                counters.pages_completed.fetch_add(1, Ordering::AcqRel);
                counters
                    .highest_completed
                    .fetch_max(page_index + 1, Ordering::AcqRel);
            }
            PageStatus::Failed => {
                counters.pages_failed.fetch_add(1, Ordering::AcqRel);
            }
            PageStatus::Cancelled => {
                counters.pages_cancelled.fetch_add(1, Ordering::AcqRel);
            }
            _ => return,
        }

        let now_us = job.elapsed().as_micros() as u64;
        let previous_us = counters.last_settled_us.swap(now_us, Ordering::AcqRel);
        let interval = now_us.saturating_sub(previous_us) as f64 / 1_000_000.0;
        let seeded = counters.interval_samples.fetch_add(1, Ordering::AcqRel) > 0;
        let _ = counters
            .avg_interval_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = if seeded {
                    EWMA_ALPHA * interval + (1.0 - EWMA_ALPHA) * f64::from_bits(bits)
                } else {
                    interval
                };
                Some(next.to_bits())
            });
        touch(counters);
    }

    /// Records an active batch reaching a terminal status.
    pub fn record_batch_settled(&self, job: &JobState, status: BatchStatus) {
        let counters = &job.progress;
        counters.batches_active.fetch_sub(1, Ordering::AcqRel);
        self.count_terminal_batch(counters, status);
    }

    /// Records a pending batch cancelled before dispatch.
    pub fn record_batch_cancelled(&self, job: &JobState) {
        self.count_terminal_batch(&job.progress, BatchStatus::Cancelled);
    }

    fn count_terminal_batch(&self, counters: &ProgressCounters, status: BatchStatus) {
        let counter = match status {
            BatchStatus::Completed => &counters.batches_completed,
            BatchStatus::Failed => &counters.batches_failed,
            BatchStatus::Cancelled => &counters.batches_cancelled,
            BatchStatus::Pending | BatchStatus::Active => return,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        touch(counters);
    }

    /// Snapshot of a registered job.
    pub fn snapshot(&self, job_id: &Uuid) -> Result<ProgressSnapshot, EngineError> {
        let job = self.store.get(job_id).ok_or(EngineError::NotFound(*job_id))?;
        Ok(Self::snapshot_of(&job))
    }

    pub fn snapshot_of(job: &JobState) -> ProgressSnapshot {
        let counters = &job.progress;
        let status = job.status();
        let total_pages = job.spec().total_pages;

        let completed = counters.pages_completed.load(Ordering::Acquire);
        let failed = counters.pages_failed.load(Ordering::Acquire);
        let cancelled = counters.pages_cancelled.load(Ordering::Acquire);
        let settled = completed + failed;

        let fraction_complete = if total_pages == 0 {
            0.0
        } else {
            (settled as f64 / total_pages as f64).min(1.0)
        };

        let current_page_index = match counters.highest_completed.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        };

        let remaining = total_pages.saturating_sub(settled + cancelled);
        let estimated_seconds_remaining = if status.is_terminal() || remaining == 0 {
            Some(0.0)
        } else if counters.interval_samples.load(Ordering::Acquire) > 0 {
            let average = f64::from_bits(counters.avg_interval_bits.load(Ordering::Acquire));
            Some(average * remaining as f64)
        } else {
            None
        };

        let last_update = match counters.last_update_ms.load(Ordering::Acquire) {
            0 => job.spec().created_at,
            ms => Utc
                .timestamp_millis_opt(ms)
                .single()
                .unwrap_or(job.spec().created_at),
        };

        ProgressSnapshot {
            job_id: job.id(),
            status,
            fraction_complete,
            current_page_index,
            total_pages,
            pages_completed: completed,
            pages_failed: failed,
            batches: BatchCounts {
                total: job.batches().len(),
                completed: counters.batches_completed.load(Ordering::Acquire),
                active: counters.batches_active.load(Ordering::Acquire),
                failed: counters.batches_failed.load(Ordering::Acquire),
                cancelled: counters.batches_cancelled.load(Ordering::Acquire),
            },
            estimated_seconds_remaining,
            last_update,
        }
    }
}

fn touch(counters: &ProgressCounters) {
    counters
        .last_update_ms
        .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailurePolicy, JobSpec, PageInput};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn job(total_pages: usize) -> JobState {
        let spec = JobSpec {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            doc_type: "pdf".to_string(),
            total_pages,
            batch_size: 25,
            policy: FailurePolicy::BestEffort,
            created_at: Utc::now(),
            fallback_text: None,
            generate_audio: false,
            selected_pages: None,
        };
        let inputs = (0..total_pages).map(|_| PageInput::png(vec![0])).collect();
        JobState::new(spec, vec![0..total_pages], inputs)
    }

    #[test]
    fn test_snapshot_of_fresh_job() {
        let store = Arc::new(StateStore::new());
        let state = store.insert(job(4)).expect("insert");
        let tracker = ProgressTracker::new(store);

        let snapshot = tracker.snapshot(&state.id()).expect("snapshot");
        assert_eq!(snapshot.fraction_complete, 0.0);
        assert_eq!(snapshot.current_page_index, None);
        assert_eq!(snapshot.estimated_seconds_remaining, None);
        assert_eq!(snapshot.batches.total, 1);
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert!(!snapshot.status.is_terminal());
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let tracker = ProgressTracker::new(Arc::new(StateStore::new()));
        assert!(matches!(
            tracker.snapshot(&Uuid::new_v4()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_highest_completed_is_not_contiguous() {
        let tracker = ProgressTracker::new(Arc::new(StateStore::new()));
        let job = job(10);

        tracker.record_page_completion(&job, 7, PageStatus::Completed);
        tracker.record_page_completion(&job, 2, PageStatus::Completed);
        tracker.record_page_completion(&job, 9, PageStatus::Failed);

        let snapshot = ProgressTracker::snapshot_of(&job);
        assert_eq!(snapshot.current_page_index, Some(7));
        assert_eq!(snapshot.pages_completed, 2);
        assert_eq!(snapshot.pages_failed, 1);
        assert!((snapshot.fraction_complete - 0.3).abs() < 1e-9);
        assert!(snapshot.estimated_seconds_remaining.is_some());
    }

    #[test]
    fn test_eta_available_after_back_to_back_completions() {
        let tracker = ProgressTracker::new(Arc::new(StateStore::new()));
        let job = job(100);

        // Settled well within one millisecond of each other.
        tracker.record_page_completion(&job, 0, PageStatus::Completed);
        tracker.record_page_completion(&job, 1, PageStatus::Completed);

        let snapshot = ProgressTracker::snapshot_of(&job);
        let eta = snapshot
            .estimated_seconds_remaining
            .expect("estimate after two completions");
        assert!(eta >= 0.0);
        assert_eq!(job.progress.interval_samples.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_eta_scales_with_remaining_pages() {
        let tracker = ProgressTracker::new(Arc::new(StateStore::new()));
        let job = job(10);

        std::thread::sleep(std::time::Duration::from_millis(20));
        tracker.record_page_completion(&job, 0, PageStatus::Completed);

        let eta = ProgressTracker::snapshot_of(&job)
            .estimated_seconds_remaining
            .expect("estimate");
        // First interval is at least 20ms, and 9 pages remain.
        assert!(eta >= 0.18 - 1e-6, "eta {} too small", eta);
    }

    #[test]
    fn test_fraction_is_monotonic_for_any_order() {
        let tracker = ProgressTracker::new(Arc::new(StateStore::new()));
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        for _ in 0..20 {
            let job = job(40);
            let mut order: Vec<usize> = (0..40).collect();
            order.shuffle(&mut rng);

            let mut last = 0.0;
            for (n, page) in order.into_iter().enumerate() {
                let outcome = if n % 7 == 0 {
                    PageStatus::Failed
                } else {
                    PageStatus::Completed
                };
                tracker.record_page_completion(&job, page, outcome);
                let fraction = ProgressTracker::snapshot_of(&job).fraction_complete;
                assert!(fraction >= last);
                last = fraction;
            }
            assert!((last - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_batch_counts() {
        let tracker = ProgressTracker::new(Arc::new(StateStore::new()));
        let job = job(3);
        assert!(job.activate_batch(0));
        assert_eq!(ProgressTracker::snapshot_of(&job).batches.active, 1);

        tracker.record_batch_settled(&job, BatchStatus::Failed);
        let counts = ProgressTracker::snapshot_of(&job).batches;
        assert_eq!(counts.active, 0);
        assert_eq!(counts.failed, 1);

        tracker.record_batch_cancelled(&job);
        assert_eq!(ProgressTracker::snapshot_of(&job).batches.cancelled, 1);
    }
}
