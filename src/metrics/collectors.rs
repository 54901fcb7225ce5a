//! High-level metric recording for engine operations.
//!
//! The `MetricsCollector` wraps the raw Prometheus statics and keeps label
//! values consistent. Every method is a no-op until `init_metrics()` has run,
//! so library users and tests never have to initialize metrics.

use super::prometheus::{
    ACTIVE_WORKERS, BACKPRESSURE_REJECTIONS, BATCHES_TOTAL, DEAD_LETTERED_TOTAL,
    JOBS_IN_PROGRESS, JOBS_SUBMITTED_TOTAL, JOBS_TOTAL, PAGES_TOTAL, PAGE_ANALYSIS_LATENCY,
    PAGE_RETRIES_TOTAL, QUEUE_DEPTH,
};

/// Metrics collector for recording pageforge operational metrics.
///
/// # Example
///
/// ```ignore
/// use pageforge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_page("completed");
/// collector.observe_page_latency(2.4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a settled page task.
    ///
    /// `outcome` is the page's terminal status: "completed", "failed" or
    /// "cancelled".
    pub fn record_page(&self, outcome: &str) {
        if let Some(pages_total) = PAGES_TOTAL.get() {
            pages_total.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded page metric");
    }

    /// Record the latency of one vision analysis attempt.
    pub fn observe_page_latency(&self, latency_secs: f64) {
        if let Some(latency) = PAGE_ANALYSIS_LATENCY.get() {
            latency.observe(latency_secs);
        }
    }

    pub fn record_retry(&self) {
        if let Some(retries) = PAGE_RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    /// Record a batch reaching a terminal status.
    pub fn record_batch(&self, status: &str) {
        if let Some(batches_total) = BATCHES_TOTAL.get() {
            batches_total.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded batch metric");
    }

    /// Record a job accepted by submission.
    pub fn record_job_submitted(&self) {
        if let Some(submitted) = JOBS_SUBMITTED_TOTAL.get() {
            submitted.inc();
        }
    }

    /// Record a job reaching a terminal status.
    pub fn record_job(&self, status: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded job metric");
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }

    /// Update the pending depth of a channel.
    pub fn update_queue_depth(&self, channel: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[channel]).set(depth as f64);
        }

        tracing::trace!(channel = channel, depth = depth, "Updated queue depth metric");
    }

    /// Update the number of busy workers on a channel.
    pub fn update_active_workers(&self, channel: &str, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers
                .with_label_values(&[channel])
                .set(count as f64);
        }
    }

    pub fn record_backpressure(&self, channel: &str) {
        if let Some(rejections) = BACKPRESSURE_REJECTIONS.get() {
            rejections.with_label_values(&[channel]).inc();
        }

        tracing::trace!(channel = channel, "Recorded backpressure rejection");
    }

    pub fn record_dead_letter(&self, channel: &str) {
        if let Some(dead_lettered) = DEAD_LETTERED_TOTAL.get() {
            dead_lettered.with_label_values(&[channel]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_is_zero_sized() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_page_and_batch_recording() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_page("completed");
        collector.record_page("failed");
        collector.observe_page_latency(1.5);
        collector.record_retry();
        collector.record_batch("completed");
        collector.record_job("cancelled");
        collector.record_job_submitted();

        let text = export_metrics();
        assert!(text.contains("pageforge_batches_total"));
        assert!(text.contains("pageforge_jobs_submitted_total"));
        assert!(!text.contains("status=\"submitted\""));
        assert!(text.contains("pageforge_page_retries_total"));
    }

    #[test]
    fn test_queue_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth("page_processing", 42);
        collector.update_active_workers("page_processing", 3);
        collector.record_backpressure("batch_coordination");
        collector.record_dead_letter("document_processing");
        collector.inc_jobs_in_progress();
        collector.dec_jobs_in_progress();

        let text = export_metrics();
        assert!(text.contains("pageforge_queue_depth"));
        assert!(text.contains("batch_coordination"));
    }
}
