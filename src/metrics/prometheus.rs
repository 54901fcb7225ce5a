//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by pageforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all pageforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Page tasks settled, labeled by outcome (completed/failed/cancelled).
pub static PAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Latency of a single vision analysis attempt in seconds.
pub static PAGE_ANALYSIS_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Page attempts rescheduled after a transient failure.
pub static PAGE_RETRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Batches settled, labeled by terminal status.
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs accepted by submission.
pub static JOBS_SUBMITTED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Jobs settled, labeled by terminal status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Pending work items, labeled by channel.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Workers currently handling an item, labeled by channel.
pub static ACTIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Enqueues rejected by backpressure, labeled by channel.
pub static BACKPRESSURE_REJECTIONS: OnceLock<CounterVec> = OnceLock::new();

/// Work items parked after exhausting deliveries, labeled by channel.
pub static DEAD_LETTERED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// already-published statics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Page metrics
    let pages_total = CounterVec::new(
        Opts::new("pageforge_pages_total", "Page tasks settled by outcome"),
        &["outcome"],
    )?;

    let page_analysis_latency = Histogram::with_opts(
        HistogramOpts::new(
            "pageforge_page_analysis_seconds",
            "Latency of one vision analysis attempt in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )?;

    let page_retries_total = Counter::new(
        "pageforge_page_retries_total",
        "Page attempts rescheduled after a transient failure",
    )?;

    // Batch and job metrics
    let batches_total = CounterVec::new(
        Opts::new("pageforge_batches_total", "Batches settled by status"),
        &["status"],
    )?;

    let jobs_submitted_total = Counter::new(
        "pageforge_jobs_submitted_total",
        "Jobs accepted by submission",
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("pageforge_jobs_total", "Jobs settled by status"),
        &["status"],
    )?;

    let jobs_in_progress = Gauge::new(
        "pageforge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("pageforge_queue_depth", "Pending work items per channel"),
        &["channel"],
    )?;

    let active_workers = GaugeVec::new(
        Opts::new("pageforge_active_workers", "Busy workers per channel"),
        &["channel"],
    )?;

    let backpressure_rejections = CounterVec::new(
        Opts::new(
            "pageforge_backpressure_rejections_total",
            "Enqueues rejected because a channel was over its high-water mark",
        ),
        &["channel"],
    )?;

    let dead_lettered_total = CounterVec::new(
        Opts::new(
            "pageforge_dead_lettered_total",
            "Work items parked after exhausting deliveries",
        ),
        &["channel"],
    )?;

    registry.register(Box::new(pages_total.clone()))?;
    registry.register(Box::new(page_analysis_latency.clone()))?;
    registry.register(Box::new(page_retries_total.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(jobs_submitted_total.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(backpressure_rejections.clone()))?;
    registry.register(Box::new(dead_lettered_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = PAGES_TOTAL.set(pages_total);
    let _ = PAGE_ANALYSIS_LATENCY.set(page_analysis_latency);
    let _ = PAGE_RETRIES_TOTAL.set(page_retries_total);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = JOBS_SUBMITTED_TOTAL.set(jobs_submitted_total);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = BACKPRESSURE_REJECTIONS.set(backpressure_rejections);
    let _ = DEAD_LETTERED_TOTAL.set(dead_lettered_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
