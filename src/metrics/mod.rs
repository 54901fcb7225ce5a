//! Prometheus-based monitoring for the orchestration engine.
//!
//! Covers page outcomes and analysis latency, batch and job terminal
//! statuses, per-channel queue depth, worker activity and backpressure
//! rejections.
//!
//! # Example
//!
//! ```ignore
//! use pageforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_batch("completed");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
