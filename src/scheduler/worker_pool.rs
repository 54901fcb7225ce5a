//! Worker pool consuming the named channels of a work queue.
//!
//! Each channel gets its own set of workers, sized by configuration, which
//! is how channels map to dedicated capacity. Every worker runs as an
//! independent async task, pulls one item at a time and hands it to a
//! [`WorkHandler`].
//!
//! # Features
//!
//! - Per-channel worker counts
//! - Graceful shutdown with broadcast channel
//! - Redelivery of items whose handler returned an error
//! - Dead letter list for items that keep failing
//! - Per-channel activity statistics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::metrics::MetricsCollector;

use super::queue::{QueueError, WorkQueue};
use super::work::{Channel, WorkItem};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Processes one delivered work item.
///
/// Returning `Err` means the item could not be handled because of an
/// infrastructure problem; the pool redelivers it. Outcomes of the work
/// itself, including failures, are recorded by the handler and reported
/// as `Ok`.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> Result<(), EngineError>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub page_workers: usize,
    pub batch_workers: usize,
    pub orchestration_workers: usize,
    pub audio_workers: usize,
    /// How long a worker waits on an empty channel before checking for
    /// shutdown again.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Deliveries allowed before an item is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            page_workers: 8,
            batch_workers: 2,
            orchestration_workers: 2,
            audio_workers: 1,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            max_deliveries: 3,
        }
    }
}

impl WorkerPoolConfig {
    /// Sets the worker count of one channel.
    pub fn with_workers(mut self, channel: Channel, count: usize) -> Self {
        match channel {
            Channel::PageAnalysis => self.page_workers = count,
            Channel::BatchCoordination => self.batch_workers = count,
            Channel::Orchestration => self.orchestration_workers = count,
            Channel::AudioGeneration => self.audio_workers = count,
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    pub fn workers_for(&self, channel: Channel) -> usize {
        match channel {
            Channel::PageAnalysis => self.page_workers,
            Channel::BatchCoordination => self.batch_workers,
            Channel::Orchestration => self.orchestration_workers,
            Channel::AudioGeneration => self.audio_workers,
        }
    }

    pub fn total_workers(&self) -> usize {
        Channel::ALL.iter().map(|c| self.workers_for(*c)).sum()
    }
}

/// Statistics about the workers of one channel.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently handling an item.
    pub active_workers: usize,
    pub items_completed: u64,
    /// Deliveries whose handler returned an error.
    pub items_failed: u64,
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of items processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.items_completed + self.items_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / total as f64) * 100.0
    }
}

/// Shared counters for the workers of one channel.
#[derive(Debug, Default)]
struct SharedPoolStats {
    workers: AtomicU64,
    items_completed: AtomicU64,
    items_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.items_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.items_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self) -> PoolStats {
        let completed = self.items_completed.load(Ordering::SeqCst);
        let failed = self.items_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers: self.workers.load(Ordering::SeqCst) as usize,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            items_completed: completed,
            items_failed: failed,
            average_duration,
        }
    }
}

/// Worker activity for every channel.
///
/// Shared between the pool, which updates it, and the queue router, which
/// reports it.
#[derive(Debug, Default)]
pub struct WorkerActivity {
    channels: [SharedPoolStats; 4],
}

impl WorkerActivity {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, channel: Channel) -> &SharedPoolStats {
        let slot = match channel {
            Channel::PageAnalysis => 0,
            Channel::BatchCoordination => 1,
            Channel::Orchestration => 2,
            Channel::AudioGeneration => 3,
        };
        &self.channels[slot]
    }

    pub fn snapshot(&self, channel: Channel) -> PoolStats {
        self.channel(channel).to_pool_stats()
    }
}

/// Worker pool that runs the configured workers of every channel.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn WorkHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    activity: Arc<WorkerActivity>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn WorkQueue>,
        handler: Arc<dyn WorkHandler>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            activity: Arc::new(WorkerActivity::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Reports activity into an existing tracker, typically the router's.
    pub fn with_activity(mut self, activity: Arc<WorkerActivity>) -> Self {
        self.activity = activity;
        self
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for channel in Channel::ALL {
            let count = self.config.workers_for(channel);
            if count == 0 {
                continue;
            }

            // Recover items stuck in flight from previous runs
            match self
                .queue
                .recover_in_flight(channel, self.config.max_deliveries)
                .await
            {
                Ok(recovered) if recovered > 0 => {
                    info!(channel = %channel, recovered = recovered, "Recovered in-flight work items");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to recover in-flight work items");
                }
            }

            let stats = self.activity.channel(channel);
            stats.workers.store(count as u64, Ordering::SeqCst);

            for i in 0..count {
                let worker = Worker {
                    id: format!("{}-{}", channel.name(), i),
                    channel,
                    queue: Arc::clone(&self.queue),
                    handler: Arc::clone(&self.handler),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    poll_interval: self.config.poll_interval,
                    max_deliveries: self.config.max_deliveries,
                    activity: Arc::clone(&self.activity),
                    metrics: MetricsCollector::new(),
                };

                self.worker_handles.push(tokio::spawn(worker.run()));
            }
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.total_workers(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the item they are handling before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let shutdown_future = async move {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        for channel in Channel::ALL {
            self.activity
                .channel(channel)
                .workers
                .store(0, Ordering::SeqCst);
        }

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self, channel: Channel) -> PoolStats {
        self.activity.snapshot(channel)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

/// A single worker bound to one channel.
struct Worker {
    id: String,
    channel: Channel,
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn WorkHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    max_deliveries: u32,
    activity: Arc<WorkerActivity>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Polls the channel until a shutdown signal is received.
    async fn run(mut self) {
        debug!(worker_id = %self.id, channel = %self.channel, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    debug!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.channel, self.poll_interval).await {
                Ok(Some(item)) => self.process(item).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue work item");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, mut item: WorkItem) {
        let stats = self.activity.channel(self.channel);
        let start_time = Instant::now();

        let active = stats.increment_active();
        self.metrics
            .update_active_workers(self.channel.name(), active as usize);

        let result = self.handler.handle(&item).await;
        let duration = start_time.elapsed();

        let active = stats.decrement_active();
        self.metrics
            .update_active_workers(self.channel.name(), active as usize);

        match result {
            Ok(()) => {
                stats.record_completion(duration);
                if let Err(e) = self.queue.ack(self.channel, item.id).await {
                    warn!(worker_id = %self.id, item_id = %item.id, error = %e, "Failed to acknowledge work item");
                }
            }
            Err(e) => {
                stats.record_failure(duration);
                item.increment_deliveries();

                if item.should_redeliver(self.max_deliveries) {
                    warn!(
                        worker_id = %self.id,
                        item_id = %item.id,
                        job_id = %item.payload.job_id(),
                        error = %e,
                        deliveries = item.deliveries,
                        "Work item failed, requeueing"
                    );
                    let item_id = item.id;
                    if let Err(requeue_err) = self.queue.requeue(self.channel, item).await {
                        error!(worker_id = %self.id, item_id = %item_id, error = %requeue_err, "Failed to requeue work item");
                    }
                } else {
                    error!(
                        worker_id = %self.id,
                        item_id = %item.id,
                        job_id = %item.payload.job_id(),
                        error = %e,
                        "Work item failed, moving to dead letter"
                    );
                    self.metrics.record_dead_letter(self.channel.name());
                    let item_id = item.id;
                    if let Err(dlq_err) = self
                        .queue
                        .dead_letter(self.channel, item, &e.to_string())
                        .await
                    {
                        error!(worker_id = %self.id, item_id = %item_id, error = %dlq_err, "Failed to move work item to dead letter");
                    }
                }
            }
        }
    }
}
