//! Queue router with per-channel backpressure.
//!
//! The router is the only producer-side entry to the work queue. It picks
//! the channel for an item from its kind alone and refuses new low-priority
//! work while a channel is over its high-water mark. Continuations and
//! control events are always accepted so admitted jobs can finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::EngineError;
use crate::metrics::MetricsCollector;

use super::queue::WorkQueue;
use super::work::{Channel, WorkItem, WorkKind};
use super::worker_pool::WorkerActivity;

/// Maps a kind of work to its channel.
pub fn channel_for(kind: WorkKind) -> Channel {
    match kind {
        WorkKind::PageAnalysis => Channel::PageAnalysis,
        WorkKind::BatchCoordination => Channel::BatchCoordination,
        WorkKind::Orchestration => Channel::Orchestration,
        WorkKind::AudioGeneration => Channel::AudioGeneration,
    }
}

/// High-water marks, in pending items, per channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLimits {
    pub page_analysis: usize,
    pub batch_coordination: usize,
    pub orchestration: usize,
    pub audio_generation: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            page_analysis: 5000,
            batch_coordination: 500,
            orchestration: 500,
            audio_generation: 200,
        }
    }
}

impl ChannelLimits {
    /// Same mark on every channel.
    pub fn uniform(high_water: usize) -> Self {
        Self {
            page_analysis: high_water,
            batch_coordination: high_water,
            orchestration: high_water,
            audio_generation: high_water,
        }
    }

    pub fn high_water(&self, channel: Channel) -> usize {
        match channel {
            Channel::PageAnalysis => self.page_analysis,
            Channel::BatchCoordination => self.batch_coordination,
            Channel::Orchestration => self.orchestration,
            Channel::AudioGeneration => self.audio_generation,
        }
    }

    pub fn set(&mut self, channel: Channel, high_water: usize) {
        match channel {
            Channel::PageAnalysis => self.page_analysis = high_water,
            Channel::BatchCoordination => self.batch_coordination = high_water,
            Channel::Orchestration => self.orchestration = high_water,
            Channel::AudioGeneration => self.audio_generation = high_water,
        }
    }
}

/// Queue and worker figures for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel: Channel,
    pub depth: usize,
    pub in_flight: usize,
    pub dead_letter: usize,
    pub high_water: usize,
    pub workers: usize,
    pub active_workers: usize,
    pub processed: u64,
    pub failed: u64,
}

/// Routes work items to channels and enforces backpressure.
pub struct QueueRouter {
    queue: Arc<dyn WorkQueue>,
    limits: ChannelLimits,
    activity: Arc<WorkerActivity>,
    metrics: MetricsCollector,
}

impl QueueRouter {
    pub fn new(queue: Arc<dyn WorkQueue>, limits: ChannelLimits) -> Self {
        Self {
            queue,
            limits,
            activity: Arc::new(WorkerActivity::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn limits(&self) -> &ChannelLimits {
        &self.limits
    }

    /// Worker activity shared with the pool that consumes these channels.
    pub fn activity(&self) -> Arc<WorkerActivity> {
        Arc::clone(&self.activity)
    }

    /// Routes one item and returns the channel it landed on.
    pub async fn route(&self, item: WorkItem) -> Result<Channel, EngineError> {
        let channel = item.channel();
        if item.priority.is_rejectable() {
            self.check_capacity(channel).await?;
        }
        debug!(channel = %channel, item_id = %item.id, job_id = %item.payload.job_id(), "Routing work item");
        self.queue.enqueue(channel, item).await?;
        Ok(channel)
    }

    /// Routes a group of items with all-or-nothing admission.
    ///
    /// Capacity is checked for every channel that receives a low-priority
    /// item before anything is enqueued, so a rejected group leaves no
    /// partial work behind.
    pub async fn route_all(&self, items: Vec<WorkItem>) -> Result<(), EngineError> {
        let mut by_channel: BTreeMap<Channel, Vec<WorkItem>> = BTreeMap::new();
        for item in items {
            by_channel.entry(item.channel()).or_default().push(item);
        }

        for (channel, items) in &by_channel {
            if items.iter().any(|item| item.priority.is_rejectable()) {
                self.check_capacity(*channel).await?;
            }
        }

        for (channel, items) in by_channel {
            debug!(channel = %channel, count = items.len(), "Routing work items");
            self.queue.enqueue_batch(channel, items).await?;
        }
        Ok(())
    }

    /// Routes an item after `delay` without blocking the caller.
    ///
    /// Used for retry backoff. Delayed items are continuations and skip the
    /// capacity check.
    pub fn route_after(&self, item: WorkItem, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let channel = item.channel();
            let item_id = item.id;
            if let Err(e) = queue.enqueue(channel, item).await {
                error!(channel = %channel, item_id = %item_id, error = %e, "Failed to enqueue delayed work item");
            }
        });
    }

    async fn check_capacity(&self, channel: Channel) -> Result<(), EngineError> {
        let depth = self.queue.depth(channel).await?;
        let high_water = self.limits.high_water(channel);
        self.metrics.update_queue_depth(channel.name(), depth);

        if depth > high_water {
            self.metrics.record_backpressure(channel.name());
            warn!(channel = %channel, depth = depth, high_water = high_water, "Rejecting work: channel over capacity");
            return Err(EngineError::Backpressure {
                channel,
                depth,
                high_water,
            });
        }
        Ok(())
    }

    /// Per-channel depth and worker activity.
    pub async fn stats(&self) -> Result<Vec<ChannelStats>, EngineError> {
        let mut stats = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let queue = self.queue.stats(channel).await?;
            let pool = self.activity.snapshot(channel);
            self.metrics.update_queue_depth(channel.name(), queue.pending);
            self.metrics
                .update_active_workers(channel.name(), pool.active_workers);

            stats.push(ChannelStats {
                channel,
                depth: queue.pending,
                in_flight: queue.in_flight,
                dead_letter: queue.dead_letter,
                high_water: self.limits.high_water(channel),
                workers: pool.num_workers,
                active_workers: pool.active_workers,
                processed: pool.items_completed,
                failed: pool.items_failed,
            });
        }
        Ok(stats)
    }
}
