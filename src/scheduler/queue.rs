//! Work queue abstraction and in-memory backend.
//!
//! The engine talks to its queue through the [`WorkQueue`] trait:
//!
//! - `enqueue` adds an item to a named channel
//! - `dequeue` hands the highest-priority item to a consumer and tracks it
//!   as in flight until it is acknowledged
//! - `requeue` / `dead_letter` resolve items whose handler failed
//!
//! Delivery is at-least-once. Consumers must tolerate seeing an item more
//! than once.
//!
//! [`InMemoryWorkQueue`] keeps one priority heap per channel behind a
//! short-lived mutex and wakes waiting consumers with a [`Notify`]. It is
//! used for single-process runs and tests; see
//! [`RedisWorkQueue`](super::redis_queue::RedisWorkQueue) for the
//! distributed backend.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use super::work::{Channel, Priority, WorkItem};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the queue backend.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a work item.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Item is not tracked as in flight on the channel.
    #[error("Work item {0} not found")]
    ItemNotFound(Uuid),
}

/// A queue with named channels and at-least-once delivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Adds an item to a channel.
    async fn enqueue(&self, channel: Channel, item: WorkItem) -> Result<(), QueueError>;

    /// Adds several items to a channel in one operation.
    async fn enqueue_batch(&self, channel: Channel, items: Vec<WorkItem>) -> Result<(), QueueError> {
        for item in items {
            self.enqueue(channel, item).await?;
        }
        Ok(())
    }

    /// Takes the next item, waiting up to `timeout` for one to arrive.
    ///
    /// The item stays tracked as in flight until `ack`, `requeue` or
    /// `dead_letter` is called for it.
    async fn dequeue(
        &self,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, QueueError>;

    /// Acknowledges a delivered item.
    async fn ack(&self, channel: Channel, item_id: Uuid) -> Result<(), QueueError>;

    /// Puts a delivered item back on its channel.
    async fn requeue(&self, channel: Channel, item: WorkItem) -> Result<(), QueueError>;

    /// Parks a delivered item in the channel's dead letter list.
    async fn dead_letter(
        &self,
        channel: Channel,
        item: WorkItem,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Moves items left in flight by crashed consumers back to pending.
    ///
    /// Items that already used `max_deliveries` are dead-lettered instead.
    /// Returns the number of items put back.
    async fn recover_in_flight(
        &self,
        _channel: Channel,
        _max_deliveries: u32,
    ) -> Result<usize, QueueError> {
        Ok(0)
    }

    /// Counts for one channel.
    async fn stats(&self, channel: Channel) -> Result<QueueStats, QueueError>;

    /// Number of items waiting on a channel.
    async fn depth(&self, channel: Channel) -> Result<usize, QueueError> {
        Ok(self.stats(channel).await?.pending)
    }
}

/// Statistics about one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub channel: Channel,
    /// Items waiting to be delivered.
    pub pending: usize,
    /// Items delivered but not yet acknowledged.
    pub in_flight: usize,
    /// Items parked after exhausting their deliveries.
    pub dead_letter: usize,
}

impl QueueStats {
    pub fn empty(channel: Channel) -> Self {
        Self {
            channel,
            pending: 0,
            in_flight: 0,
            dead_letter: 0,
        }
    }

    /// Returns the total number of items in all states.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.dead_letter
    }
}

/// An item parked after its handler kept failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub item: WorkItem,
    pub error: String,
    pub moved_at: DateTime<Utc>,
}

/// Heap entry: higher priority first, then FIFO by sequence number.
#[derive(Debug)]
struct Pending {
    priority: Priority,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Lane {
    pending: BinaryHeap<Pending>,
    in_flight: HashMap<Uuid, WorkItem>,
    dead_letter: Vec<DeadLetterEntry>,
}

/// Process-local priority queue with one lane per channel.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    lanes: Mutex<HashMap<Channel, Lane>>,
    signals: HashMap<Channel, Notify>,
    seq: AtomicU64,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            signals: Channel::ALL.into_iter().map(|c| (c, Notify::new())).collect(),
            seq: AtomicU64::new(0),
        }
    }

    fn push(&self, channel: Channel, item: WorkItem) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut lanes = self.lanes.lock().expect("queue lock poisoned");
            lanes.entry(channel).or_default().pending.push(Pending {
                priority: item.priority,
                seq,
                item,
            });
        }
        if let Some(signal) = self.signals.get(&channel) {
            signal.notify_one();
        }
    }

    fn pop(&self, channel: Channel) -> Option<WorkItem> {
        let mut lanes = self.lanes.lock().expect("queue lock poisoned");
        let lane = lanes.get_mut(&channel)?;
        let entry = lane.pending.pop()?;
        lane.in_flight.insert(entry.item.id, entry.item.clone());
        Some(entry.item)
    }

    fn take_in_flight(&self, channel: Channel, item_id: Uuid) -> Option<WorkItem> {
        let mut lanes = self.lanes.lock().expect("queue lock poisoned");
        lanes.get_mut(&channel)?.in_flight.remove(&item_id)
    }

    /// Returns up to `limit` dead letter entries without removing them.
    pub fn peek_dead_letter(&self, channel: Channel, limit: usize) -> Vec<DeadLetterEntry> {
        let lanes = self.lanes.lock().expect("queue lock poisoned");
        lanes
            .get(&channel)
            .map(|lane| lane.dead_letter.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, channel: Channel, item: WorkItem) -> Result<(), QueueError> {
        self.push(channel, item);
        Ok(())
    }

    async fn dequeue(
        &self,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let Some(signal) = self.signals.get(&channel) else {
            return Ok(None);
        };

        loop {
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.pop(channel) {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.pop(channel));
            }
        }
    }

    async fn ack(&self, channel: Channel, item_id: Uuid) -> Result<(), QueueError> {
        self.take_in_flight(channel, item_id)
            .map(|_| ())
            .ok_or(QueueError::ItemNotFound(item_id))
    }

    async fn requeue(&self, channel: Channel, item: WorkItem) -> Result<(), QueueError> {
        self.take_in_flight(channel, item.id);
        self.push(channel, item);
        Ok(())
    }

    async fn dead_letter(
        &self,
        channel: Channel,
        item: WorkItem,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut lanes = self.lanes.lock().expect("queue lock poisoned");
        let lane = lanes.entry(channel).or_default();
        lane.in_flight.remove(&item.id);
        lane.dead_letter.push(DeadLetterEntry {
            item,
            error: error.to_string(),
            moved_at: Utc::now(),
        });
        Ok(())
    }

    async fn stats(&self, channel: Channel) -> Result<QueueStats, QueueError> {
        let lanes = self.lanes.lock().expect("queue lock poisoned");
        Ok(lanes
            .get(&channel)
            .map(|lane| QueueStats {
                channel,
                pending: lane.pending.len(),
                in_flight: lane.in_flight.len(),
                dead_letter: lane.dead_letter.len(),
            })
            .unwrap_or_else(|| QueueStats::empty(channel)))
    }
}
