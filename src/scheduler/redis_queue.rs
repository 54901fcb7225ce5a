//! Redis-backed work queue with reliable dequeue.
//!
//! # Key layout
//!
//! Each channel uses three Redis keys under a namespace:
//!
//! - `{ns}:{channel}`: sorted set of pending items scored by priority
//! - `{ns}:{channel}:processing`: hash of in-flight items keyed by item id
//! - `{ns}:{channel}:dead_letter`: list of items that exhausted deliveries
//!
//! # Reliability
//!
//! A Lua script pops the lowest-scored member and records it in the
//! processing hash in one step, so an item is never in neither place. If a
//! consumer dies, `recover_in_flight` moves its items back to the pending
//! set.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};
use uuid::Uuid;

use super::queue::{DeadLetterEntry, QueueError, QueueStats, WorkQueue};
use super::work::{Channel, WorkItem};

/// Pops the best item and records it as in flight.
const POP_AND_TRACK: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
local item = cjson.decode(popped[1])
redis.call('HSET', KEYS[2], item['id'], popped[1])
return popped[1]
"#;

/// Upper bound on the sleep between empty polls.
const MAX_POLL_STEP: Duration = Duration::from_millis(100);

struct ChannelKeys {
    pending: String,
    processing: String,
    dead_letter: String,
}

/// Distributed work queue stored in Redis.
pub struct RedisWorkQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    namespace: String,
    pop_script: redis::Script,
}

impl RedisWorkQueue {
    /// Connects to Redis and creates a queue under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a queue from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            pop_script: redis::Script::new(POP_AND_TRACK),
        }
    }

    fn keys(&self, channel: Channel) -> ChannelKeys {
        channel_keys(&self.namespace, channel)
    }

    async fn try_pop(&self, keys: &ChannelKeys) -> Result<Option<WorkItem>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = self
            .pop_script
            .key(&keys.pending)
            .key(&keys.processing)
            .invoke_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Returns up to `limit` dead letter entries without removing them.
    pub async fn peek_dead_letter(
        &self,
        channel: Channel,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let keys = self.keys(channel);
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&keys.dead_letter, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<DeadLetterEntry>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }

    /// Deletes every key of a channel.
    pub async fn clear(&self, channel: Channel) -> Result<(), QueueError> {
        let keys = self.keys(channel);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&keys.pending)
            .del(&keys.processing)
            .del(&keys.dead_letter);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn channel_keys(namespace: &str, channel: Channel) -> ChannelKeys {
    let pending = format!("{}:{}", namespace, channel.name());
    ChannelKeys {
        processing: format!("{}:processing", pending),
        dead_letter: format!("{}:dead_letter", pending),
        pending,
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, channel: Channel, item: WorkItem) -> Result<(), QueueError> {
        let keys = self.keys(channel);
        let serialized = serde_json::to_string(&item)?;
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(&keys.pending, serialized, item.priority.score())
            .await?;
        Ok(())
    }

    async fn enqueue_batch(&self, channel: Channel, items: Vec<WorkItem>) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        let keys = self.keys(channel);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for item in &items {
            pipe.zadd(&keys.pending, serde_json::to_string(item)?, item.priority.score());
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn dequeue(
        &self,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, QueueError> {
        let keys = self.keys(channel);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(item) = self.try_pop(&keys).await? {
                return Ok(Some(item));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(MAX_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, channel: Channel, item_id: Uuid) -> Result<(), QueueError> {
        let keys = self.keys(channel);
        let mut conn = self.redis.clone();
        let removed: usize = conn.hdel(&keys.processing, item_id.to_string()).await?;
        if removed == 0 {
            return Err(QueueError::ItemNotFound(item_id));
        }
        Ok(())
    }

    async fn requeue(&self, channel: Channel, item: WorkItem) -> Result<(), QueueError> {
        let keys = self.keys(channel);
        let serialized = serde_json::to_string(&item)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(&keys.processing, item.id.to_string())
            .zadd(&keys.pending, serialized, item.priority.score());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        channel: Channel,
        item: WorkItem,
        error: &str,
    ) -> Result<(), QueueError> {
        let keys = self.keys(channel);
        let item_id = item.id;
        let entry = DeadLetterEntry {
            item,
            error: error.to_string(),
            moved_at: chrono::Utc::now(),
        };
        let serialized = serde_json::to_string(&entry)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(&keys.processing, item_id.to_string())
            .lpush(&keys.dead_letter, serialized);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn recover_in_flight(
        &self,
        channel: Channel,
        max_deliveries: u32,
    ) -> Result<usize, QueueError> {
        let keys = self.keys(channel);
        let mut conn = self.redis.clone();
        let held: HashMap<String, String> = conn.hgetall(&keys.processing).await?;

        let mut recovered = 0;
        for (id, data) in held {
            let mut item = match serde_json::from_str::<WorkItem>(&data) {
                Ok(item) => item,
                Err(e) => {
                    warn!(channel = %channel, item_id = %id, error = %e, "Dropping unreadable in-flight item");
                    conn.hdel::<_, _, ()>(&keys.processing, &id).await?;
                    continue;
                }
            };
            item.increment_deliveries();

            if item.should_redeliver(max_deliveries) {
                self.requeue(channel, item).await?;
                recovered += 1;
            } else {
                self.dead_letter(channel, item, "Recovered from processing after max deliveries")
                    .await?;
            }
        }

        if recovered > 0 {
            info!(channel = %channel, recovered = recovered, "Recovered in-flight work items");
        }
        Ok(recovered)
    }

    async fn stats(&self, channel: Channel) -> Result<QueueStats, QueueError> {
        let keys = self.keys(channel);
        let mut conn = self.redis.clone();
        let (pending, in_flight, dead_letter): (usize, usize, usize) = redis::pipe()
            .zcard(&keys.pending)
            .hlen(&keys.processing)
            .llen(&keys.dead_letter)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            channel,
            pending,
            in_flight,
            dead_letter,
        })
    }
}
