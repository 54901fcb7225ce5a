//! Work distribution: queue channels, routing and worker pools.
//!
//! - **WorkItem**: envelope for one unit of work with its priority
//! - **WorkQueue**: at-least-once queue with named channels, backed by
//!   memory ([`InMemoryWorkQueue`]) or Redis ([`RedisWorkQueue`])
//! - **QueueRouter**: picks a channel from the kind of work and applies
//!   backpressure to new admissions
//! - **WorkerPool**: per-channel workers feeding a [`WorkHandler`]
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │ QueueRouter  │
//!                 └──────┬───────┘
//!                        │ channel_for(kind)
//!     ┌──────────────────┼──────────────────┬──────────────────┐
//!     ▼                  ▼                  ▼                  ▼
//! page_processing  batch_coordination  document_processing  audio_generation
//!     │                  │                  │                  │
//!     ▼                  ▼                  ▼                  ▼
//!  workers            workers            workers            workers
//!     └──────────────────┴─────────┬────────┴──────────────────┘
//!                                  ▼
//!                             WorkHandler
//! ```

pub mod queue;
pub mod redis_queue;
pub mod router;
pub mod work;
pub mod worker_pool;

pub use queue::{DeadLetterEntry, InMemoryWorkQueue, QueueError, QueueStats, WorkQueue};
pub use redis_queue::RedisWorkQueue;
pub use router::{channel_for, ChannelLimits, ChannelStats, QueueRouter};
pub use work::{Channel, Priority, PriorityClass, WorkItem, WorkKind, WorkPayload};
pub use worker_pool::{
    PoolError, PoolStats, WorkHandler, WorkerActivity, WorkerPool, WorkerPoolConfig,
};
