//! Work item definitions for the scheduler.
//!
//! This module defines the units of work that travel through the queue:
//!
//! - `WorkPayload`: what a worker should do (dispatch a batch, analyze a
//!   page, finalize a job, generate audio)
//! - `Priority`: ordering and backpressure class of an item
//! - `WorkItem`: the envelope stored in a queue channel
//! - `Channel`: the named lanes of the work queue

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::router::channel_for;

/// Named lanes of the work queue, each served by its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Single-page vision analysis.
    #[serde(rename = "page_processing")]
    PageAnalysis,
    /// Batch dispatch.
    BatchCoordination,
    /// Job-level work such as final aggregation.
    #[serde(rename = "document_processing")]
    Orchestration,
    AudioGeneration,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::PageAnalysis,
        Channel::BatchCoordination,
        Channel::Orchestration,
        Channel::AudioGeneration,
    ];

    /// Queue name of the channel.
    pub fn name(&self) -> &'static str {
        match self {
            Channel::PageAnalysis => "page_processing",
            Channel::BatchCoordination => "batch_coordination",
            Channel::Orchestration => "document_processing",
            Channel::AudioGeneration => "audio_generation",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown channel '{}'", s))
    }
}

/// Kind of work, which alone decides the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    PageAnalysis,
    BatchCoordination,
    Orchestration,
    AudioGeneration,
}

/// What a worker is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkPayload {
    /// Dispatch the page tasks of one batch.
    DispatchBatch { job_id: Uuid, batch_index: usize },
    /// Run one attempt of a page task.
    AnalyzePage { job_id: Uuid, page_index: usize },
    /// Aggregate the results of a job whose batches have all settled.
    FinalizeJob { job_id: Uuid },
    /// Produce audio for a completed job.
    GenerateAudio { job_id: Uuid },
}

impl WorkPayload {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkPayload::DispatchBatch { .. } => WorkKind::BatchCoordination,
            WorkPayload::AnalyzePage { .. } => WorkKind::PageAnalysis,
            WorkPayload::FinalizeJob { .. } => WorkKind::Orchestration,
            WorkPayload::GenerateAudio { .. } => WorkKind::AudioGeneration,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            WorkPayload::DispatchBatch { job_id, .. }
            | WorkPayload::AnalyzePage { job_id, .. }
            | WorkPayload::FinalizeJob { job_id }
            | WorkPayload::GenerateAudio { job_id } => *job_id,
        }
    }
}

/// Backpressure class of a work item.
///
/// Only `Low` items can be rejected when a channel is over its high-water
/// mark. Classes are ordered, `High` items are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// New admissions (batch seeds of a fresh job).
    Low,
    /// Continuations of admitted work (page tasks, retries, audio).
    Normal,
    /// Control events (finalization, completion).
    High,
}

/// Ordering key of a work item: class first, then rank (higher first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority {
    pub class: PriorityClass,
    pub rank: i64,
}

impl Priority {
    /// Priority that favours older jobs: the earlier the job was created,
    /// the higher the rank.
    pub fn by_age(class: PriorityClass, created_at: DateTime<Utc>) -> Self {
        Self {
            class,
            rank: -created_at.timestamp_millis(),
        }
    }

    pub fn is_rejectable(&self) -> bool {
        self.class == PriorityClass::Low
    }

    /// Sorted-set score where a lower score is served first.
    pub fn score(&self) -> f64 {
        let class_offset = match self.class {
            PriorityClass::High => 0.0,
            PriorityClass::Normal => 1e13,
            PriorityClass::Low => 2e13,
        };
        class_offset - self.rank as f64
    }
}

/// A unit of work stored in a queue channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier of this delivery envelope.
    pub id: Uuid,
    pub payload: WorkPayload,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Times the item was handed to a worker whose handler errored.
    pub deliveries: u32,
}

impl WorkItem {
    pub fn new(payload: WorkPayload, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            enqueued_at: Utc::now(),
            deliveries: 0,
        }
    }

    pub fn channel(&self) -> Channel {
        channel_for(self.payload.kind())
    }

    pub fn increment_deliveries(&mut self) {
        self.deliveries += 1;
    }

    /// Whether a failed delivery should be put back on the queue.
    pub fn should_redeliver(&self, max_deliveries: u32) -> bool {
        self.deliveries < max_deliveries
    }
}
