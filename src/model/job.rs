//! Job, batch and page task definitions.
//!
//! - `JobSubmission`: what a caller hands to the engine
//! - `JobSpec`: the immutable part of a registered job
//! - `JobRecord` / `BatchRecord` / `PageRecord`: serializable point-in-time
//!   views read back from the state store
//! - `FinalResult`: the ordered, aggregated payload of a completed job

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{BatchStatus, FailurePolicy, JobStatus, PageStatus};

/// Input for one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageInput {
    /// Raw image bytes with their MIME type.
    Image { data: Vec<u8>, mime: String },
    /// Reference to an image held by external blob storage.
    StoredImage(String),
    /// Plain text, used for the synthetic page of a text-only job.
    Text(String),
}

impl PageInput {
    /// PNG image bytes.
    pub fn png(data: Vec<u8>) -> Self {
        PageInput::Image {
            data,
            mime: "image/png".to_string(),
        }
    }

    /// Short description stored in page records instead of the payload.
    pub fn describe(&self) -> String {
        match self {
            PageInput::Image { data, mime } => format!("{} ({} bytes)", mime, data.len()),
            PageInput::StoredImage(reference) => reference.clone(),
            PageInput::Text(text) => format!("text ({} chars)", text.chars().count()),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, PageInput::Text(_))
    }
}

/// A request to analyze a document.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    /// Caller-chosen identifier; resubmitting the same id is rejected.
    pub job_id: Option<Uuid>,
    /// Opaque owner identifier carried through to the result.
    pub owner_id: String,
    /// Document type, e.g. "pdf" or "pptx".
    pub doc_type: String,
    /// Page images in document order.
    pub pages: Vec<PageInput>,
    /// Used only when `pages` is empty.
    pub fallback_text: Option<String>,
    /// Overrides the engine's default failure policy.
    pub policy: Option<FailurePolicy>,
    /// Overrides the engine's default batch size.
    pub batch_size: Option<usize>,
    /// Enqueue an audio follow-up once the job completes.
    pub generate_audio: bool,
    /// 1-based page numbers to analyze, in the order given. `None` analyzes
    /// every page.
    pub selected_pages: Option<Vec<usize>>,
}

impl JobSubmission {
    pub fn new(owner_id: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            job_id: None,
            owner_id: owner_id.into(),
            doc_type: doc_type.into(),
            pages: Vec::new(),
            fallback_text: None,
            policy: None,
            batch_size: None,
            generate_audio: false,
            selected_pages: None,
        }
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_pages(mut self, pages: Vec<PageInput>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_fallback_text(mut self, text: impl Into<String>) -> Self {
        self.fallback_text = Some(text.into());
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_audio(mut self) -> Self {
        self.generate_audio = true;
        self
    }

    pub fn with_selected_pages(mut self, page_numbers: Vec<usize>) -> Self {
        self.selected_pages = Some(page_numbers);
        self
    }
}

/// Immutable description of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Uuid,
    pub owner_id: String,
    pub doc_type: String,
    pub total_pages: usize,
    pub batch_size: usize,
    pub policy: FailurePolicy,
    pub created_at: DateTime<Utc>,
    /// Set when the job is a single synthetic text page.
    pub fallback_text: Option<String>,
    pub generate_audio: bool,
    /// Source page number of each analyzed page when the job was submitted
    /// with a page selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_pages: Option<Vec<usize>>,
}

impl JobSpec {
    pub fn is_text_only(&self) -> bool {
        self.fallback_text.is_some()
    }

    /// 1-based page number in the submitted document for page `page_index`.
    pub fn page_number(&self, page_index: usize) -> usize {
        self.selected_pages
            .as_ref()
            .and_then(|numbers| numbers.get(page_index).copied())
            .unwrap_or(page_index + 1)
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub batch_ids: Vec<Uuid>,
}

/// Point-in-time view of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub status: BatchStatus,
    pub pages_completed: usize,
    pub pages_failed: usize,
}

impl BatchRecord {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Point-in-time view of a page task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub page_index: usize,
    pub input_ref: String,
    pub status: PageStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<String>,
}

/// Terminal outcome of a page task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PageOutcome {
    Completed { text: String },
    Failed { error: String, attempts: u32 },
    Cancelled,
}

impl PageOutcome {
    pub fn status(&self) -> PageStatus {
        match self {
            PageOutcome::Completed { .. } => PageStatus::Completed,
            PageOutcome::Failed { .. } => PageStatus::Failed,
            PageOutcome::Cancelled => PageStatus::Cancelled,
        }
    }
}

/// One entry of the final ordered payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEntry {
    pub page_index: usize,
    /// 1-based page number in the submitted document.
    pub page_number: usize,
    /// Analysis text; `None` marks a gap left by a failed page.
    pub text: Option<String>,
    pub error: Option<String>,
}

impl PageEntry {
    pub fn is_gap(&self) -> bool {
        self.text.is_none()
    }
}

/// Job-level summary produced by the summarizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub elevator_pitch: String,
}

/// Processing metadata attached to a final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub total_pages: usize,
    pub pages_processed: usize,
    pub pages_failed: usize,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Aggregated result of a completed job, ordered by page index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub job_id: Uuid,
    pub owner_id: String,
    pub doc_type: String,
    pub pages: Vec<PageEntry>,
    pub content: String,
    pub summary: Summary,
    pub metadata: ResultMetadata,
}

impl FinalResult {
    /// Indices of failed pages represented as gaps.
    pub fn gaps(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.is_gap())
            .map(|p| p.page_index)
            .collect()
    }
}
