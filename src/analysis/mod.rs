//! Collaborators consumed by the engine.
//!
//! The engine never talks to a model or a database directly. It calls the
//! traits defined here:
//!
//! - [`VisionAnalyzer`]: one page in, analysis text out
//! - [`Summarizer`]: ordered page analyses in, job summary out
//! - [`ResultSink`]: receives the report of every job that reaches a
//!   terminal status
//! - [`AudioGenerator`]: optional follow-up on completed jobs
//!
//! [`OpenAiClient`] implements the first two against an OpenAI-compatible
//! chat completions endpoint and [`WebhookSink`] posts reports over HTTP.

pub mod openai;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{FinalResult, JobStatus, PageInput, Summary};

pub use openai::OpenAiClient;
pub use webhook::{LoggingSink, WebhookSink};

/// Outcome classification for a failed collaborator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    /// Rate limit, timeout, connection failure or server-side error.
    #[error("Transient analysis failure: {0}")]
    Retryable(String),

    /// Malformed input or a request the service will never accept.
    #[error("Permanent analysis failure: {0}")]
    Permanent(String),
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Retryable(_))
    }

    /// The failure detail without the classification prefix.
    pub fn detail(&self) -> &str {
        match self {
            AnalysisError::Retryable(detail) | AnalysisError::Permanent(detail) => detail,
        }
    }
}

/// One page handed to a [`VisionAnalyzer`].
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub job_id: Uuid,
    /// 0-based index within the job.
    pub page_index: usize,
    pub total_pages: usize,
    pub doc_type: &'a str,
    pub input: &'a PageInput,
}

impl PageRequest<'_> {
    /// 1-based page number as shown to readers.
    pub fn page_number(&self) -> usize {
        self.page_index + 1
    }
}

/// Input of a [`Summarizer`] call.
#[derive(Debug, Clone, Copy)]
pub struct SummaryRequest<'a> {
    pub job_id: Uuid,
    pub doc_type: &'a str,
    pub total_pages: usize,
    /// Analyses of the successful pages, ordered by page index.
    pub page_texts: &'a [String],
    /// The rendered content payload of the job.
    pub content: &'a str,
}

/// Analyzes the image of one page.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, request: PageRequest<'_>) -> Result<String, AnalysisError>;
}

/// Produces the job-level summary from ordered page analyses.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: SummaryRequest<'_>) -> Result<Summary, AnalysisError>;
}

/// Generates audio for a completed job and returns a reference to it.
#[async_trait]
pub trait AudioGenerator: Send + Sync {
    async fn generate(&self, result: &FinalResult) -> Result<String, AnalysisError>;
}

/// Report delivered to a [`ResultSink`] when a job reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub owner_id: String,
    pub status: JobStatus,
    /// Present only for completed jobs.
    pub result: Option<FinalResult>,
    /// Wall-clock processing time in seconds.
    pub processing_time: f64,
    pub pages_processed: usize,
    pub completed_at: DateTime<Utc>,
}

/// Persists or forwards job reports.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, report: &JobReport) -> anyhow::Result<()>;
}
