//! OpenAI-compatible chat completions client.
//!
//! Implements [`VisionAnalyzer`] by sending each page image as a base64
//! data URL next to a teaching-style analysis prompt, and [`Summarizer`]
//! by asking for a `{"summary", "elevator_pitch"}` JSON object over the
//! combined page analyses.
//!
//! The client makes exactly one HTTP call per invocation. Retrying is the
//! page executor's job; this module only classifies failures.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::engine::config::ConfigError;
use crate::model::{PageInput, Summary};
use crate::utils::{parse_json_object, truncate_chars};

use super::{AnalysisError, PageRequest, Summarizer, SummaryRequest, VisionAnalyzer};

/// Default API endpoint.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_MODEL: &str = "gpt-4o";

/// Token budget of a page analysis reply.
const PAGE_MAX_TOKENS: u32 = 1500;

/// Token budget of a summary reply.
const SUMMARY_MAX_TOKENS: u32 = 800;

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 60;

const PAGE_PROMPT: &str = "Act as a subject matter expert and master educator. \
Teach the content of this page to a serious learner rather than summarizing it. \
Identify the main idea, walk through it patiently, interpret any tables, charts or \
visuals and the comparisons they make, add expert context and real-world relevance, \
and break down anything that is likely to confuse. Detailed answers are preferred \
over short ones. Speak directly to the learner instead of referring to \"this \
document\" or \"this page\". End every heading or section title with a colon (:).";

/// Client for an OpenAI-compatible chat completions API.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        Self::with_custom_url(api_key, OPENAI_BASE_URL.to_string(), DEFAULT_MODEL.to_string())
    }

    /// Create a client against a compatible proxy or a local test server.
    pub fn with_custom_url(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client - system TLS configuration error"),
            api_key,
            base_url,
            model,
        }
    }

    /// Creates a client from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OPENAI_API_KEY`: API key (required)
    /// - `OPENAI_BASE_URL`: Endpoint (default: `https://api.openai.com/v1`)
    /// - `PAGEFORGE_MODEL`: Model name (default: `gpt-4o`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_BASE_URL.to_string());
        let model = std::env::var("PAGEFORGE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::with_custom_url(api_key, base_url, model))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the API key (for debugging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 8 {
            "*".repeat(chars.len())
        } else {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        }
    }

    async fn complete(&self, request: &ApiRequest) -> Result<String, AnalysisError> {
        let url = format!("{}/chat/completions", self.base_url);
        let http_response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(classify_status(status, message));
        }

        let api_response: ApiResponse = http_response.json().await.map_err(|e| {
            AnalysisError::Retryable(format!("Failed to parse API response: {}", e))
        })?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AnalysisError::Permanent("Model returned no content".to_string()))
    }
}

/// Maps an HTTP error status to a failure class.
///
/// Rate limits, request timeouts and server errors are transient; every
/// other client error is permanent.
fn classify_status(status: StatusCode, message: String) -> AnalysisError {
    let detail = format!("{} {}", status.as_u16(), message);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AnalysisError::Retryable(detail)
    } else {
        AnalysisError::Permanent(detail)
    }
}

fn classify_transport_error(error: reqwest::Error) -> AnalysisError {
    if error.is_builder() {
        AnalysisError::Permanent(error.to_string())
    } else {
        // Timeouts, refused connections and dropped streams.
        AnalysisError::Retryable(error.to_string())
    }
}

fn image_url(input: &PageInput) -> Result<String, AnalysisError> {
    match input {
        PageInput::Image { data, .. } if data.is_empty() => {
            Err(AnalysisError::Permanent("Page image is empty".to_string()))
        }
        PageInput::Image { data, mime } => {
            Ok(format!("data:{};base64,{}", mime, BASE64.encode(data)))
        }
        PageInput::StoredImage(reference) => Ok(reference.clone()),
        PageInput::Text(_) => Err(AnalysisError::Permanent(
            "Text pages are not sent to the vision model".to_string(),
        )),
    }
}

fn page_prompt(request: &PageRequest<'_>) -> String {
    format!(
        "{}\n\nAnalyze page {} of this {}-page {} document using this approach.",
        PAGE_PROMPT,
        request.page_number(),
        request.total_pages,
        request.doc_type
    )
}

fn summary_prompt(request: &SummaryRequest<'_>) -> String {
    format!(
        "Based on the analysis of this {}-page {} document, provide:\n\n\
         1. A brief summary (2-3 sentences)\n\
         2. Key insights in one paragraph\n\n\
         Structure as JSON:\n\
         {{\"summary\": \"brief summary\", \"elevator_pitch\": \"key insights\"}}\n\n\
         Document analysis:\n{}",
        request.total_pages, request.doc_type, request.content
    )
}

/// Builds a summary from a reply that carried no usable JSON.
fn summary_from_prose(reply: &str) -> Summary {
    let clip = |limit: usize| {
        if reply.chars().count() > limit {
            format!("{}...", truncate_chars(reply, limit))
        } else {
            reply.to_string()
        }
    };
    Summary {
        summary: clip(200),
        elevator_pitch: clip(300),
    }
}

#[async_trait]
impl VisionAnalyzer for OpenAiClient {
    async fn analyze(&self, request: PageRequest<'_>) -> Result<String, AnalysisError> {
        let url = image_url(request.input)?;
        debug!(
            job_id = %request.job_id,
            page_index = request.page_index,
            model = %self.model,
            "Requesting page analysis"
        );

        let api_request = ApiRequest {
            model: self.model.clone(),
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: page_prompt(&request),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url },
                    },
                ],
            }],
            max_tokens: PAGE_MAX_TOKENS,
        };
        self.complete(&api_request).await
    }
}

#[async_trait]
impl Summarizer for OpenAiClient {
    async fn summarize(&self, request: SummaryRequest<'_>) -> Result<Summary, AnalysisError> {
        let api_request = ApiRequest {
            model: self.model.clone(),
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: vec![ContentPart::Text {
                    text: summary_prompt(&request),
                }],
            }],
            max_tokens: SUMMARY_MAX_TOKENS,
        };
        let reply = self.complete(&api_request).await?;

        Ok(parse_json_object::<SummaryReply>(&reply)
            .map(|parsed| Summary {
                summary: parsed.summary,
                elevator_pitch: parsed.elevator_pitch,
            })
            .unwrap_or_else(|_| summary_from_prose(&reply)))
    }
}

#[derive(Debug, Deserialize)]
struct SummaryReply {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    elevator_pitch: String,
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ApiReplyMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
