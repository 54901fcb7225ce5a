//! Result sinks.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use super::{JobReport, ResultSink};

const WEBHOOK_TIMEOUT_SECS: u64 = 30;

/// Posts each job report as JSON to a fixed URL.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client - system TLS configuration error"),
            url: url.into(),
        }
    }

    /// Reads the URL from `PAGEFORGE_WEBHOOK_URL`, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var("PAGEFORGE_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(Self::new)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ResultSink for WebhookSink {
    async fn deliver(&self, report: &JobReport) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .with_context(|| format!("Failed to post report for job {}", report.job_id))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Webhook {} answered {} for job {}", self.url, status, report.job_id);
        }
        info!(job_id = %report.job_id, status = %report.status, "Job report delivered");
        Ok(())
    }
}

/// Sink that only logs reports. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl ResultSink for LoggingSink {
    async fn deliver(&self, report: &JobReport) -> anyhow::Result<()> {
        info!(
            job_id = %report.job_id,
            owner_id = %report.owner_id,
            status = %report.status,
            pages_processed = report.pages_processed,
            processing_time = report.processing_time,
            "Job finished"
        );
        Ok(())
    }
}
