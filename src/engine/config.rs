//! Engine configuration.
//!
//! Batching, retry and backpressure settings for the orchestration engine,
//! with defaults, builder methods, validation and an environment loader.

use std::time::Duration;
use thiserror::Error;

use crate::model::FailurePolicy;
use crate::scheduler::{Channel, ChannelLimits};

use super::retry::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the orchestration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Batching
    /// Pages per batch for jobs above the batching threshold.
    pub batch_size: usize,
    /// Jobs with at most this many pages run as a single batch.
    pub batching_threshold: usize,

    // Page task retries
    /// Attempts per page, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay before jitter.
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in [0, 1).
    pub jitter: f64,
    /// Execution timeout of a single analysis attempt.
    pub task_timeout: Duration,

    // Admission
    pub channel_limits: ChannelLimits,
    /// Failure policy for jobs that do not choose one.
    pub default_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            batching_threshold: 50,

            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            task_timeout: Duration::from_secs(60),

            channel_limits: ChannelLimits::default(),
            default_policy: FailurePolicy::BestEffort,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PAGEFORGE_BATCH_SIZE`: Pages per batch (default: 25)
    /// - `PAGEFORGE_BATCHING_THRESHOLD`: Single-batch page limit (default: 50)
    /// - `PAGEFORGE_MAX_ATTEMPTS`: Attempts per page (default: 5)
    /// - `PAGEFORGE_BASE_DELAY_MS`: First retry delay in ms (default: 1000)
    /// - `PAGEFORGE_MAX_DELAY_MS`: Backoff cap in ms (default: 60000)
    /// - `PAGEFORGE_JITTER`: Relative jitter (default: 0.2)
    /// - `PAGEFORGE_TASK_TIMEOUT_SECS`: Per-attempt timeout (default: 60)
    /// - `PAGEFORGE_HIGH_WATER_<CHANNEL>`: High-water mark of a channel, e.g.
    ///   `PAGEFORGE_HIGH_WATER_BATCH_COORDINATION`
    /// - `PAGEFORGE_FAILURE_POLICY`: `fail-fast` or `best-effort` (default)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Batching
        if let Some(val) = lookup("PAGEFORGE_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "PAGEFORGE_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("PAGEFORGE_BATCHING_THRESHOLD") {
            config.batching_threshold = parse_env_value(&val, "PAGEFORGE_BATCHING_THRESHOLD")?;
        }

        // Retries
        if let Some(val) = lookup("PAGEFORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "PAGEFORGE_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("PAGEFORGE_BASE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "PAGEFORGE_BASE_DELAY_MS")?;
            config.base_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("PAGEFORGE_MAX_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "PAGEFORGE_MAX_DELAY_MS")?;
            config.max_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("PAGEFORGE_JITTER") {
            config.jitter = parse_env_value(&val, "PAGEFORGE_JITTER")?;
        }

        if let Some(val) = lookup("PAGEFORGE_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PAGEFORGE_TASK_TIMEOUT_SECS")?;
            config.task_timeout = Duration::from_secs(secs);
        }

        // Admission
        for channel in Channel::ALL {
            let key = format!("PAGEFORGE_HIGH_WATER_{}", channel.name().to_uppercase());
            if let Some(val) = lookup(&key) {
                config
                    .channel_limits
                    .set(channel, parse_env_value(&val, &key)?);
            }
        }

        if let Some(val) = lookup("PAGEFORGE_FAILURE_POLICY") {
            config.default_policy = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "PAGEFORGE_FAILURE_POLICY".to_string(),
                message,
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.base_delay > self.max_delay {
            return Err(ConfigError::ValidationFailed(
                "base_delay cannot exceed max_delay".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::ValidationFailed(
                "jitter must be in [0.0, 1.0)".to_string(),
            ));
        }

        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy for page tasks.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batching_threshold(mut self, threshold: usize) -> Self {
        self.batching_threshold = threshold;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder method to set both backoff bounds.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_channel_limits(mut self, limits: ChannelLimits) -> Self {
        self.channel_limits = limits;
        self
    }

    pub fn with_default_policy(mut self, policy: FailurePolicy) -> Self {
        self.default_policy = policy;
        self
    }
}

/// Parse an environment variable value into a type.
pub(crate) fn parse_env_value<T: std::str::FromStr>(
    value: &str,
    key: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
