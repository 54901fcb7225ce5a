//! Retry state machine for page tasks.
//!
//! ```text
//! attempt ─┬─ success ──────────────────────────► completed
//!          ├─ transient, attempt < max ─────────► retry scheduled (delay)
//!          ├─ transient, attempt >= max ────────► failed
//!          └─ permanent ────────────────────────► failed
//! ```
//!
//! Delays double per attempt from `base_delay`, are capped at `max_delay`,
//! then scaled by a random factor in `[1 - jitter, 1 + jitter]`.

use std::time::Duration;

use rand::RngExt;

/// Decision taken after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Run another attempt after `delay`.
    Retry { delay: Duration },
    /// Give up and mark the page failed.
    GiveUp,
}

/// Exponential backoff with jitter, bounded by an attempt cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Decides what follows failed attempt number `attempt` (1-based).
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        self.decide_with_rng(attempt, retryable, &mut rand::rng())
    }

    pub fn decide_with_rng<R: RngExt + ?Sized>(
        &self,
        attempt: u32,
        retryable: bool,
        rng: &mut R,
    ) -> RetryDecision {
        if !retryable || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_with_rng(attempt, rng),
        }
    }

    /// Backoff before jitter: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_with_rng<R: RngExt + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let factor = 1.0 + rng.random_range(-self.jitter..=self.jitter);
        backoff.mul_f64(factor.max(0.0))
    }
}
