//! Lifecycle states for jobs, batches and page tasks.
//!
//! Every status is stored in the shared state store as an [`AtomicStatus`],
//! so a transition is a single compare-and-set and never needs a lock.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// A status enum that can be packed into a `u8`.
pub trait StatusCode: Copy + Eq {
    fn code(self) -> u8;
    fn from_code(code: u8) -> Self;
    fn is_terminal(self) -> bool;
}

/// Status of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, no batch dispatched yet.
    Queued,
    /// At least one batch has been dispatched.
    Processing,
    /// Aggregation finished and the final result is available.
    Completed,
    /// A batch failed under the fail-fast policy.
    Failed,
    /// Cancelled by the caller and fully settled.
    Cancelled,
}

impl StatusCode for JobStatus {
    fn code(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelled => 4,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => JobStatus::Queued,
            1 => JobStatus::Processing,
            2 => JobStatus::Completed,
            3 => JobStatus::Failed,
            _ => JobStatus::Cancelled,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a batch of contiguous pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl StatusCode for BatchStatus {
    fn code(self) -> u8 {
        match self {
            BatchStatus::Pending => 0,
            BatchStatus::Active => 1,
            BatchStatus::Completed => 2,
            BatchStatus::Failed => 3,
            BatchStatus::Cancelled => 4,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => BatchStatus::Pending,
            1 => BatchStatus::Active,
            2 => BatchStatus::Completed,
            3 => BatchStatus::Failed,
            _ => BatchStatus::Cancelled,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Active => write!(f, "active"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a single page task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Created with its batch, not yet attempted.
    Pending,
    /// An attempt is in flight on some worker.
    Running,
    /// A transient failure occurred and a retry has been scheduled.
    RetryScheduled,
    Completed,
    /// Permanent failure or retries exhausted.
    Failed,
    Cancelled,
}

impl StatusCode for PageStatus {
    fn code(self) -> u8 {
        match self {
            PageStatus::Pending => 0,
            PageStatus::Running => 1,
            PageStatus::RetryScheduled => 2,
            PageStatus::Completed => 3,
            PageStatus::Failed => 4,
            PageStatus::Cancelled => 5,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => PageStatus::Pending,
            1 => PageStatus::Running,
            2 => PageStatus::RetryScheduled,
            3 => PageStatus::Completed,
            4 => PageStatus::Failed,
            _ => PageStatus::Cancelled,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            PageStatus::Completed | PageStatus::Failed | PageStatus::Cancelled
        )
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageStatus::Pending => write!(f, "pending"),
            PageStatus::Running => write!(f, "running"),
            PageStatus::RetryScheduled => write!(f, "retry_scheduled"),
            PageStatus::Completed => write!(f, "completed"),
            PageStatus::Failed => write!(f, "failed"),
            PageStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Job-level policy for permanent page failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any failed batch fails the job immediately and skips aggregation.
    FailFast,
    /// Always aggregate; failed pages become gap markers.
    #[default]
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "fail-fast" | "failfast" => Ok(FailurePolicy::FailFast),
            "best-effort" | "besteffort" => Ok(FailurePolicy::BestEffort),
            other => Err(format!(
                "unknown failure policy '{}', expected 'fail-fast' or 'best-effort'",
                other
            )),
        }
    }
}

/// A status cell updated with compare-and-set.
pub struct AtomicStatus<S> {
    code: AtomicU8,
    _status: PhantomData<fn() -> S>,
}

impl<S: StatusCode> AtomicStatus<S> {
    pub fn new(status: S) -> Self {
        Self {
            code: AtomicU8::new(status.code()),
            _status: PhantomData,
        }
    }

    pub fn load(&self) -> S {
        S::from_code(self.code.load(Ordering::Acquire))
    }

    /// Moves `from -> to`. On failure returns the status actually observed.
    pub fn compare_and_set(&self, from: S, to: S) -> Result<(), S> {
        self.code
            .compare_exchange(from.code(), to.code(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(S::from_code)
    }

    /// Moves to `to` from any of `allowed`, returning the previous status.
    ///
    /// Fails with the observed status if it is not in `allowed`.
    pub fn transition(&self, allowed: &[S], to: S) -> Result<S, S> {
        let mut current = self.load();
        loop {
            if !allowed.contains(&current) {
                return Err(current);
            }
            match self.compare_and_set(current, to) {
                Ok(()) => return Ok(current),
                Err(observed) => current = observed,
            }
        }
    }
}

impl<S: StatusCode + fmt::Debug> fmt::Debug for AtomicStatus<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicStatus").field(&self.load()).finish()
    }
}
