//! Jobs, job keys, and completion records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_core::{FiberId, InstanceId, NodeKey, Value, json_digest};

/// The dedupe key of a job.
///
/// Derived from the instance, the ServiceTask node, the dispatching fiber's
/// sequence number and loop epoch, and a digest of the job input, so
/// replaying a dispatch yields the same key while two fibers entering the
/// same task never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    /// Generate the key for a dispatch.
    pub fn generate<T: Serialize + ?Sized>(
        instance: InstanceId,
        node: &NodeKey,
        fiber_seq: u64,
        epoch: u64,
        input: &T,
    ) -> Result<Self, serde_json::Error> {
        let digest = json_digest(input)?;
        Ok(Self(format!("{instance}:{node}:{fiber_seq}:{epoch}:{}", &digest[..16])))
    }

    /// Wrap an existing key, e.g. one read back from storage or an API.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the underlying key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an executor (possibly until `not_before`).
    Pending,
    /// Claimed by an executor under a lease.
    Claimed,
    /// Completed; the result has been applied.
    Completed,
    /// Retries exhausted or rejected; parked in the dead-letter queue.
    DeadLettered,
    /// Its branch was cancelled; any late result is ignored.
    Cancelled,
}

impl JobStatus {
    /// Whether the job can still produce a result that is applied.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }

    /// The snake_case name, as stored.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatch of a ServiceTask to an external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Dedupe key.
    pub key: JobKey,
    /// Owning instance.
    pub instance: InstanceId,
    /// The fiber parked on this job.
    pub fiber: FiberId,
    /// The fiber's loop epoch at dispatch.
    pub epoch: u64,
    /// The ServiceTask node.
    pub node: NodeKey,
    /// Logical job type executors subscribe to.
    pub task_type: String,
    /// Instance payload at dispatch.
    pub payload: serde_json::Value,
    /// Instance flags at dispatch.
    pub flags: BTreeMap<String, Value>,
    /// Dispatches so far, starting at 1.
    pub attempt: u32,
    /// Retries left before the job is dead-lettered.
    pub retries_remaining: u32,
    /// Configured retry ceiling.
    pub max_retries: u32,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Not claimable before this instant (retry backoff).
    pub not_before: DateTime<Utc>,
    /// Start of the current claim lease.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Executor holding the current claim.
    #[serde(default)]
    pub claimed_by: Option<String>,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether an executor may claim the job at `now` given `lease`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: chrono::TimeDelta) -> bool {
        match self.status {
            JobStatus::Pending => self.not_before <= now,
            JobStatus::Claimed => self.claimed_at.is_none_or(|at| at + lease <= now),
            _ => false,
        }
    }

    /// Record a claim.
    pub fn claim(&mut self, worker: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.claimed_at = Some(now);
        self.claimed_by = Some(worker.to_owned());
    }

    /// Put the job back in the queue for another attempt.
    pub fn schedule_retry(&mut self, not_before: DateTime<Utc>, error: impl Into<String>) {
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        self.attempt += 1;
        self.status = JobStatus::Pending;
        self.not_before = not_before;
        self.claimed_at = None;
        self.claimed_by = None;
        self.last_error = Some(error.into());
    }
}

/// A successful result reported by an executor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobCompletion {
    /// Flags to merge into the instance.
    #[serde(default)]
    pub flags: BTreeMap<String, Value>,
    /// Replacement payload, if the task produced one.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl JobCompletion {
    /// A completion setting the given flags.
    #[must_use]
    pub fn with_flags<I, K>(flags: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            flags: flags.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            payload: None,
        }
    }
}

/// How a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Possibly temporary; eligible for retry.
    Transient,
    /// A deterministic rejection with a business error code.
    Business {
        /// Error code, matched against the task's error routes.
        code: String,
    },
}

/// A failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Classification.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

impl JobFailure {
    /// A retryable failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// A business error.
    #[must_use]
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Business { code: code.into() },
            message: message.into(),
        }
    }
}

/// Dedupe cache entry: the first result recorded for a job key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// The job.
    pub job_key: JobKey,
    /// The result as reported.
    pub completion: JobCompletion,
    /// `false` when the job had been cancelled and the result was ignored.
    pub applied: bool,
    /// When it was recorded.
    pub recorded_at: DateTime<Utc>,
}
