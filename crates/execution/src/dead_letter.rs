//! Dead-letter entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_core::IncidentId;

use crate::job::{Job, JobKey};

/// A job parked for operator action, keyed by (task type, job key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Logical name (the job's task type).
    pub task_type: String,
    /// Correlation key (the job key).
    pub job_key: JobKey,
    /// The job as it was when it was dead-lettered.
    pub job: Job,
    /// Why it was dead-lettered.
    pub reason: String,
    /// The incident raised alongside.
    #[serde(default)]
    pub incident: Option<IncidentId>,
    /// When it was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
    /// When it may be purged.
    pub expires_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Whether the entry is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
