//! Incidents: durable, operator-visible fault records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_bytecode::Addr;
use weft_core::{FiberId, IncidentId, InstanceId, NodeKey};

use crate::error::ExecutionError;
use crate::job::JobKey;

/// What kind of fault an incident records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum ErrorClass {
    /// A job failed more often than its retry budget allows.
    RetryExhausted,
    /// A job reported a business error with no matching error route.
    UnroutedBusinessError {
        /// The reported code.
        code: String,
    },
    /// An exclusive or inclusive gateway found nowhere to go.
    NoRoute,
    /// The interpreter hit an inconsistent program or state.
    VmFault,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryExhausted => f.write_str("retry_exhausted"),
            Self::UnroutedBusinessError { code } => write!(f, "unrouted_business_error({code})"),
            Self::NoRoute => f.write_str("no_route"),
            Self::VmFault => f.write_str("vm_fault"),
        }
    }
}

/// Open or resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Awaiting an operator.
    Open,
    /// Closed by an operator.
    Resolved {
        /// Free-form resolution note.
        resolution: String,
        /// When it was resolved.
        resolved_at: DateTime<Utc>,
    },
}

/// A fault at a specific instance, fiber and address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// Generated id.
    pub id: IncidentId,
    /// Faulting instance.
    pub instance: InstanceId,
    /// Faulting fiber.
    pub fiber: FiberId,
    /// Bytecode address of the fault.
    pub addr: Addr,
    /// Node whose block contains `addr`.
    #[serde(default)]
    pub node: Option<NodeKey>,
    /// Classification.
    pub class: ErrorClass,
    /// Details.
    pub message: String,
    /// Attempts made before escalating.
    pub retry_count: u32,
    /// The job involved, if any.
    #[serde(default)]
    pub job_key: Option<JobKey>,
    /// Open or resolved.
    pub status: IncidentStatus,
    /// When it was raised.
    pub raised_at: DateTime<Utc>,
}

impl Incident {
    /// Raise a new open incident.
    #[must_use]
    pub fn raise(
        instance: InstanceId,
        fiber: FiberId,
        addr: Addr,
        class: ErrorClass,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IncidentId::new(),
            instance,
            fiber,
            addr,
            node: None,
            class,
            message: message.into(),
            retry_count: 0,
            job_key: None,
            status: IncidentStatus::Open,
            raised_at: at,
        }
    }

    /// Attach the node containing the faulting address.
    #[must_use]
    pub fn with_node(mut self, node: Option<NodeKey>) -> Self {
        self.node = node;
        self
    }

    /// Attach the job involved and how many attempts it got.
    #[must_use]
    pub fn with_job(mut self, job_key: JobKey, retry_count: u32) -> Self {
        self.job_key = Some(job_key);
        self.retry_count = retry_count;
        self
    }

    /// Whether it still needs attention.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.status, IncidentStatus::Open)
    }

    /// Mark resolved. Resolving twice is an error.
    pub fn resolve(&mut self, resolution: impl Into<String>, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        if !self.is_open() {
            return Err(ExecutionError::InvalidTransition {
                from: "resolved".into(),
                to: "resolved".into(),
            });
        }
        self.status = IncidentStatus::Resolved {
            resolution: resolution.into(),
            resolved_at: at,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident() -> Incident {
        Incident::raise(
            InstanceId::new(),
            FiberId::new(),
            7,
            ErrorClass::RetryExhausted,
            "boom",
            Utc::now(),
        )
    }

    #[test]
    fn raise_is_open() {
        let i = incident();
        assert!(i.is_open());
        assert_eq!(i.addr, 7);
    }

    #[test]
    fn resolve_once() {
        let mut i = incident();
        i.resolve("fixed upstream", Utc::now()).unwrap();
        assert!(!i.is_open());
        assert!(matches!(
            i.resolve("again", Utc::now()),
            Err(ExecutionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn class_display() {
        assert_eq!(
            ErrorClass::UnroutedBusinessError { code: "E1".into() }.to_string(),
            "unrouted_business_error(E1)"
        );
    }
}
