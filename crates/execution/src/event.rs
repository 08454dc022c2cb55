//! Event log for audit and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_bytecode::{Addr, ProgramHash};
use weft_core::{FiberId, IncidentId, InstanceId, NodeKey};

use crate::incident::ErrorClass;
use crate::job::JobKey;

/// Something that happened to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// The instance was created.
    InstanceStarted {
        /// Pinned program.
        program: ProgramHash,
        /// External correlation id.
        correlation_id: String,
    },
    /// Every fiber finished.
    InstanceCompleted,
    /// A terminate End node finished the instance.
    InstanceTerminated {
        /// The End node.
        node: Option<NodeKey>,
    },
    /// An operator cancelled the instance.
    InstanceCancelled {
        /// Why.
        reason: String,
    },

    /// A fiber came into existence.
    FiberSpawned {
        /// The new fiber.
        fiber: FiberId,
        /// The fiber that spawned it.
        parent: Option<FiberId>,
        /// Entry address.
        pc: Addr,
    },
    /// A fiber parked.
    FiberParked {
        /// The fiber.
        fiber: FiberId,
        /// Wait-state label.
        wait: String,
        /// Where it parked.
        pc: Addr,
    },
    /// A parked fiber was woken.
    FiberResumed {
        /// The fiber.
        fiber: FiberId,
        /// Its new loop epoch.
        epoch: u64,
    },
    /// A fiber finished.
    FiberEnded {
        /// The fiber.
        fiber: FiberId,
    },

    /// A loop counter moved.
    CounterIncremented {
        /// Counter name.
        counter: String,
        /// New value.
        value: i64,
    },

    /// A split activated a join.
    JoinActivated {
        /// The join.
        join: NodeKey,
        /// Activation number.
        activation: u64,
        /// Expected arrivals.
        expected: u32,
    },
    /// A fiber arrived at a join.
    JoinArrived {
        /// The join.
        join: NodeKey,
        /// Arrivals so far.
        arrived: u32,
        /// Expected arrivals.
        expected: u32,
    },
    /// The last expected fiber arrived.
    JoinSatisfied {
        /// The join.
        join: NodeKey,
        /// Activation number.
        activation: u64,
    },

    /// A race arm won.
    RaceWon {
        /// The race.
        race: NodeKey,
        /// Winning arm's target address.
        target: Addr,
    },
    /// A losing race arm was cancelled.
    RaceArmCancelled {
        /// The race.
        race: NodeKey,
        /// Losing arm's target address.
        target: Addr,
    },
    /// A boundary timer fired.
    BoundaryFired {
        /// The boundary node.
        boundary: NodeKey,
        /// Whether the host was cancelled.
        interrupting: bool,
    },

    /// A job was created.
    JobDispatched {
        /// The job.
        job_key: JobKey,
        /// Its task type.
        task_type: String,
    },
    /// A job's result was applied.
    JobCompleted {
        /// The job.
        job_key: JobKey,
    },
    /// A job failed and will be retried.
    JobRetryScheduled {
        /// The job.
        job_key: JobKey,
        /// Attempt that will run next.
        attempt: u32,
        /// Earliest claim time.
        not_before: DateTime<Utc>,
    },
    /// A business error moved the fiber to an error route.
    JobErrorRouted {
        /// The job.
        job_key: JobKey,
        /// The error code.
        code: String,
    },
    /// A job moved to the dead-letter queue.
    JobDeadLettered {
        /// The job.
        job_key: JobKey,
    },
    /// A job's branch was cancelled.
    JobCancelled {
        /// The job.
        job_key: JobKey,
    },
    /// A dead-lettered job was put back in the queue.
    JobRequeued {
        /// The job.
        job_key: JobKey,
    },
    /// A result arrived for a job that no longer matters.
    CompletionIgnored {
        /// The job.
        job_key: JobKey,
    },

    /// An incident was raised.
    IncidentRaised {
        /// The incident.
        incident: IncidentId,
        /// Classification.
        class: ErrorClass,
    },
    /// An incident was resolved.
    IncidentResolved {
        /// The incident.
        incident: IncidentId,
    },

    /// A wake signal arrived for a superseded epoch or wait.
    SignalDiscarded {
        /// Target fiber.
        fiber: FiberId,
        /// Why it was dropped.
        reason: String,
    },
}

impl RuntimeEvent {
    /// The fiber this event concerns, if any.
    #[must_use]
    pub fn fiber(&self) -> Option<FiberId> {
        match self {
            Self::FiberSpawned { fiber, .. }
            | Self::FiberParked { fiber, .. }
            | Self::FiberResumed { fiber, .. }
            | Self::FiberEnded { fiber }
            | Self::SignalDiscarded { fiber, .. } => Some(*fiber),
            _ => None,
        }
    }

    /// The job this event concerns, if any.
    #[must_use]
    pub fn job_key(&self) -> Option<&JobKey> {
        match self {
            Self::JobDispatched { job_key, .. }
            | Self::JobCompleted { job_key }
            | Self::JobRetryScheduled { job_key, .. }
            | Self::JobErrorRouted { job_key, .. }
            | Self::JobDeadLettered { job_key }
            | Self::JobCancelled { job_key }
            | Self::JobRequeued { job_key }
            | Self::CompletionIgnored { job_key } => Some(job_key),
            _ => None,
        }
    }

    /// Returns `true` for events that end the instance.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InstanceCompleted | Self::InstanceTerminated { .. } | Self::InstanceCancelled { .. }
        )
    }
}

/// A persisted event with its per-instance sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Owning instance.
    pub instance: InstanceId,
    /// Monotonic sequence within the instance, starting at 1.
    pub seq: u64,
    /// Commit time.
    pub at: DateTime<Utc>,
    /// Payload.
    pub event: RuntimeEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tag_is_snake_case() {
        let json = serde_json::to_value(RuntimeEvent::InstanceCompleted).unwrap();
        assert_eq!(json["event"], "instance_completed");
    }

    #[test]
    fn fiber_accessor() {
        let id = FiberId::new();
        assert_eq!(RuntimeEvent::FiberEnded { fiber: id }.fiber(), Some(id));
        assert_eq!(RuntimeEvent::InstanceCompleted.fiber(), None);
    }

    #[test]
    fn job_key_accessor() {
        let key = JobKey::from_raw("k");
        let event = RuntimeEvent::JobCompleted { job_key: key.clone() };
        assert_eq!(event.job_key(), Some(&key));
        assert!(!event.is_terminal());
    }

    #[test]
    fn record_roundtrip() {
        let record = EventRecord {
            instance: InstanceId::new(),
            seq: 3,
            at: Utc::now(),
            event: RuntimeEvent::InstanceCancelled { reason: "ops".into() },
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
