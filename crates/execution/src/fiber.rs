//! Fibers and their wait states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_bytecode::{Addr, REGISTER_COUNT};
use weft_core::{FiberId, IncidentId, InstanceId, NodeKey, Value};

use crate::job::JobKey;

/// A claim on one arrival at a join, handed out when a split forks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTicket {
    /// The join this fiber must eventually arrive at.
    pub join: NodeKey,
    /// Which activation of that join the ticket belongs to.
    pub activation: u64,
}

/// Link from a watchdog fiber to the host it watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watch {
    /// The host fiber.
    pub host: FiberId,
    /// The boundary timer node.
    pub boundary: NodeKey,
    /// Whether firing cancels the host.
    pub interrupting: bool,
    /// Where the watchdog continues when it fires.
    pub target: Addr,
}

/// The wake condition of one registered race arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArmWaitTrigger {
    /// Fires at `due_at`.
    Timer {
        /// Due time.
        due_at: DateTime<Utc>,
    },
    /// Fires on a message.
    Message {
        /// Message name.
        name: String,
        /// Correlation value.
        correlation: String,
    },
}

/// One armed race branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmWait {
    /// What wakes it.
    pub trigger: ArmWaitTrigger,
    /// Where it continues if it wins.
    pub target: Addr,
}

/// What a parked fiber is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WaitState {
    /// Runnable.
    #[default]
    Ready,
    /// A timer; also used by watchdog fibers.
    Timer {
        /// Due time.
        due_at: DateTime<Utc>,
    },
    /// A correlated message.
    Message {
        /// Message name.
        name: String,
        /// Correlation value.
        correlation: String,
    },
    /// A human task.
    Human {
        /// Task name.
        task: String,
    },
    /// Completion of a dispatched job.
    Job {
        /// The job.
        job_key: JobKey,
    },
    /// The first of several triggers.
    Race {
        /// The race node.
        race: NodeKey,
        /// Armed branches.
        arms: Vec<ArmWait>,
    },
    /// Halted on an open incident until an operator intervenes.
    Incident {
        /// The incident.
        incident: IncidentId,
    },
}

impl WaitState {
    /// Whether the fiber can run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Earliest time a timer (or timer arm) wakes this fiber.
    #[must_use]
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timer { due_at } => Some(*due_at),
            Self::Race { arms, .. } => arms
                .iter()
                .filter_map(|a| match &a.trigger {
                    ArmWaitTrigger::Timer { due_at } => Some(*due_at),
                    ArmWaitTrigger::Message { .. } => None,
                })
                .min(),
            _ => None,
        }
    }

    /// Whether a message with this name and correlation wakes the fiber.
    #[must_use]
    pub fn awaits_message(&self, name: &str, correlation: &str) -> bool {
        match self {
            Self::Message { name: n, correlation: c } => n == name && c == correlation,
            Self::Race { arms, .. } => arms.iter().any(|a| {
                matches!(&a.trigger, ArmWaitTrigger::Message { name: n, correlation: c } if n == name && c == correlation)
            }),
            _ => false,
        }
    }

    /// Short name, as stored and logged.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Timer { .. } => "timer",
            Self::Message { .. } => "message",
            Self::Human { .. } => "human",
            Self::Job { .. } => "job",
            Self::Race { .. } => "race",
            Self::Incident { .. } => "incident",
        }
    }
}

/// One thread of control inside an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fiber {
    /// Unique id.
    pub id: FiberId,
    /// Owning instance.
    pub instance: InstanceId,
    /// Spawn order within the instance; ready fibers run lowest first.
    pub seq: u64,
    /// Program counter.
    pub pc: Addr,
    /// Evaluation stack.
    pub stack: Vec<Value>,
    /// Local registers.
    pub registers: Vec<Value>,
    /// What the fiber is parked on.
    pub wait: WaitState,
    /// Bumped on every wake-up and loop iteration; only ever increases.
    pub loop_epoch: u64,
    /// Joins this fiber owes an arrival to, innermost last.
    pub tickets: Vec<JoinTicket>,
    /// The watchdog attached to this fiber, if any.
    #[serde(default)]
    pub watchdog: Option<FiberId>,
    /// Set on watchdog fibers.
    #[serde(default)]
    pub watch: Option<Watch>,
}

impl Fiber {
    /// A ready fiber at `pc`.
    #[must_use]
    pub fn new(instance: InstanceId, seq: u64, pc: Addr) -> Self {
        Self {
            id: FiberId::new(),
            instance,
            seq,
            pc,
            stack: Vec::new(),
            registers: vec![Value::default(); REGISTER_COUNT],
            wait: WaitState::Ready,
            loop_epoch: 0,
            tickets: Vec::new(),
            watchdog: None,
            watch: None,
        }
    }

    /// Leave the current wait and become runnable at `pc`.
    pub fn wake(&mut self, pc: Addr) {
        self.wait = WaitState::Ready;
        self.pc = pc;
        self.loop_epoch += 1;
    }

    /// Whether this is a watchdog fiber.
    #[must_use]
    pub fn is_watchdog(&self) -> bool {
        self.watch.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn new_fiber_is_ready_with_cleared_registers() {
        let f = Fiber::new(InstanceId::new(), 0, 4);
        assert!(f.wait.is_ready());
        assert_eq!(f.registers.len(), REGISTER_COUNT);
        assert_eq!(f.loop_epoch, 0);
    }

    #[test]
    fn wake_bumps_epoch() {
        let mut f = Fiber::new(InstanceId::new(), 0, 0);
        f.wait = WaitState::Human { task: "approve".into() };
        f.wake(9);
        assert_eq!(f.pc, 9);
        assert_eq!(f.loop_epoch, 1);
        assert!(f.wait.is_ready());
    }

    #[test]
    fn race_due_at_is_earliest_timer_arm() {
        let now = Utc::now();
        let wait = WaitState::Race {
            race: NodeKey::new("r").unwrap(),
            arms: vec![
                ArmWait {
                    trigger: ArmWaitTrigger::Timer {
                        due_at: now + TimeDelta::seconds(10),
                    },
                    target: 1,
                },
                ArmWait {
                    trigger: ArmWaitTrigger::Message {
                        name: "m".into(),
                        correlation: "c".into(),
                    },
                    target: 2,
                },
                ArmWait {
                    trigger: ArmWaitTrigger::Timer {
                        due_at: now + TimeDelta::seconds(5),
                    },
                    target: 3,
                },
            ],
        };
        assert_eq!(wait.due_at(), Some(now + TimeDelta::seconds(5)));
        assert!(wait.awaits_message("m", "c"));
        assert!(!wait.awaits_message("m", "other"));
    }

    #[test]
    fn wait_state_serde_is_tagged() {
        let json = serde_json::to_value(WaitState::Human { task: "t".into() }).unwrap();
        assert_eq!(json["state"], "human");
    }
}
