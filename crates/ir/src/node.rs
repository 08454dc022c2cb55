//! Process nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use weft_core::NodeKey;

/// A single element of a process graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Program-unique identifier.
    pub id: NodeKey,
    /// What the node does.
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    /// Create a node.
    #[must_use]
    pub fn new(id: NodeKey, kind: NodeKind) -> Self {
        Self { id, kind }
    }

    /// The gateway kind and direction, if this node is a parallel or
    /// inclusive gateway.
    #[must_use]
    pub fn gateway(&self) -> Option<(GatewayKind, GatewayDirection)> {
        match &self.kind {
            NodeKind::ParallelGateway { direction, .. } => Some((GatewayKind::Parallel, *direction)),
            NodeKind::InclusiveGateway { direction, .. } => {
                Some((GatewayKind::Inclusive, *direction))
            }
            _ => None,
        }
    }

    /// `true` for a diverging gateway of `kind`.
    #[must_use]
    pub fn is_split(&self, kind: GatewayKind) -> bool {
        self.gateway() == Some((kind, GatewayDirection::Diverging))
    }

    /// `true` for a converging gateway of `kind`.
    #[must_use]
    pub fn is_join(&self, kind: GatewayKind) -> bool {
        self.gateway() == Some((kind, GatewayDirection::Converging))
    }

    /// `true` if outgoing flows may carry conditions and default markers.
    #[must_use]
    pub fn routes_conditionally(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::ExclusiveGateway
                | NodeKind::InclusiveGateway {
                    direction: GatewayDirection::Diverging,
                    ..
                }
        )
    }

    /// `true` if a boundary timer may be attached to this node.
    #[must_use]
    pub fn can_host_boundary(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::ServiceTask { .. } | NodeKind::MessageWait { .. } | NodeKind::HumanWait { .. }
        )
    }
}

/// The closed set of process elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; exactly one per process.
    Start,
    /// Exit point. With `terminate`, every other fiber of the instance is
    /// cancelled too.
    End {
        /// Terminate the whole instance rather than just this path.
        #[serde(default)]
        terminate: bool,
    },
    /// Work delegated to an external executor as a job.
    ServiceTask {
        /// Logical job type executors subscribe to.
        task_type: String,
        /// Retries after the first attempt before the job is dead-lettered.
        #[serde(default)]
        retries: u32,
    },
    /// Routes to exactly one outgoing flow.
    ExclusiveGateway,
    /// Fans out to every branch, or joins all of them.
    ParallelGateway {
        /// Split or join.
        direction: GatewayDirection,
        /// Optional explicit partner of a split, checked by the verifier.
        #[serde(default)]
        join_ref: Option<NodeKey>,
    },
    /// Fans out to every branch whose condition holds, or joins those.
    InclusiveGateway {
        /// Split or join.
        direction: GatewayDirection,
        /// Optional explicit partner of a split, checked by the verifier.
        #[serde(default)]
        join_ref: Option<NodeKey>,
    },
    /// Suspends for a fixed duration.
    TimerWait {
        /// Delay in milliseconds.
        duration_ms: u64,
    },
    /// Suspends until a named message with a matching correlation arrives.
    MessageWait {
        /// Message name.
        name: String,
        /// Flag holding the correlation value; the instance correlation id
        /// when absent.
        #[serde(default)]
        correlation_key: Option<String>,
    },
    /// Suspends until a person completes `task`.
    HumanWait {
        /// Human task name.
        task: String,
    },
    /// Event-based gateway: the first arm to fire wins.
    RaceWait {
        /// Competing triggers and where each one leads.
        arms: Vec<RaceArm>,
    },
    /// A timer attached to a waiting host node.
    BoundaryTimer {
        /// The node the timer watches.
        host: NodeKey,
        /// Delay in milliseconds, measured from when the host starts waiting.
        duration_ms: u64,
        /// Whether firing cancels the host.
        #[serde(default = "default_true")]
        interrupting: bool,
    },
}

fn default_true() -> bool {
    true
}

impl NodeKind {
    /// Short kind name used in listings and messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End { terminate: false } => "end",
            Self::End { terminate: true } => "terminate_end",
            Self::ServiceTask { .. } => "service_task",
            Self::ExclusiveGateway => "exclusive_gateway",
            Self::ParallelGateway { .. } => "parallel_gateway",
            Self::InclusiveGateway { .. } => "inclusive_gateway",
            Self::TimerWait { .. } => "timer_wait",
            Self::MessageWait { .. } => "message_wait",
            Self::HumanWait { .. } => "human_wait",
            Self::RaceWait { .. } => "race_wait",
            Self::BoundaryTimer { .. } => "boundary_timer",
        }
    }
}

/// Whether a gateway fans out or joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayDirection {
    /// One incoming flow, several outgoing.
    Diverging,
    /// Several incoming flows, one outgoing.
    Converging,
}

/// Gateways that need a join partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    /// Every branch is taken.
    Parallel,
    /// The branches whose conditions hold are taken.
    Inclusive,
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Inclusive => write!(f, "inclusive"),
        }
    }
}

/// One arm of a [`NodeKind::RaceWait`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceArm {
    /// What fires the arm.
    pub trigger: RaceTrigger,
    /// Where the winning arm continues.
    pub target: NodeKey,
}

/// Trigger of a race arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaceTrigger {
    /// Fires after a delay.
    Timer {
        /// Delay in milliseconds.
        duration_ms: u64,
    },
    /// Fires when a matching message arrives.
    Message {
        /// Message name.
        name: String,
        /// Flag holding the correlation value.
        #[serde(default)]
        correlation_key: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s).unwrap()
    }

    #[test]
    fn gateway_classification() {
        let split = Node::new(
            key("fork"),
            NodeKind::ParallelGateway {
                direction: GatewayDirection::Diverging,
                join_ref: None,
            },
        );
        assert!(split.is_split(GatewayKind::Parallel));
        assert!(!split.is_join(GatewayKind::Parallel));
        assert!(!split.is_split(GatewayKind::Inclusive));
        assert!(!split.routes_conditionally());
    }

    #[test]
    fn inclusive_split_routes_conditionally() {
        let split = Node::new(
            key("or"),
            NodeKind::InclusiveGateway {
                direction: GatewayDirection::Diverging,
                join_ref: None,
            },
        );
        assert!(split.routes_conditionally());
    }

    #[test]
    fn serde_shape_is_flat_and_tagged() {
        let node = Node::new(
            key("t1"),
            NodeKind::ServiceTask {
                task_type: "charge".into(),
                retries: 2,
            },
        );
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "t1", "type": "service_task", "task_type": "charge", "retries": 2})
        );
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn boundary_defaults_to_interrupting() {
        let json = serde_json::json!({"id": "b", "type": "boundary_timer", "host": "t1", "duration_ms": 10});
        let node: Node = serde_json::from_value(json).unwrap();
        assert!(matches!(
            node.kind,
            NodeKind::BoundaryTimer {
                interrupting: true,
                ..
            }
        ));
    }
}
