//! Fluent builder for process graphs.

use std::time::Duration;

use weft_core::NodeKey;

use crate::condition::Condition;
use crate::edge::Edge;
use crate::error::IrError;
use crate::graph::ProcessGraph;
use crate::node::{GatewayDirection, Node, NodeKind, RaceArm, RaceTrigger};

/// Accumulates nodes and flows by string key, then assembles a
/// [`ProcessGraph`].
///
/// Key validation errors are deferred to [`build`](Self::build) so the
/// chain stays infallible.
#[derive(Debug, Default)]
pub struct ProcessBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    errors: Vec<IrError>,
}

impl ProcessBuilder {
    /// Start an empty process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, raw: &str) -> Option<NodeKey> {
        match NodeKey::new(raw) {
            Ok(key) => Some(key),
            Err(e) => {
                self.errors.push(e.into());
                None
            }
        }
    }

    /// Add a node of any kind.
    #[must_use]
    pub fn node(mut self, id: &str, kind: NodeKind) -> Self {
        if let Some(key) = self.key(id) {
            self.nodes.push(Node::new(key, kind));
        }
        self
    }

    /// Add a flow.
    #[must_use]
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Add the Start node.
    #[must_use]
    pub fn start(self, id: &str) -> Self {
        self.node(id, NodeKind::Start)
    }

    /// Add a plain End node.
    #[must_use]
    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeKind::End { terminate: false })
    }

    /// Add a terminating End node.
    #[must_use]
    pub fn terminate(self, id: &str) -> Self {
        self.node(id, NodeKind::End { terminate: true })
    }

    /// Add a service task without retries.
    #[must_use]
    pub fn service_task(self, id: &str, task_type: &str) -> Self {
        self.service_task_with_retries(id, task_type, 0)
    }

    /// Add a service task with a retry budget.
    #[must_use]
    pub fn service_task_with_retries(self, id: &str, task_type: &str, retries: u32) -> Self {
        self.node(
            id,
            NodeKind::ServiceTask {
                task_type: task_type.to_owned(),
                retries,
            },
        )
    }

    /// Add an exclusive gateway.
    #[must_use]
    pub fn exclusive(self, id: &str) -> Self {
        self.node(id, NodeKind::ExclusiveGateway)
    }

    /// Add a diverging parallel gateway.
    #[must_use]
    pub fn parallel_split(self, id: &str) -> Self {
        self.node(
            id,
            NodeKind::ParallelGateway {
                direction: GatewayDirection::Diverging,
                join_ref: None,
            },
        )
    }

    /// Add a converging parallel gateway.
    #[must_use]
    pub fn parallel_join(self, id: &str) -> Self {
        self.node(
            id,
            NodeKind::ParallelGateway {
                direction: GatewayDirection::Converging,
                join_ref: None,
            },
        )
    }

    /// Add a diverging inclusive gateway.
    #[must_use]
    pub fn inclusive_split(self, id: &str) -> Self {
        self.node(
            id,
            NodeKind::InclusiveGateway {
                direction: GatewayDirection::Diverging,
                join_ref: None,
            },
        )
    }

    /// Add a converging inclusive gateway.
    #[must_use]
    pub fn inclusive_join(self, id: &str) -> Self {
        self.node(
            id,
            NodeKind::InclusiveGateway {
                direction: GatewayDirection::Converging,
                join_ref: None,
            },
        )
    }

    /// Add a timer wait.
    #[must_use]
    pub fn timer(self, id: &str, duration: Duration) -> Self {
        self.node(
            id,
            NodeKind::TimerWait {
                duration_ms: duration.as_millis() as u64,
            },
        )
    }

    /// Add a message wait correlated by the flag `correlation_key`, or by
    /// the instance correlation id when `None`.
    #[must_use]
    pub fn message(self, id: &str, name: &str, correlation_key: Option<&str>) -> Self {
        self.node(
            id,
            NodeKind::MessageWait {
                name: name.to_owned(),
                correlation_key: correlation_key.map(str::to_owned),
            },
        )
    }

    /// Add a human wait.
    #[must_use]
    pub fn human(self, id: &str, task: &str) -> Self {
        self.node(
            id,
            NodeKind::HumanWait {
                task: task.to_owned(),
            },
        )
    }

    /// Add a race; each arm is a trigger and the key of the node it leads to.
    #[must_use]
    pub fn race(mut self, id: &str, arms: Vec<(RaceTrigger, &str)>) -> Self {
        let mut resolved = Vec::with_capacity(arms.len());
        for (trigger, target) in arms {
            if let Some(target) = self.key(target) {
                resolved.push(RaceArm { trigger, target });
            }
        }
        self.node(id, NodeKind::RaceWait { arms: resolved })
    }

    /// Attach a boundary timer to `host`.
    #[must_use]
    pub fn boundary_timer(mut self, id: &str, host: &str, after: Duration, interrupting: bool) -> Self {
        let Some(host) = self.key(host) else {
            return self;
        };
        self.node(
            id,
            NodeKind::BoundaryTimer {
                host,
                duration_ms: after.as_millis() as u64,
                interrupting,
            },
        )
    }

    fn push_edge(mut self, from: &str, to: &str, shape: impl FnOnce(Edge) -> Edge) -> Self {
        if let (Some(from), Some(to)) = (self.key(from), self.key(to)) {
            self.edges.push(shape(Edge::new(from, to)));
        }
        self
    }

    /// Add an unconditional flow.
    #[must_use]
    pub fn flow(self, from: &str, to: &str) -> Self {
        self.push_edge(from, to, |e| e)
    }

    /// Add a conditional flow.
    #[must_use]
    pub fn flow_when(self, from: &str, to: &str, condition: Condition) -> Self {
        self.push_edge(from, to, |e| e.with_condition(condition))
    }

    /// Add a default flow.
    #[must_use]
    pub fn default_flow(self, from: &str, to: &str) -> Self {
        self.push_edge(from, to, Edge::as_default)
    }

    /// Add a flow taken when the task fails with business error `code`.
    #[must_use]
    pub fn error_flow(self, from: &str, to: &str, code: &str) -> Self {
        self.push_edge(from, to, |e| e.on_error(code))
    }

    /// Assemble the graph. Reports the first key or reference error.
    pub fn build(mut self) -> Result<ProcessGraph, IrError> {
        if !self.errors.is_empty() {
            return Err(self.errors.swap_remove(0));
        }
        ProcessGraph::from_parts(self.nodes, self.edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_linear_process() {
        let g = ProcessBuilder::new()
            .start("start")
            .service_task("t1", "charge")
            .end("end")
            .flow("start", "t1")
            .flow("t1", "end")
            .build()
            .unwrap();
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn invalid_key_surfaces_on_build() {
        let err = ProcessBuilder::new().start("bad key").build().unwrap_err();
        assert!(matches!(err, IrError::InvalidKey(_)));
    }

    #[test]
    fn race_arms_resolve_targets() {
        let g = ProcessBuilder::new()
            .race(
                "race",
                vec![
                    (RaceTrigger::Timer { duration_ms: 5_000 }, "timeout"),
                    (
                        RaceTrigger::Message {
                            name: "m".into(),
                            correlation_key: None,
                        },
                        "got_message",
                    ),
                ],
            )
            .end("timeout")
            .end("got_message")
            .build()
            .unwrap();
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn edge_shapes() {
        let g = ProcessBuilder::new()
            .service_task("t", "x")
            .exclusive("gw")
            .end("a")
            .end("b")
            .error_flow("t", "a", "E42")
            .flow("t", "gw")
            .flow_when("gw", "a", Condition::flag("ok"))
            .default_flow("gw", "b")
            .build()
            .unwrap();
        let gw = NodeKey::new("gw").unwrap();
        let out = g.outgoing(&gw);
        assert!(out[0].condition.is_some());
        assert!(out[1].is_default);
        let t = NodeKey::new("t").unwrap();
        assert_eq!(g.outgoing(&t)[1].error_code.as_deref(), Some("E42"));
    }
}
