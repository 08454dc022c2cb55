//! Process graph built on `petgraph`.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use weft_core::NodeKey;

use crate::edge::Edge;
use crate::error::IrError;
use crate::node::{Node, NodeKind};

/// A directed graph of process nodes and sequence flows.
///
/// Every accessor returning several edges or nodes does so in canonical
/// order (see [`Edge::canonical_cmp`]), so nothing downstream depends on the
/// order the front-end inserted them in.
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    graph: DiGraph<Node, Edge>,
    index_map: HashMap<NodeKey, NodeIndex>,
}

impl ProcessGraph {
    /// Assemble a graph from nodes and flows.
    ///
    /// Each race arm contributes an implicit flow from the race to its
    /// target. Fails on duplicate keys, dangling references and self-loops;
    /// everything else is left to the verifier.
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self, IrError> {
        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();

        for node in nodes {
            if index_map.contains_key(&node.id) {
                return Err(IrError::DuplicateNode(node.id));
            }
            let id = node.id.clone();
            let idx = graph.add_node(node);
            index_map.insert(id, idx);
        }

        let mut implicit = Vec::new();
        for idx in graph.node_indices() {
            let node: &Node = &graph[idx];
            if let NodeKind::RaceWait { arms } = &node.kind {
                for arm in arms {
                    implicit.push(Edge::new(node.id.clone(), arm.target.clone()));
                }
            }
        }

        for edge in edges.into_iter().chain(implicit) {
            let from_idx = *index_map.get(&edge.from).ok_or_else(|| IrError::UnknownNode {
                from: edge.to.clone(),
                missing: edge.from.clone(),
            })?;
            let to_idx = *index_map.get(&edge.to).ok_or_else(|| IrError::UnknownNode {
                from: edge.from.clone(),
                missing: edge.to.clone(),
            })?;
            if edge.is_self_loop() {
                return Err(IrError::SelfLoop(edge.from));
            }
            graph.add_edge(from_idx, to_idx, edge);
        }

        Ok(Self { graph, index_map })
    }

    /// Look up a node by key.
    #[must_use]
    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.index_map.get(key).map(|&idx| &self.graph[idx])
    }

    /// Returns `true` if a node with this key exists.
    #[must_use]
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.index_map.contains_key(key)
    }

    /// All nodes, ordered by key.
    #[must_use]
    pub fn nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// All flows, including implicit race-arm flows, in canonical order.
    #[must_use]
    pub fn edges(&self) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.graph.edge_weights().collect();
        edges.sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.canonical_cmp(b)));
        edges
    }

    /// Keys of every Start node.
    #[must_use]
    pub fn start_nodes(&self) -> Vec<&NodeKey> {
        self.nodes()
            .into_iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .map(|n| &n.id)
            .collect()
    }

    /// Flows leaving `key`, in canonical order.
    #[must_use]
    pub fn outgoing(&self, key: &NodeKey) -> Vec<&Edge> {
        self.edges_directed(key, Direction::Outgoing)
    }

    /// Flows entering `key`, in canonical order.
    #[must_use]
    pub fn incoming(&self, key: &NodeKey) -> Vec<&Edge> {
        let mut edges = self.edges_directed(key, Direction::Incoming);
        edges.sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.canonical_cmp(b)));
        edges
    }

    fn edges_directed(&self, key: &NodeKey, direction: Direction) -> Vec<&Edge> {
        let Some(&idx) = self.index_map.get(key) else {
            return Vec::new();
        };
        let mut edges: Vec<&Edge> = self
            .graph
            .edges_directed(idx, direction)
            .map(|e| e.weight())
            .collect();
        edges.sort_by(|a, b| a.canonical_cmp(b));
        edges
    }

    /// Boundary timers attached to `host`, ordered by key.
    #[must_use]
    pub fn boundaries_of(&self, host: &NodeKey) -> Vec<&Node> {
        self.nodes()
            .into_iter()
            .filter(|n| matches!(&n.kind, NodeKind::BoundaryTimer { host: h, .. } if h == host))
            .collect()
    }

    /// Nodes control can move to from `key`: flow targets first, then any
    /// attached boundary timers.
    #[must_use]
    pub fn flow_successors(&self, key: &NodeKey) -> Vec<&NodeKey> {
        let mut out: Vec<&NodeKey> = Vec::new();
        for edge in self.outgoing(key) {
            if !out.contains(&&edge.to) {
                out.push(&edge.to);
            }
        }
        out.extend(self.boundaries_of(key).into_iter().map(|n| &n.id));
        out
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of flows, including implicit race-arm flows.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{RaceArm, RaceTrigger};

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s).unwrap()
    }

    fn node(id: &str, kind: NodeKind) -> Node {
        Node::new(key(id), kind)
    }

    fn task(id: &str) -> Node {
        node(
            id,
            NodeKind::ServiceTask {
                task_type: id.to_owned(),
                retries: 0,
            },
        )
    }

    #[test]
    fn builds_linear_graph() {
        let g = ProcessGraph::from_parts(
            vec![node("s", NodeKind::Start), task("t"), node("e", NodeKind::End { terminate: false })],
            vec![Edge::new(key("s"), key("t")), Edge::new(key("t"), key("e"))],
        )
        .unwrap();
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.start_nodes(), vec![&key("s")]);
        assert_eq!(g.flow_successors(&key("t")), vec![&key("e")]);
    }

    #[test]
    fn rejects_duplicate_node() {
        let err = ProcessGraph::from_parts(vec![task("t"), task("t")], vec![]).unwrap_err();
        assert_eq!(err, IrError::DuplicateNode(key("t")));
    }

    #[test]
    fn rejects_unknown_target() {
        let err = ProcessGraph::from_parts(vec![task("t")], vec![Edge::new(key("t"), key("nope"))])
            .unwrap_err();
        assert!(matches!(err, IrError::UnknownNode { missing, .. } if missing == key("nope")));
    }

    #[test]
    fn rejects_self_loop() {
        let err = ProcessGraph::from_parts(vec![task("t")], vec![Edge::new(key("t"), key("t"))])
            .unwrap_err();
        assert_eq!(err, IrError::SelfLoop(key("t")));
    }

    #[test]
    fn race_arms_become_flows() {
        let race = node(
            "race",
            NodeKind::RaceWait {
                arms: vec![
                    RaceArm {
                        trigger: RaceTrigger::Timer { duration_ms: 5 },
                        target: key("late"),
                    },
                    RaceArm {
                        trigger: RaceTrigger::Message {
                            name: "m".into(),
                            correlation_key: None,
                        },
                        target: key("early"),
                    },
                ],
            },
        );
        let g = ProcessGraph::from_parts(vec![race, task("late"), task("early")], vec![]).unwrap();
        assert_eq!(g.flow_successors(&key("race")), vec![&key("early"), &key("late")]);
    }

    #[test]
    fn outgoing_order_is_insertion_independent() {
        let nodes = || vec![node("g", NodeKind::ExclusiveGateway), task("a"), task("b"), task("c")];
        let edges = vec![
            Edge::new(key("g"), key("c")),
            Edge::new(key("g"), key("a")),
            Edge::new(key("g"), key("b")),
        ];
        let mut reversed = edges.clone();
        reversed.reverse();
        let one = ProcessGraph::from_parts(nodes(), edges).unwrap();
        let two = ProcessGraph::from_parts(nodes(), reversed).unwrap();
        assert_eq!(one.outgoing(&key("g")), two.outgoing(&key("g")));
    }

    #[test]
    fn boundary_shows_up_as_successor() {
        let g = ProcessGraph::from_parts(
            vec![
                task("t"),
                node("e", NodeKind::End { terminate: false }),
                node(
                    "b",
                    NodeKind::BoundaryTimer {
                        host: key("t"),
                        duration_ms: 10,
                        interrupting: true,
                    },
                ),
            ],
            vec![Edge::new(key("t"), key("e")), Edge::new(key("b"), key("e"))],
        )
        .unwrap();
        assert_eq!(g.flow_successors(&key("t")), vec![&key("e"), &key("b")]);
    }
}
