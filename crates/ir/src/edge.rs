//! Sequence flows between process nodes.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use weft_core::NodeKey;

use crate::condition::Condition;

/// A directed flow from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node.
    pub from: NodeKey,
    /// Target node.
    pub to: NodeKey,
    /// Guard evaluated by routing gateways.
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Taken when no other flow of the gateway is.
    #[serde(default)]
    pub is_default: bool,
    /// Business error code this flow handles (service tasks only).
    #[serde(default)]
    pub error_code: Option<String>,
}

impl Edge {
    /// Create an unconditional flow.
    #[must_use]
    pub fn new(from: NodeKey, to: NodeKey) -> Self {
        Self {
            from,
            to,
            condition: None,
            is_default: false,
            error_code: None,
        }
    }

    /// Guard the flow with a condition.
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Mark the flow as the gateway default.
    #[must_use]
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Route a business error code along this flow.
    #[must_use]
    pub fn on_error(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Returns `true` if this flow handles a business error.
    #[must_use]
    pub fn is_error_route(&self) -> bool {
        self.error_code.is_some()
    }

    /// Returns `true` if this flow forms a self-loop.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }

    /// Total order used wherever the compiler must not depend on insertion
    /// order: normal flows before defaults before error routes, then by
    /// condition, then by target.
    #[must_use]
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        let rank = |e: &Self| (e.error_code.is_some(), e.is_default);
        rank(self)
            .cmp(&rank(other))
            .then_with(|| self.error_code.cmp(&other.error_code))
            .then_with(|| self.condition.cmp(&other.condition))
            .then_with(|| self.to.cmp(&other.to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s).unwrap()
    }

    #[test]
    fn builder_sets_fields() {
        let e = Edge::new(key("gw"), key("a"))
            .with_condition(Condition::flag("x"))
            .as_default();
        assert!(e.is_default);
        assert_eq!(e.condition, Some(Condition::flag("x")));
        assert!(!e.is_error_route());
    }

    #[test]
    fn canonical_order_puts_defaults_and_errors_last() {
        let normal = Edge::new(key("t"), key("z"));
        let default = Edge::new(key("t"), key("a")).as_default();
        let error = Edge::new(key("t"), key("b")).on_error("E1");
        let mut edges = vec![error.clone(), default.clone(), normal.clone()];
        edges.sort_by(Edge::canonical_cmp);
        assert_eq!(edges, vec![normal, default, error]);
    }

    #[test]
    fn canonical_order_ignores_insertion_order() {
        let a = Edge::new(key("g"), key("a")).with_condition(Condition::flag("p"));
        let b = Edge::new(key("g"), key("b")).with_condition(Condition::flag("q"));
        let mut one = vec![a.clone(), b.clone()];
        let mut two = vec![b, a];
        one.sort_by(Edge::canonical_cmp);
        two.sort_by(Edge::canonical_cmp);
        assert_eq!(one, two);
    }
}
