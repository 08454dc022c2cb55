//! IR construction and verification errors.

use thiserror::Error;
use weft_core::{NodeKey, NodeKeyError};

/// Errors raised while assembling a [`ProcessGraph`](crate::ProcessGraph).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    /// A node key failed validation.
    #[error("invalid node key: {0}")]
    InvalidKey(#[from] NodeKeyError),

    /// Two nodes share the same key.
    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeKey),

    /// An edge or reference points at a node that does not exist.
    #[error("{from} references unknown node: {missing}")]
    UnknownNode {
        /// The node holding the dangling reference.
        from: NodeKey,
        /// The key that could not be resolved.
        missing: NodeKey,
    },

    /// An edge has the same source and target node.
    #[error("self-loop detected on node: {0}")]
    SelfLoop(NodeKey),
}

/// A reason a graph is not structurally executable.
///
/// The verifier collects every violation it finds; any one of them blocks
/// compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// The graph has no Start node.
    #[error("process has no start node")]
    MissingStart,

    /// The graph has more than one Start node.
    #[error("process has multiple start nodes: {0:?}")]
    MultipleStarts(Vec<NodeKey>),

    /// A node that must not have incoming flows has one.
    #[error("{0} must not have incoming flows")]
    UnexpectedIncoming(NodeKey),

    /// A node has the wrong number of outgoing flows for its kind.
    #[error("{node} must have {expected} outgoing flow(s), found {found}")]
    WrongOutgoingCount {
        /// The offending node.
        node: NodeKey,
        /// Human-readable expectation, e.g. `"exactly 1"`.
        expected: &'static str,
        /// Actual number of outgoing flows.
        found: usize,
    },

    /// The node cannot be reached from Start.
    #[error("{0} is unreachable from start")]
    Unreachable(NodeKey),

    /// No path from the node leads to an End node.
    #[error("no path from {0} reaches an end node")]
    NoPathToEnd(NodeKey),

    /// A flow carries a condition but its source is not a routing gateway.
    #[error("flow {from} -> {to} has a condition but {from} is not an exclusive or inclusive gateway")]
    ConditionNotAllowed {
        /// Source node.
        from: NodeKey,
        /// Target node.
        to: NodeKey,
    },

    /// A flow is marked default but its source is not a routing gateway.
    #[error("flow {from} -> {to} is marked default but {from} is not an exclusive or inclusive gateway")]
    DefaultNotAllowed {
        /// Source node.
        from: NodeKey,
        /// Target node.
        to: NodeKey,
    },

    /// A default flow also carries a condition.
    #[error("default flow {from} -> {to} must not carry a condition")]
    ConditionalDefault {
        /// Source node.
        from: NodeKey,
        /// Target node.
        to: NodeKey,
    },

    /// A flow carries an error code but its source is not a service task.
    #[error("flow {from} -> {to} routes an error but {from} is not a service task")]
    ErrorRouteNotAllowed {
        /// Source node.
        from: NodeKey,
        /// Target node.
        to: NodeKey,
    },

    /// Two error routes of one service task share a code.
    #[error("{node} routes error code {code:?} more than once")]
    DuplicateErrorCode {
        /// The service task.
        node: NodeKey,
        /// The repeated code.
        code: String,
    },

    /// More than one outgoing flow of a gateway is marked default.
    #[error("{0} has more than one default flow")]
    MultipleDefaults(NodeKey),

    /// Several outgoing conditions of an exclusive gateway can hold at once
    /// and no default flow disambiguates.
    #[error("{gateway} routes ambiguously: {witness}")]
    AmbiguousRouting {
        /// The exclusive gateway.
        gateway: NodeKey,
        /// A flag/counter assignment under which two or more flows are taken.
        witness: String,
    },

    /// No converging gateway of the same kind is reachable from a split.
    #[error("{0} has no matching converging gateway")]
    UnpairedGateway(NodeKey),

    /// The branches of a split converge on different gateways.
    #[error("branches of {gateway} converge on different gateways: {found:?}")]
    MismatchedPairing {
        /// The diverging gateway.
        gateway: NodeKey,
        /// Every converging gateway reached.
        found: Vec<NodeKey>,
    },

    /// A branch of a split reaches an End node before its converging gateway.
    #[error("branch {branch} of {gateway} ends before reaching its join")]
    BranchEscapesJoin {
        /// The diverging gateway.
        gateway: NodeKey,
        /// First node of the escaping branch.
        branch: NodeKey,
    },

    /// A split's declared `join_ref` disagrees with the join actually found.
    #[error("{gateway} declares join {declared} but its branches converge on {found}")]
    JoinRefMismatch {
        /// The diverging gateway.
        gateway: NodeKey,
        /// Declared partner.
        declared: NodeKey,
        /// Partner found by traversal.
        found: NodeKey,
    },

    /// A converging gateway is claimed by more than one split.
    #[error("join {join} is shared by several splits: {gateways:?}")]
    SharedJoin {
        /// The converging gateway.
        join: NodeKey,
        /// Every split that paired with it.
        gateways: Vec<NodeKey>,
    },

    /// A converging gateway that no split pairs with.
    #[error("converging gateway {0} has no matching split")]
    OrphanJoin(NodeKey),

    /// A race has no arms.
    #[error("race {0} has no arms")]
    EmptyRace(NodeKey),

    /// Two arms of a race lead to the same node.
    #[error("race {race} has several arms targeting {target}")]
    DuplicateRaceTarget {
        /// The race node.
        race: NodeKey,
        /// The shared target.
        target: NodeKey,
    },

    /// A race arm targets a node that cannot be entered by flow.
    #[error("race {race} arm targets {target}, which cannot be entered by a flow")]
    InvalidRaceTarget {
        /// The race node.
        race: NodeKey,
        /// The offending target.
        target: NodeKey,
    },

    /// A boundary timer is attached to a missing node.
    #[error("boundary {boundary} is attached to unknown node {host}")]
    BoundaryHostMissing {
        /// The boundary timer.
        boundary: NodeKey,
        /// The missing host.
        host: NodeKey,
    },

    /// A boundary timer is attached to a node that never waits.
    #[error("boundary {boundary} cannot attach to {host}; only tasks and message/human waits can host one")]
    BoundaryHostInvalid {
        /// The boundary timer.
        boundary: NodeKey,
        /// The host node.
        host: NodeKey,
    },

    /// A host carries more than one boundary timer.
    #[error("{0} has more than one boundary timer")]
    MultipleBoundaries(NodeKey),
}
