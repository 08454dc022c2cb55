//! Structural verification that collects every violation.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use weft_core::{NodeKey, Value};

use crate::edge::Edge;
use crate::error::StructuralError;
use crate::graph::ProcessGraph;
use crate::node::{GatewayDirection, GatewayKind, Node, NodeKind};

/// Upper bound on flag/counter assignments tried when proving an exclusive
/// gateway routes unambiguously.
const MAX_ASSIGNMENTS: usize = 4096;

/// A diverging gateway and the converging gateway its branches meet at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPair {
    /// Parallel or inclusive.
    pub kind: GatewayKind,
    /// The converging partner.
    pub join: NodeKey,
    /// Number of distinct branch entries leaving the split.
    pub branches: u32,
}

/// A graph that passed [`verify`]. Lowering only accepts this type.
#[derive(Debug, Clone)]
pub struct VerifiedGraph {
    graph: ProcessGraph,
    start: NodeKey,
    pairs: BTreeMap<NodeKey, GatewayPair>,
}

impl VerifiedGraph {
    /// Verify `graph`, returning every structural error on failure.
    pub fn new(graph: ProcessGraph) -> Result<Self, Vec<StructuralError>> {
        let Analysis {
            errors,
            start,
            pairs,
            ..
        } = Analysis::run(&graph);
        if !errors.is_empty() {
            return Err(errors);
        }
        let Some(start) = start else {
            return Err(vec![StructuralError::MissingStart]);
        };
        Ok(Self {
            graph,
            start,
            pairs,
        })
    }

    /// The verified graph.
    #[must_use]
    pub fn graph(&self) -> &ProcessGraph {
        &self.graph
    }

    /// The unique Start node.
    #[must_use]
    pub fn start(&self) -> &NodeKey {
        &self.start
    }

    /// The join partner of a diverging gateway.
    #[must_use]
    pub fn pair(&self, split: &NodeKey) -> Option<&GatewayPair> {
        self.pairs.get(split)
    }

    /// Every split and its partner, ordered by split key.
    #[must_use]
    pub fn pairs(&self) -> &BTreeMap<NodeKey, GatewayPair> {
        &self.pairs
    }
}

/// Check that `graph` is structurally executable.
///
/// Never mutates the graph and never stops at the first problem; an empty
/// result means the graph can be lowered.
#[must_use]
pub fn verify(graph: &ProcessGraph) -> Vec<StructuralError> {
    Analysis::run(graph).errors
}

struct Analysis<'g> {
    graph: &'g ProcessGraph,
    errors: Vec<StructuralError>,
    start: Option<NodeKey>,
    pairs: BTreeMap<NodeKey, GatewayPair>,
}

impl<'g> Analysis<'g> {
    fn run(graph: &'g ProcessGraph) -> Self {
        let mut this = Self {
            graph,
            errors: Vec::new(),
            start: None,
            pairs: BTreeMap::new(),
        };

        // 1. Exactly one start
        let starts = graph.start_nodes();
        match starts.as_slice() {
            [] => this.errors.push(StructuralError::MissingStart),
            [only] => this.start = Some((*only).clone()),
            many => this
                .errors
                .push(StructuralError::MultipleStarts(many.iter().map(|k| (*k).clone()).collect())),
        }

        // 2. Per-node shape
        for node in graph.nodes() {
            this.check_node(node);
        }

        // 3. Reachability in both directions
        this.check_reachability();

        // 4. Gateway pairing
        this.pair_gateways(GatewayKind::Parallel);
        this.pair_gateways(GatewayKind::Inclusive);

        this
    }

    fn check_node(&mut self, node: &Node) {
        let graph = self.graph;
        let out = graph.outgoing(&node.id);
        let has_incoming = !graph.incoming(&node.id).is_empty();

        for edge in &out {
            self.check_edge(node, edge);
        }

        match &node.kind {
            NodeKind::Start => {
                if has_incoming {
                    self.errors.push(StructuralError::UnexpectedIncoming(node.id.clone()));
                }
                self.expect_outgoing(node, out.len(), 1);
            }
            NodeKind::End { .. } => {
                if !out.is_empty() {
                    self.errors.push(StructuralError::WrongOutgoingCount {
                        node: node.id.clone(),
                        expected: "0",
                        found: out.len(),
                    });
                }
            }
            NodeKind::ServiceTask { .. } => {
                let normal = out.iter().filter(|e| !e.is_error_route()).count();
                self.expect_outgoing(node, normal, 1);
                let mut codes = BTreeSet::new();
                for code in out.iter().filter_map(|e| e.error_code.as_ref()) {
                    if !codes.insert(code) {
                        self.errors.push(StructuralError::DuplicateErrorCode {
                            node: node.id.clone(),
                            code: code.clone(),
                        });
                    }
                }
                self.check_boundary_count(node);
            }
            NodeKind::ExclusiveGateway => {
                self.expect_some_outgoing(node, out.len());
                let defaults = out.iter().filter(|e| e.is_default).count();
                if defaults > 1 {
                    self.errors.push(StructuralError::MultipleDefaults(node.id.clone()));
                }
                if defaults == 0 && out.len() > 1 {
                    self.check_ambiguity(node, &out);
                }
            }
            NodeKind::ParallelGateway { direction, .. } | NodeKind::InclusiveGateway { direction, .. } => {
                match direction {
                    GatewayDirection::Diverging => {
                        self.expect_some_outgoing(node, out.len());
                        if out.iter().filter(|e| e.is_default).count() > 1 {
                            self.errors.push(StructuralError::MultipleDefaults(node.id.clone()));
                        }
                    }
                    GatewayDirection::Converging => self.expect_outgoing(node, out.len(), 1),
                }
            }
            NodeKind::TimerWait { .. } => self.expect_outgoing(node, out.len(), 1),
            NodeKind::MessageWait { .. } | NodeKind::HumanWait { .. } => {
                self.expect_outgoing(node, out.len(), 1);
                self.check_boundary_count(node);
            }
            NodeKind::RaceWait { arms } => {
                if arms.is_empty() {
                    self.errors.push(StructuralError::EmptyRace(node.id.clone()));
                }
                let mut targets = BTreeSet::new();
                for arm in arms {
                    if !targets.insert(&arm.target) {
                        self.errors.push(StructuralError::DuplicateRaceTarget {
                            race: node.id.clone(),
                            target: arm.target.clone(),
                        });
                    }
                    let enterable = graph.node(&arm.target).is_some_and(|t| {
                        !matches!(t.kind, NodeKind::Start | NodeKind::BoundaryTimer { .. })
                    });
                    if !enterable {
                        self.errors.push(StructuralError::InvalidRaceTarget {
                            race: node.id.clone(),
                            target: arm.target.clone(),
                        });
                    }
                }
                if out.len() != arms.len() {
                    self.errors.push(StructuralError::WrongOutgoingCount {
                        node: node.id.clone(),
                        expected: "one per arm",
                        found: out.len(),
                    });
                }
            }
            NodeKind::BoundaryTimer { host, .. } => {
                match graph.node(host) {
                    None => self.errors.push(StructuralError::BoundaryHostMissing {
                        boundary: node.id.clone(),
                        host: host.clone(),
                    }),
                    Some(h) if !h.can_host_boundary() => {
                        self.errors.push(StructuralError::BoundaryHostInvalid {
                            boundary: node.id.clone(),
                            host: host.clone(),
                        });
                    }
                    Some(_) => {}
                }
                if has_incoming {
                    self.errors.push(StructuralError::UnexpectedIncoming(node.id.clone()));
                }
                self.expect_outgoing(node, out.len(), 1);
            }
        }
    }

    fn check_edge(&mut self, node: &Node, edge: &Edge) {
        let pair = || (edge.from.clone(), edge.to.clone());
        if edge.condition.is_some() && !node.routes_conditionally() {
            let (from, to) = pair();
            self.errors.push(StructuralError::ConditionNotAllowed { from, to });
        }
        if edge.is_default && !node.routes_conditionally() {
            let (from, to) = pair();
            self.errors.push(StructuralError::DefaultNotAllowed { from, to });
        }
        if edge.is_default && edge.condition.is_some() {
            let (from, to) = pair();
            self.errors.push(StructuralError::ConditionalDefault { from, to });
        }
        if edge.is_error_route() && !matches!(node.kind, NodeKind::ServiceTask { .. }) {
            let (from, to) = pair();
            self.errors.push(StructuralError::ErrorRouteNotAllowed { from, to });
        }
    }

    fn expect_outgoing(&mut self, node: &Node, found: usize, expected: usize) {
        if found != expected {
            self.errors.push(StructuralError::WrongOutgoingCount {
                node: node.id.clone(),
                expected: "exactly 1",
                found,
            });
        }
    }

    fn expect_some_outgoing(&mut self, node: &Node, found: usize) {
        if found == 0 {
            self.errors.push(StructuralError::WrongOutgoingCount {
                node: node.id.clone(),
                expected: "at least 1",
                found,
            });
        }
    }

    fn check_boundary_count(&mut self, node: &Node) {
        if self.graph.boundaries_of(&node.id).len() > 1 {
            self.errors.push(StructuralError::MultipleBoundaries(node.id.clone()));
        }
    }

    fn check_reachability(&mut self) {
        let graph = self.graph;
        let nodes = graph.nodes();

        if let Some(start) = self.start.clone() {
            let mut seen: HashSet<&NodeKey> = HashSet::new();
            let mut queue = VecDeque::from([&start]);
            seen.insert(&start);
            while let Some(key) = queue.pop_front() {
                for next in graph.flow_successors(key) {
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
            for node in &nodes {
                if !seen.contains(&node.id) {
                    self.errors.push(StructuralError::Unreachable(node.id.clone()));
                }
            }
        }

        // Fixed point: a node reaches an end if any successor does.
        let mut reaches_end: HashSet<&NodeKey> = nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::End { .. }))
            .map(|n| &n.id)
            .collect();
        loop {
            let before = reaches_end.len();
            for node in &nodes {
                if !reaches_end.contains(&node.id)
                    && graph
                        .flow_successors(&node.id)
                        .iter()
                        .any(|s| reaches_end.contains(*s))
                {
                    reaches_end.insert(&node.id);
                }
            }
            if reaches_end.len() == before {
                break;
            }
        }
        for node in &nodes {
            if !reaches_end.contains(&node.id) {
                self.errors.push(StructuralError::NoPathToEnd(node.id.clone()));
            }
        }
    }

    /// Successors followed when looking for a split's join: every flow
    /// target plus interrupting boundaries. Non-interrupting boundary paths
    /// run outside the branch and are not counted.
    fn branch_successors(&self, key: &NodeKey) -> Vec<&'g NodeKey> {
        let graph: &'g ProcessGraph = self.graph;
        let mut out: Vec<&'g NodeKey> = graph.outgoing(key).into_iter().map(|e| &e.to).collect();
        for b in graph.boundaries_of(key) {
            if matches!(b.kind, NodeKind::BoundaryTimer { interrupting: true, .. }) {
                out.push(&b.id);
            }
        }
        out
    }

    fn pair_gateways(&mut self, kind: GatewayKind) {
        let graph = self.graph;
        let depth_cap = graph.node_count();
        let mut claimed: BTreeMap<NodeKey, Vec<NodeKey>> = BTreeMap::new();

        for split in graph.nodes().into_iter().filter(|n| n.is_split(kind)) {
            let branches = graph.outgoing(&split.id);
            let mut found: BTreeSet<NodeKey> = BTreeSet::new();
            let mut escaped_any = false;

            for branch in &branches {
                let mut escaped = false;
                let mut seen: HashSet<(&NodeKey, usize)> = HashSet::new();
                let mut stack: Vec<(&NodeKey, usize)> = vec![(&branch.to, 0)];
                while let Some((key, depth)) = stack.pop() {
                    if key == &split.id || !seen.insert((key, depth)) {
                        continue;
                    }
                    let Some(node) = graph.node(key) else {
                        continue;
                    };
                    // Nesting counts splits and joins of both kinds so a
                    // converging gateway of the other kind at depth zero
                    // ends the walk as a pairing failure.
                    let next_depth = match node.gateway() {
                        Some((_, GatewayDirection::Converging)) if depth > 0 => depth - 1,
                        Some((k, GatewayDirection::Converging)) => {
                            if k == kind {
                                found.insert(key.clone());
                            }
                            continue;
                        }
                        Some((_, GatewayDirection::Diverging)) => depth + 1,
                        None if matches!(node.kind, NodeKind::End { .. }) => {
                            escaped = true;
                            continue;
                        }
                        None => depth,
                    };
                    if next_depth > depth_cap {
                        continue;
                    }
                    for next in self.branch_successors(key) {
                        stack.push((next, next_depth));
                    }
                }
                if escaped {
                    escaped_any = true;
                    self.errors.push(StructuralError::BranchEscapesJoin {
                        gateway: split.id.clone(),
                        branch: branch.to.clone(),
                    });
                }
            }

            match found.len() {
                0 => {
                    if !escaped_any {
                        self.errors.push(StructuralError::UnpairedGateway(split.id.clone()));
                    }
                }
                1 => {
                    let Some(join) = found.into_iter().next() else {
                        continue;
                    };
                    if let NodeKind::ParallelGateway {
                        join_ref: Some(declared),
                        ..
                    }
                    | NodeKind::InclusiveGateway {
                        join_ref: Some(declared),
                        ..
                    } = &split.kind
                        && declared != &join
                    {
                        self.errors.push(StructuralError::JoinRefMismatch {
                            gateway: split.id.clone(),
                            declared: declared.clone(),
                            found: join.clone(),
                        });
                    }
                    claimed.entry(join.clone()).or_default().push(split.id.clone());
                    self.pairs.insert(
                        split.id.clone(),
                        GatewayPair {
                            kind,
                            join,
                            branches: branches.len() as u32,
                        },
                    );
                }
                _ => self.errors.push(StructuralError::MismatchedPairing {
                    gateway: split.id.clone(),
                    found: found.into_iter().collect(),
                }),
            }
        }

        for (join, gateways) in &claimed {
            if gateways.len() > 1 {
                self.errors.push(StructuralError::SharedJoin {
                    join: join.clone(),
                    gateways: gateways.clone(),
                });
            }
        }
        for join in graph.nodes().into_iter().filter(|n| n.is_join(kind)) {
            if !claimed.contains_key(&join.id) {
                self.errors.push(StructuralError::OrphanJoin(join.id.clone()));
            }
        }
    }

    /// Flag an exclusive gateway without a default whose outgoing
    /// conditions can hold simultaneously.
    fn check_ambiguity(&mut self, node: &Node, out: &[&Edge]) {
        if let Some(unconditional) = out.iter().find(|e| e.condition.is_none()) {
            self.errors.push(StructuralError::AmbiguousRouting {
                gateway: node.id.clone(),
                witness: format!("flow to {} is unconditional", unconditional.to),
            });
            return;
        }

        let mut flag_consts: BTreeMap<String, BTreeSet<Value>> = BTreeMap::new();
        let mut counter_limits: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
        for edge in out {
            if let Some(c) = &edge.condition {
                c.collect_flags(&mut flag_consts);
                c.collect_counters(&mut counter_limits);
            }
        }

        let flag_domains: Vec<(String, Vec<Value>)> = flag_consts
            .into_iter()
            .map(|(flag, consts)| {
                let mut domain: BTreeSet<Value> = consts;
                domain.insert(Value::Bool(false));
                domain.insert(Value::Bool(true));
                // A truthy value distinct from every constant.
                domain.insert(Value::Text("\u{1}".to_owned()));
                (flag, domain.into_iter().collect())
            })
            .collect();
        let counter_domains: Vec<(String, Vec<i64>)> = counter_limits
            .into_iter()
            .map(|(counter, limits)| {
                let mut domain = BTreeSet::from([0_i64]);
                for l in limits {
                    domain.insert(l.saturating_sub(1));
                    domain.insert(l);
                }
                (counter, domain.into_iter().collect())
            })
            .collect();

        let radices: Vec<usize> = flag_domains
            .iter()
            .map(|(_, d)| d.len())
            .chain(counter_domains.iter().map(|(_, d)| d.len()))
            .collect();
        let total = radices
            .iter()
            .try_fold(1_usize, |acc, r| acc.checked_mul(*r).filter(|t| *t <= MAX_ASSIGNMENTS));
        let Some(total) = total else {
            tracing::debug!(gateway = %node.id, "too many variables to prove exclusive routing, skipping");
            return;
        };

        let mut digits = vec![0_usize; radices.len()];
        for _ in 0..total {
            let flags: BTreeMap<String, Value> = flag_domains
                .iter()
                .zip(&digits)
                .map(|((name, domain), &i)| (name.clone(), domain[i].clone()))
                .collect();
            let counters: BTreeMap<String, i64> = counter_domains
                .iter()
                .zip(&digits[flag_domains.len()..])
                .map(|((name, domain), &i)| (name.clone(), domain[i]))
                .collect();

            let taken: Vec<&NodeKey> = out
                .iter()
                .filter(|e| e.condition.as_ref().is_some_and(|c| c.evaluate(&flags, &counters)))
                .map(|e| &e.to)
                .collect();
            if taken.len() > 1 {
                let assignment: Vec<String> = flags
                    .iter()
                    .map(|(k, v)| format!("{k}={v:?}"))
                    .chain(counters.iter().map(|(k, v)| format!("#{k}={v}")))
                    .collect();
                let targets: Vec<String> = taken.iter().map(ToString::to_string).collect();
                self.errors.push(StructuralError::AmbiguousRouting {
                    gateway: node.id.clone(),
                    witness: format!("{} satisfies flows to {}", assignment.join(", "), targets.join(", ")),
                });
                return;
            }

            // Mixed-radix increment.
            for (digit, radix) in digits.iter_mut().zip(&radices) {
                *digit += 1;
                if *digit < *radix {
                    break;
                }
                *digit = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProcessBuilder;
    use crate::condition::Condition;
    use crate::node::RaceTrigger;
    use std::time::Duration;

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s).unwrap()
    }

    fn linear() -> ProcessBuilder {
        ProcessBuilder::new()
            .start("start")
            .service_task("t1", "work")
            .end("end")
            .flow("start", "t1")
            .flow("t1", "end")
    }

    fn diamond(split: fn(ProcessBuilder, &str) -> ProcessBuilder, join: fn(ProcessBuilder, &str) -> ProcessBuilder) -> ProcessBuilder {
        let b = ProcessBuilder::new().start("start");
        let b = split(b, "fork");
        let b = join(b, "join");
        b.service_task("a", "a")
            .service_task("b", "b")
            .end("end")
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "end")
    }

    #[test]
    fn linear_process_is_valid() {
        let g = linear().build().unwrap();
        assert!(verify(&g).is_empty());
        let verified = VerifiedGraph::new(g).unwrap();
        assert_eq!(verified.start(), &key("start"));
    }

    #[test]
    fn missing_start_is_reported() {
        let g = ProcessBuilder::new().end("end").build().unwrap();
        let errors = verify(&g);
        assert!(errors.contains(&StructuralError::MissingStart));
    }

    #[test]
    fn multiple_starts_are_reported() {
        let g = linear().start("other").flow("other", "t1").build().unwrap();
        assert!(verify(&g).iter().any(|e| matches!(e, StructuralError::MultipleStarts(s) if s.len() == 2)));
    }

    #[test]
    fn unreachable_node_is_reported() {
        let g = linear()
            .service_task("orphan", "x")
            .flow("orphan", "end")
            .build()
            .unwrap();
        assert_eq!(verify(&g), vec![StructuralError::Unreachable(key("orphan"))]);
    }

    #[test]
    fn dead_end_is_reported() {
        let g = ProcessBuilder::new()
            .start("start")
            .service_task("t1", "work")
            .flow("start", "t1")
            .build()
            .unwrap();
        let errors = verify(&g);
        assert!(errors.contains(&StructuralError::NoPathToEnd(key("t1"))));
        assert!(errors.iter().any(|e| matches!(e, StructuralError::WrongOutgoingCount { node, .. } if *node == key("t1"))));
    }

    #[test]
    fn cycle_without_exit_is_reported() {
        let g = ProcessBuilder::new()
            .start("start")
            .service_task("a", "a")
            .service_task("b", "b")
            .end("end")
            .flow("start", "a")
            .flow("a", "b")
            .flow("b", "a")
            .build()
            .unwrap();
        let errors = verify(&g);
        assert!(errors.contains(&StructuralError::NoPathToEnd(key("a"))));
        assert!(errors.contains(&StructuralError::NoPathToEnd(key("b"))));
    }

    #[test]
    fn parallel_diamond_pairs() {
        let g = diamond(ProcessBuilder::parallel_split, ProcessBuilder::parallel_join)
            .build()
            .unwrap();
        let verified = VerifiedGraph::new(g).unwrap();
        let pair = verified.pair(&key("fork")).unwrap();
        assert_eq!(pair.join, key("join"));
        assert_eq!(pair.branches, 2);
        assert_eq!(pair.kind, GatewayKind::Parallel);
    }

    #[test]
    fn mismatched_gateway_kinds_are_unpaired() {
        let g = diamond(ProcessBuilder::parallel_split, ProcessBuilder::inclusive_join)
            .build()
            .unwrap();
        let errors = verify(&g);
        assert!(errors.contains(&StructuralError::UnpairedGateway(key("fork"))));
        assert!(errors.contains(&StructuralError::OrphanJoin(key("join"))));
    }

    #[test]
    fn nested_splits_pair_with_their_own_joins() {
        let g = ProcessBuilder::new()
            .start("start")
            .parallel_split("outer")
            .parallel_split("inner")
            .parallel_join("inner_join")
            .parallel_join("outer_join")
            .service_task("a", "a")
            .service_task("b", "b")
            .service_task("c", "c")
            .end("end")
            .flow("start", "outer")
            .flow("outer", "inner")
            .flow("outer", "c")
            .flow("inner", "a")
            .flow("inner", "b")
            .flow("a", "inner_join")
            .flow("b", "inner_join")
            .flow("inner_join", "outer_join")
            .flow("c", "outer_join")
            .flow("outer_join", "end")
            .build()
            .unwrap();
        let verified = VerifiedGraph::new(g).unwrap();
        assert_eq!(verified.pair(&key("outer")).unwrap().join, key("outer_join"));
        assert_eq!(verified.pair(&key("inner")).unwrap().join, key("inner_join"));
    }

    #[test]
    fn inclusive_pair_nested_in_parallel_branch() {
        let g = ProcessBuilder::new()
            .start("start")
            .parallel_split("outer")
            .inclusive_split("or")
            .inclusive_join("or_join")
            .parallel_join("outer_join")
            .service_task("a", "a")
            .service_task("b", "b")
            .service_task("c", "c")
            .end("end")
            .flow("start", "outer")
            .flow("outer", "or")
            .flow("outer", "c")
            .flow_when("or", "a", Condition::flag("a"))
            .default_flow("or", "b")
            .flow("a", "or_join")
            .flow("b", "or_join")
            .flow("or_join", "outer_join")
            .flow("c", "outer_join")
            .flow("outer_join", "end")
            .build()
            .unwrap();
        let verified = VerifiedGraph::new(g).unwrap();
        assert_eq!(verified.pair(&key("outer")).unwrap().join, key("outer_join"));
        assert_eq!(verified.pair(&key("or")).unwrap().join, key("or_join"));
    }

    #[test]
    fn mismatched_join_is_not_reported_as_escape() {
        let g = diamond(ProcessBuilder::inclusive_split, ProcessBuilder::parallel_join)
            .build()
            .unwrap();
        let errors = verify(&g);
        assert!(errors.contains(&StructuralError::UnpairedGateway(key("fork"))));
        assert!(
            !errors
                .iter()
                .any(|e| matches!(e, StructuralError::BranchEscapesJoin { .. }))
        );
    }

    #[test]
    fn branch_escaping_to_end_is_reported() {
        let g = ProcessBuilder::new()
            .start("start")
            .parallel_split("fork")
            .parallel_join("join")
            .service_task("a", "a")
            .end("early")
            .end("end")
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "early")
            .flow("a", "join")
            .flow("join", "end")
            .build()
            .unwrap();
        assert!(verify(&g).contains(&StructuralError::BranchEscapesJoin {
            gateway: key("fork"),
            branch: key("early"),
        }));
    }

    #[test]
    fn join_ref_mismatch_is_reported() {
        let g = diamond(
            |b, id| {
                b.node(
                    id,
                    NodeKind::ParallelGateway {
                        direction: GatewayDirection::Diverging,
                        join_ref: Some(NodeKey::new("elsewhere").unwrap()),
                    },
                )
            },
            ProcessBuilder::parallel_join,
        )
        .build()
        .unwrap();
        assert!(verify(&g).iter().any(|e| matches!(e, StructuralError::JoinRefMismatch { .. })));
    }

    #[test]
    fn ambiguous_exclusive_routing_is_flagged() {
        let g = ProcessBuilder::new()
            .start("start")
            .exclusive("gw")
            .end("a")
            .end("b")
            .flow("start", "gw")
            .flow_when("gw", "a", Condition::flag("x"))
            .flow_when("gw", "b", Condition::flag("y"))
            .build()
            .unwrap();
        let errors = verify(&g);
        assert!(matches!(
            errors.as_slice(),
            [StructuralError::AmbiguousRouting { gateway, .. }] if *gateway == key("gw")
        ));
    }

    #[test]
    fn mutually_exclusive_conditions_pass_without_default() {
        let g = ProcessBuilder::new()
            .start("start")
            .exclusive("gw")
            .end("a")
            .end("b")
            .end("c")
            .flow("start", "gw")
            .flow_when("gw", "a", Condition::equals("tier", "gold"))
            .flow_when("gw", "b", Condition::equals("tier", "silver"))
            .flow_when("gw", "c", Condition::flag("x").negate())
            .build()
            .unwrap();
        // `tier == gold` and `!x` can hold together.
        assert!(!verify(&g).is_empty());

        let g = ProcessBuilder::new()
            .start("start")
            .exclusive("gw")
            .end("a")
            .end("b")
            .flow("start", "gw")
            .flow_when("gw", "a", Condition::flag("x"))
            .flow_when("gw", "b", Condition::flag("x").negate())
            .build()
            .unwrap();
        assert!(verify(&g).is_empty());
    }

    #[test]
    fn default_disambiguates() {
        let g = ProcessBuilder::new()
            .start("start")
            .exclusive("gw")
            .end("a")
            .end("b")
            .flow("start", "gw")
            .flow_when("gw", "a", Condition::flag("x"))
            .default_flow("gw", "b")
            .build()
            .unwrap();
        assert!(verify(&g).is_empty());
    }

    #[test]
    fn two_defaults_are_flagged() {
        let g = ProcessBuilder::new()
            .start("start")
            .exclusive("gw")
            .end("a")
            .end("b")
            .flow("start", "gw")
            .default_flow("gw", "a")
            .default_flow("gw", "b")
            .build()
            .unwrap();
        assert!(verify(&g).contains(&StructuralError::MultipleDefaults(key("gw"))));
    }

    #[test]
    fn condition_outside_gateway_is_flagged() {
        let g = ProcessBuilder::new()
            .start("start")
            .end("end")
            .flow_when("start", "end", Condition::flag("x"))
            .build()
            .unwrap();
        assert!(verify(&g).iter().any(|e| matches!(e, StructuralError::ConditionNotAllowed { .. })));
    }

    #[test]
    fn race_arms_must_be_distinct() {
        let g = ProcessBuilder::new()
            .start("start")
            .race(
                "race",
                vec![
                    (RaceTrigger::Timer { duration_ms: 5 }, "end"),
                    (
                        RaceTrigger::Message {
                            name: "m".into(),
                            correlation_key: None,
                        },
                        "end",
                    ),
                ],
            )
            .end("end")
            .flow("start", "race")
            .build()
            .unwrap();
        assert!(verify(&g).contains(&StructuralError::DuplicateRaceTarget {
            race: key("race"),
            target: key("end"),
        }));
    }

    #[test]
    fn boundary_on_timer_wait_is_rejected() {
        let g = ProcessBuilder::new()
            .start("start")
            .timer("wait", Duration::from_secs(1))
            .end("end")
            .end("late")
            .boundary_timer("b", "wait", Duration::from_secs(5), true)
            .flow("start", "wait")
            .flow("wait", "end")
            .flow("b", "late")
            .build()
            .unwrap();
        assert!(verify(&g).contains(&StructuralError::BoundaryHostInvalid {
            boundary: key("b"),
            host: key("wait"),
        }));
    }

    #[test]
    fn boundary_target_is_reachable_through_host() {
        let g = linear()
            .end("late")
            .boundary_timer("b", "t1", Duration::from_secs(5), true)
            .flow("b", "late")
            .build()
            .unwrap();
        assert!(verify(&g).is_empty());
    }

    #[test]
    fn duplicate_error_codes_are_flagged() {
        let g = linear()
            .end("e1")
            .end("e2")
            .error_flow("t1", "e1", "E")
            .error_flow("t1", "e2", "E")
            .build()
            .unwrap();
        assert!(verify(&g).contains(&StructuralError::DuplicateErrorCode {
            node: key("t1"),
            code: "E".into(),
        }));
    }

    #[test]
    fn verification_never_mutates_input() {
        let g = linear().build().unwrap();
        let before = format!("{g:?}");
        let _ = verify(&g);
        assert_eq!(before, format!("{g:?}"));
    }

    mod determinism {
        use super::*;
        use proptest::prelude::*;

        fn parts() -> (Vec<Node>, Vec<Edge>) {
            let g = ProcessBuilder::new()
                .start("start")
                .exclusive("gw")
                .service_task("a", "a")
                .service_task("b", "b")
                .end("end")
                .end("dangling")
                .flow("start", "gw")
                .flow_when("gw", "a", Condition::flag("x"))
                .flow_when("gw", "b", Condition::flag("y"))
                .flow("a", "end")
                .flow("b", "end")
                .build()
                .unwrap();
            (
                g.nodes().into_iter().cloned().collect(),
                g.edges().into_iter().cloned().collect(),
            )
        }

        proptest! {
            #[test]
            fn errors_do_not_depend_on_insertion_order(seed in any::<u64>()) {
                let (mut nodes, mut edges) = parts();
                let baseline = verify(&ProcessGraph::from_parts(nodes.clone(), edges.clone()).unwrap());

                // Deterministic rotation driven by the seed.
                let n = nodes.len();
                nodes.rotate_left((seed as usize) % n);
                let m = edges.len();
                edges.rotate_right((seed as usize / 7) % m);
                if seed % 2 == 0 {
                    nodes.reverse();
                }

                let shuffled = verify(&ProcessGraph::from_parts(nodes, edges).unwrap());
                prop_assert_eq!(baseline, shuffled);
            }
        }
    }
}
