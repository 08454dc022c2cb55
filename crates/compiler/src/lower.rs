//! Lowering of a verified graph to bytecode.
//!
//! Blocks are laid out in depth-first preorder from Start, following
//! boundary timers first and then flows in canonical order. A flow that
//! closes a cycle in that traversal is routed through a stub that bumps
//! the loop header's counter (and the fiber's loop epoch) before jumping.

use std::collections::{BTreeSet, HashMap};

use weft_bytecode::{
    ArmTrigger, Correlation, ErrorRoute, FaultReason, Instr, Program, REGISTER_COUNT, RaceArmInstr, SymbolKind,
};
use weft_core::Value;
use weft_ir::{
    Condition, Edge, GatewayDirection, Node, NodeKey, NodeKind, ProcessGraph, RaceArm, RaceTrigger, VerifiedGraph,
};

use crate::assembler::{Assembler, Label};
use crate::error::LoweringError;

/// Lower a verified graph into a program.
pub fn lower(verified: &VerifiedGraph) -> Result<Program, LoweringError> {
    let graph = verified.graph();
    let layout = Layout::compute(graph, verified.start());

    let mut lowerer = Lowerer {
        verified,
        graph,
        back_edges: layout.back_edges,
        stubs: Vec::new(),
        asm: Assembler::default(),
    };
    for key in &layout.order {
        lowerer.node_block(key)?;
    }
    for (n, header) in std::mem::take(&mut lowerer.stubs).into_iter().enumerate() {
        let counter = lowerer.asm.symbol(SymbolKind::Counter, header.as_str())?;
        lowerer.asm.place_stub(n);
        lowerer.asm.emit(Instr::IncCounter { counter });
        lowerer.asm.emit_with(Instr::Jump { target: 0 }, vec![Label::Node(header)]);
    }

    let program = lowerer.asm.finish()?;
    tracing::debug!(
        hash = %program.hash().short(),
        instructions = program.len(),
        nodes = layout.order.len(),
        "lowered process graph"
    );
    Ok(program)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnPath,
    Done,
}

/// Block order and the set of cycle-closing flows, keyed by source node and
/// index in its canonical outgoing list.
struct Layout<'g> {
    order: Vec<&'g NodeKey>,
    back_edges: BTreeSet<(NodeKey, usize)>,
}

impl<'g> Layout<'g> {
    fn compute(graph: &'g ProcessGraph, start: &NodeKey) -> Self {
        let mut layout = Self {
            order: Vec::with_capacity(graph.node_count()),
            back_edges: BTreeSet::new(),
        };
        let mut state = HashMap::new();
        if let Some(start) = graph.node(start) {
            layout.visit(graph, &start.id, &mut state);
        }
        layout
    }

    fn visit(&mut self, graph: &'g ProcessGraph, key: &'g NodeKey, state: &mut HashMap<&'g NodeKey, Visit>) {
        state.insert(key, Visit::OnPath);
        self.order.push(key);
        for boundary in graph.boundaries_of(key) {
            if !state.contains_key(&boundary.id) {
                self.visit(graph, &boundary.id, state);
            }
        }
        for (index, edge) in graph.outgoing(key).into_iter().enumerate() {
            match state.get(&edge.to) {
                None => self.visit(graph, &edge.to, state),
                Some(Visit::OnPath) => {
                    self.back_edges.insert((key.clone(), index));
                }
                Some(Visit::Done) => {}
            }
        }
        state.insert(key, Visit::Done);
    }
}

struct Lowerer<'g> {
    verified: &'g VerifiedGraph,
    graph: &'g ProcessGraph,
    back_edges: BTreeSet<(NodeKey, usize)>,
    /// Loop header of each stub, by stub number.
    stubs: Vec<NodeKey>,
    asm: Assembler,
}

impl<'g> Lowerer<'g> {
    fn node_block(&mut self, key: &NodeKey) -> Result<(), LoweringError> {
        let graph = self.graph;
        let Some(node) = graph.node(key) else {
            return Err(LoweringError::UnplacedLabel(key.clone()));
        };
        self.asm.place_node(key);

        match &node.kind {
            NodeKind::Start | NodeKind::BoundaryTimer { .. } => self.jump_on(node)?,
            NodeKind::End { terminate } => {
                self.asm.emit(if *terminate { Instr::EndTerminate } else { Instr::End });
            }
            NodeKind::ServiceTask { task_type, retries } => {
                let task_type = self.asm.symbol(SymbolKind::TaskType, task_type)?;
                let node_sym = self.asm.node(key);
                let mut error_routes = Vec::new();
                let mut labels = Vec::new();
                for (index, edge) in graph.outgoing(key).into_iter().enumerate() {
                    if let Some(code) = &edge.error_code {
                        error_routes.push(ErrorRoute {
                            code: code.clone(),
                            target: 0,
                        });
                        labels.push(self.edge_label(key, index, edge));
                    }
                }
                self.guarded(node, |this| {
                    this.asm.emit_with(
                        Instr::Dispatch {
                            task_type,
                            node: node_sym,
                            retries: *retries,
                            error_routes,
                        },
                        labels,
                    );
                    Ok(())
                })?;
                self.jump_on(node)?;
            }
            NodeKind::ExclusiveGateway => self.exclusive(node)?,
            NodeKind::ParallelGateway { direction, .. } => match direction {
                GatewayDirection::Diverging => {
                    let join = self.join_of(key)?;
                    let labels = self.all_labels(key);
                    let targets = vec![0; labels.len()];
                    self.asm.emit_with(Instr::Fork { join, targets }, labels);
                }
                GatewayDirection::Converging => self.join(node)?,
            },
            NodeKind::InclusiveGateway { direction, .. } => match direction {
                GatewayDirection::Diverging => self.inclusive(node)?,
                GatewayDirection::Converging => self.join(node)?,
            },
            NodeKind::TimerWait { duration_ms } => {
                self.asm.emit(Instr::WaitTimer { ms: *duration_ms });
                self.jump_on(node)?;
            }
            NodeKind::MessageWait { name, correlation_key } => {
                let message = self.asm.symbol(SymbolKind::Message, name)?;
                self.guarded(node, |this| {
                    let correlation = this.correlation(correlation_key.as_deref(), 0)?;
                    this.asm.emit(Instr::WaitMessage { message, correlation });
                    Ok(())
                })?;
                self.jump_on(node)?;
            }
            NodeKind::HumanWait { task } => {
                let task = self.asm.symbol(SymbolKind::HumanTask, task)?;
                self.guarded(node, |this| {
                    this.asm.emit(Instr::WaitHuman { task });
                    Ok(())
                })?;
                self.jump_on(node)?;
            }
            NodeKind::RaceWait { arms } => self.race(node, arms)?,
        }
        Ok(())
    }

    /// Jump along the node's single non-error flow.
    fn jump_on(&mut self, node: &Node) -> Result<(), LoweringError> {
        let graph = self.graph;
        let (index, edge) = graph
            .outgoing(&node.id)
            .into_iter()
            .enumerate()
            .find(|(_, e)| !e.is_error_route())
            .ok_or_else(|| LoweringError::MissingFlow(node.id.clone()))?;
        let label = self.edge_label(&node.id, index, edge);
        self.asm.emit_with(Instr::Jump { target: 0 }, vec![label]);
        Ok(())
    }

    /// Wrap the host's wait in `Watch`/`Unwatch` when it has a boundary timer.
    fn guarded(
        &mut self,
        host: &Node,
        body: impl FnOnce(&mut Self) -> Result<(), LoweringError>,
    ) -> Result<(), LoweringError> {
        let graph = self.graph;
        let boundary = graph.boundaries_of(&host.id).into_iter().next();
        let Some(boundary) = boundary else {
            return body(self);
        };
        let NodeKind::BoundaryTimer {
            duration_ms,
            interrupting,
            ..
        } = &boundary.kind
        else {
            return body(self);
        };
        let sym = self.asm.node(&boundary.id);
        self.asm.emit_with(
            Instr::Watch {
                boundary: sym,
                ms: *duration_ms,
                interrupting: *interrupting,
                target: 0,
            },
            vec![Label::Node(boundary.id.clone())],
        );
        body(self)?;
        self.asm.emit(Instr::Unwatch { boundary: sym });
        Ok(())
    }

    fn exclusive(&mut self, node: &Node) -> Result<(), LoweringError> {
        let graph = self.graph;
        let mut default = None;
        for (index, edge) in graph.outgoing(&node.id).into_iter().enumerate() {
            if edge.is_default {
                default = Some(self.edge_label(&node.id, index, edge));
                continue;
            }
            let label = self.edge_label(&node.id, index, edge);
            match &edge.condition {
                Some(condition) => {
                    self.condition(condition)?;
                    self.asm.emit_with(Instr::BrIf { target: 0 }, vec![label]);
                }
                None => self.asm.emit_with(Instr::Jump { target: 0 }, vec![label]),
            }
        }
        match default {
            Some(label) => self.asm.emit_with(Instr::Jump { target: 0 }, vec![label]),
            None => {
                let gateway = self.asm.node(&node.id);
                self.asm.emit(Instr::Fault {
                    reason: FaultReason::NoRoute { gateway },
                });
            }
        }
        Ok(())
    }

    fn inclusive(&mut self, node: &Node) -> Result<(), LoweringError> {
        let graph = self.graph;
        let join = self.join_of(&node.id)?;
        let gateway = self.asm.node(&node.id);
        let mut labels = Vec::new();
        let mut default = None;
        for (index, edge) in graph.outgoing(&node.id).into_iter().enumerate() {
            let label = self.edge_label(&node.id, index, edge);
            if edge.is_default {
                default = Some(label);
                continue;
            }
            match &edge.condition {
                Some(condition) => self.condition(condition)?,
                None => self.asm.emit(Instr::Push { value: Value::Bool(true) }),
            }
            labels.push(label);
        }
        let targets = vec![0; labels.len()];
        let default_slot = default.as_ref().map(|_| 0);
        labels.extend(default);
        self.asm.emit_with(
            Instr::ForkInclusive {
                join,
                targets,
                default: default_slot,
                gateway,
            },
            labels,
        );
        Ok(())
    }

    fn join(&mut self, node: &Node) -> Result<(), LoweringError> {
        let join = self.asm.node(&node.id);
        self.asm.emit(Instr::Join { join });
        self.jump_on(node)
    }

    fn race(&mut self, node: &Node, arms: &[RaceArm]) -> Result<(), LoweringError> {
        let graph = self.graph;
        let outgoing = graph.outgoing(&node.id);
        let mut sorted: Vec<_> = arms.iter().collect();
        sorted.sort_by(|a, b| a.target.cmp(&b.target));

        let mut instr_arms = Vec::with_capacity(sorted.len());
        let mut labels = Vec::with_capacity(sorted.len());
        let mut next_reg = 0_usize;
        for arm in sorted {
            let (index, edge) = outgoing
                .iter()
                .enumerate()
                .find(|(_, e)| e.to == arm.target)
                .ok_or_else(|| LoweringError::MissingFlow(node.id.clone()))?;
            labels.push(self.edge_label(&node.id, index, edge));
            let trigger = match &arm.trigger {
                RaceTrigger::Timer { duration_ms } => ArmTrigger::Timer { ms: *duration_ms },
                RaceTrigger::Message { name, correlation_key } => {
                    let message = self.asm.symbol(SymbolKind::Message, name)?;
                    let correlation = match correlation_key {
                        Some(_) => {
                            if next_reg >= REGISTER_COUNT {
                                return Err(LoweringError::TooManyArms {
                                    race: node.id.clone(),
                                    needed: next_reg + 1,
                                    available: REGISTER_COUNT,
                                });
                            }
                            let reg = next_reg as u8;
                            next_reg += 1;
                            self.correlation(correlation_key.as_deref(), reg)?
                        }
                        None => Correlation::Instance,
                    };
                    ArmTrigger::Message { message, correlation }
                }
            };
            instr_arms.push(RaceArmInstr { trigger, target: 0 });
        }
        let race = self.asm.node(&node.id);
        self.asm.emit_with(Instr::Race { race, arms: instr_arms }, labels);
        Ok(())
    }

    /// Emit the loads that put a correlation value in `reg`, if keyed.
    fn correlation(&mut self, key: Option<&str>, reg: u8) -> Result<Correlation, LoweringError> {
        let Some(flag) = key else {
            return Ok(Correlation::Instance);
        };
        let flag = self.asm.symbol(SymbolKind::Flag, flag)?;
        self.asm.emit(Instr::LoadFlag { flag });
        self.asm.emit(Instr::StoreReg { reg });
        Ok(Correlation::Register { reg })
    }

    fn condition(&mut self, condition: &Condition) -> Result<(), LoweringError> {
        match condition {
            Condition::Flag { flag } => {
                let flag = self.asm.symbol(SymbolKind::Flag, flag)?;
                self.asm.emit(Instr::LoadFlag { flag });
            }
            Condition::Equals { flag, value } => {
                let flag = self.asm.symbol(SymbolKind::Flag, flag)?;
                self.asm.emit(Instr::LoadFlag { flag });
                self.asm.emit(Instr::Push { value: value.clone() });
                self.asm.emit(Instr::Eq);
            }
            Condition::CounterBelow { counter, limit } => {
                let counter = self.asm.symbol(SymbolKind::Counter, counter)?;
                self.asm.emit(Instr::LoadCounter { counter });
                self.asm.emit(Instr::Push { value: Value::Int(*limit) });
                self.asm.emit(Instr::Lt);
            }
            Condition::Not { condition } => {
                self.condition(condition)?;
                self.asm.emit(Instr::Not);
            }
            Condition::All { conditions } => self.fold(conditions, true, Instr::And)?,
            Condition::Any { conditions } => self.fold(conditions, false, Instr::Or)?,
        }
        Ok(())
    }

    fn fold(&mut self, conditions: &[Condition], empty: bool, op: Instr) -> Result<(), LoweringError> {
        let Some((first, rest)) = conditions.split_first() else {
            self.asm.emit(Instr::Push { value: Value::Bool(empty) });
            return Ok(());
        };
        self.condition(first)?;
        for c in rest {
            self.condition(c)?;
            self.asm.emit(op.clone());
        }
        Ok(())
    }

    fn all_labels(&mut self, key: &NodeKey) -> Vec<Label> {
        let graph = self.graph;
        let outgoing = graph.outgoing(key);
        outgoing
            .into_iter()
            .enumerate()
            .map(|(index, edge)| self.edge_label(key, index, edge))
            .collect()
    }

    fn join_of(&mut self, split: &NodeKey) -> Result<u32, LoweringError> {
        let pair = self
            .verified
            .pair(split)
            .ok_or_else(|| LoweringError::UnpairedGateway(split.clone()))?;
        let join = pair.join.clone();
        Ok(self.asm.node(&join))
    }

    fn edge_label(&mut self, from: &NodeKey, index: usize, edge: &Edge) -> Label {
        if self.back_edges.contains(&(from.clone(), index)) {
            self.stubs.push(edge.to.clone());
            Label::Stub(self.stubs.len() - 1)
        } else {
            Label::Node(edge.to.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use weft_ir::ProcessBuilder;

    fn lowered(builder: ProcessBuilder) -> Program {
        let graph = builder.build().unwrap();
        lower(&VerifiedGraph::new(graph).unwrap()).unwrap()
    }

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s).unwrap()
    }

    #[test]
    fn linear_process_lowers_in_preorder() {
        let program = lowered(
            ProcessBuilder::new()
                .start("start")
                .service_task("t1", "work")
                .end("end")
                .flow("start", "t1")
                .flow("t1", "end"),
        );
        assert_eq!(program.address_of(&key("start")), Some(0));
        assert_eq!(program.address_of(&key("t1")), Some(1));
        assert_eq!(program.address_of(&key("end")), Some(3));
        assert!(matches!(program.get(1), Some(Instr::Dispatch { retries: 0, .. })));
        assert_eq!(program.get(2), Some(&Instr::Jump { target: 3 }));
        assert_eq!(program.get(3), Some(&Instr::End));
    }

    #[test]
    fn exclusive_without_default_ends_in_fault() {
        let program = lowered(
            ProcessBuilder::new()
                .start("start")
                .exclusive("gw")
                .end("a")
                .end("b")
                .flow("start", "gw")
                .flow_when("gw", "a", Condition::flag("x"))
                .flow_when("gw", "b", Condition::flag("x").negate()),
        );
        let gw = program.address_of(&key("gw")).unwrap() as usize;
        let block = &program.instructions()[gw..];
        assert!(matches!(block[0], Instr::LoadFlag { .. }));
        assert!(matches!(block[1], Instr::BrIf { .. }));
        assert!(matches!(block[2], Instr::LoadFlag { .. }));
        assert_eq!(block[3], Instr::Not);
        assert!(matches!(block[4], Instr::BrIf { .. }));
        assert!(matches!(block[5], Instr::Fault { .. }));
    }

    #[test]
    fn parallel_split_forks_to_paired_join() {
        let program = lowered(
            ProcessBuilder::new()
                .start("start")
                .parallel_split("fork")
                .parallel_join("join")
                .service_task("a", "a")
                .service_task("b", "b")
                .end("end")
                .flow("start", "fork")
                .flow("fork", "a")
                .flow("fork", "b")
                .flow("a", "join")
                .flow("b", "join")
                .flow("join", "end"),
        );
        let fork = program.address_of(&key("fork")).unwrap();
        let Some(Instr::Fork { join, targets }) = program.get(fork) else {
            panic!("expected fork");
        };
        assert_eq!(program.symbols().node(*join).unwrap(), &key("join"));
        assert_eq!(
            targets,
            &vec![
                program.address_of(&key("a")).unwrap(),
                program.address_of(&key("b")).unwrap()
            ]
        );
        let join_addr = program.address_of(&key("join")).unwrap();
        assert!(matches!(program.get(join_addr), Some(Instr::Join { .. })));
    }

    #[test]
    fn inclusive_split_pushes_one_condition_per_branch() {
        let program = lowered(
            ProcessBuilder::new()
                .start("start")
                .inclusive_split("or")
                .inclusive_join("merge")
                .end("end")
                .service_task("a", "a")
                .service_task("b", "b")
                .service_task("c", "c")
                .flow("start", "or")
                .flow_when("or", "a", Condition::flag("fa"))
                .flow_when("or", "b", Condition::flag("fb"))
                .default_flow("or", "c")
                .flow("a", "merge")
                .flow("b", "merge")
                .flow("c", "merge")
                .flow("merge", "end"),
        );
        let or = program.address_of(&key("or")).unwrap();
        let fork = program
            .instructions()
            .iter()
            .skip(or as usize)
            .find(|i| matches!(i, Instr::ForkInclusive { .. }))
            .unwrap();
        let Instr::ForkInclusive { targets, default, .. } = fork else {
            unreachable!()
        };
        assert_eq!(targets.len(), 2);
        assert_eq!(*default, program.address_of(&key("c")));
    }

    #[test]
    fn back_edge_goes_through_counter_stub() {
        let program = lowered(
            ProcessBuilder::new()
                .start("start")
                .service_task("work", "w")
                .exclusive("again")
                .end("end")
                .flow("start", "work")
                .flow("work", "again")
                .flow_when("again", "work", Condition::counter_below("work", 3))
                .default_flow("again", "end"),
        );
        let stub_at = program
            .instructions()
            .iter()
            .position(|i| matches!(i, Instr::IncCounter { .. }))
            .unwrap();
        assert_eq!(
            program.get(stub_at as u32 + 1),
            Some(&Instr::Jump {
                target: program.address_of(&key("work")).unwrap()
            })
        );
        assert_eq!(program.symbols().counters, vec!["work".to_owned()]);
    }

    #[test]
    fn boundary_wraps_host_in_watch() {
        let program = lowered(
            ProcessBuilder::new()
                .start("start")
                .service_task("t1", "slow")
                .boundary_timer("deadline", "t1", std::time::Duration::from_secs(30), true)
                .end("end")
                .end("late")
                .flow("start", "t1")
                .flow("t1", "end")
                .flow("deadline", "late"),
        );
        let t1 = program.address_of(&key("t1")).unwrap();
        let deadline = program.address_of(&key("deadline")).unwrap();
        assert_eq!(
            program.get(t1),
            Some(&Instr::Watch {
                boundary: 1,
                ms: 30_000,
                interrupting: true,
                target: deadline,
            })
        );
        assert!(matches!(program.get(t1 + 1), Some(Instr::Dispatch { .. })));
        assert!(matches!(program.get(t1 + 2), Some(Instr::Unwatch { .. })));
    }

    #[test]
    fn keyed_message_loads_correlation_register() {
        let program = lowered(
            ProcessBuilder::new()
                .start("start")
                .message("wait", "paid", Some("order"))
                .end("end")
                .flow("start", "wait")
                .flow("wait", "end"),
        );
        let at = program.address_of(&key("wait")).unwrap();
        assert!(matches!(program.get(at), Some(Instr::LoadFlag { .. })));
        assert_eq!(program.get(at + 1), Some(&Instr::StoreReg { reg: 0 }));
        assert!(matches!(
            program.get(at + 2),
            Some(Instr::WaitMessage {
                correlation: Correlation::Register { reg: 0 },
                ..
            })
        ));
    }
}
