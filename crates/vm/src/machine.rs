//! The interpreter loop, wake-signal delivery and job resumption.

use std::time::Duration;

use weft_bytecode::{
    Addr, ArmTrigger, Correlation, ErrorRoute, FaultReason, Instr, Program, RaceArmInstr,
    SymbolKind,
};
use weft_core::clock::after;
use weft_core::{FiberId, NodeKey, Value};
use weft_execution::transition::validate_instance_transition;
use weft_execution::{
    ArmWait, ArmWaitTrigger, Arrival, ErrorClass, Fiber, Incident, InstanceStatus, Job,
    JobCompletion, JobKey, JobStatus, JoinTicket, RuntimeEvent, WaitState, WakeKind, WakeSignal,
    Watch,
};

use crate::batch::Batch;
use crate::error::VmError;

/// Instruction budget of one [`Vm::run`] call.
pub const DEFAULT_MAX_STEPS: usize = 10_000;

/// Outcome of [`Vm::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Instructions executed.
    pub steps: usize,
    /// The budget ran out while fibers were still ready.
    pub exhausted: bool,
}

/// Outcome of delivering a wake signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The fiber was woken.
    Woken,
    /// The signal was stale or did not match; nothing changed but the log.
    Discarded {
        /// Why.
        reason: String,
    },
}

impl Delivery {
    /// Whether the signal woke the fiber.
    #[must_use]
    pub fn is_woken(&self) -> bool {
        matches!(self, Self::Woken)
    }
}

enum Flow {
    Continue,
    Yield,
}

enum Resume {
    At(Addr),
    Race { race: NodeKey, winner: Addr, losers: Vec<Addr> },
    Boundary(Watch),
}

/// A fiber interpreter bound to one program.
#[derive(Debug, Clone, Copy)]
pub struct Vm<'p> {
    program: &'p Program,
    max_steps: usize,
}

impl<'p> Vm<'p> {
    /// A machine with the default step budget.
    #[must_use]
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Override the step budget.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// The loaded program.
    #[must_use]
    pub fn program(&self) -> &'p Program {
        self.program
    }

    /// Spawn the root fiber of a new instance.
    pub fn start(&self, batch: &mut Batch) -> FiberId {
        batch.spawn(0, None)
    }

    /// Run ready fibers, lowest spawn sequence first, until none is ready,
    /// the instance ends, or the step budget is spent.
    pub fn run(&self, batch: &mut Batch) -> Result<RunReport, VmError> {
        if batch.instance().program != *self.program.hash() {
            return Err(VmError::ProgramMismatch {
                expected: batch.instance().program.clone(),
                found: self.program.hash().clone(),
            });
        }

        let mut steps = 0;
        while batch.instance().is_running() {
            let Some(id) = batch.state().ready_fibers().first().copied() else {
                break;
            };
            loop {
                if steps >= self.max_steps {
                    tracing::debug!(instance = %batch.instance().id, steps, "step budget spent");
                    return Ok(RunReport {
                        steps,
                        exhausted: true,
                    });
                }
                steps += 1;
                match self.step(batch, id) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Yield) => break,
                    Err(err) => {
                        let pc = batch.fiber(id).map_or(0, |f| f.pc);
                        self.raise(batch, id, pc, ErrorClass::VmFault, err.to_string());
                        break;
                    }
                }
            }
        }
        Ok(RunReport {
            steps,
            exhausted: false,
        })
    }

    fn step(&self, batch: &mut Batch, id: FiberId) -> Result<Flow, VmError> {
        let fiber = batch.fiber(id).ok_or(VmError::MissingFiber(id))?;
        let pc = fiber.pc;
        let instr = self.program.get(pc).ok_or(VmError::PcOutOfRange { pc })?;
        let next = pc + 1;
        tracing::trace!(fiber = %id, pc, op = instr.mnemonic(), "step");

        match instr {
            Instr::Push { value } => {
                let f = frame(batch, id)?;
                f.stack.push(value.clone());
                f.pc = next;
            }
            Instr::Pop => {
                let f = frame(batch, id)?;
                pop(f, pc)?;
                f.pc = next;
            }
            Instr::LoadFlag { flag } => {
                let value = batch.instance().flag(self.symbol(SymbolKind::Flag, *flag)?);
                let f = frame(batch, id)?;
                f.stack.push(value);
                f.pc = next;
            }
            Instr::StoreFlag { flag } => {
                let name = self.symbol(SymbolKind::Flag, *flag)?.to_owned();
                let f = frame(batch, id)?;
                let value = pop(f, pc)?;
                f.pc = next;
                batch.instance_mut().flags.insert(name, value);
            }
            Instr::LoadReg { reg } => {
                let f = frame(batch, id)?;
                let value = f
                    .registers
                    .get(usize::from(*reg))
                    .cloned()
                    .ok_or(VmError::BadRegister { pc, reg: *reg })?;
                f.stack.push(value);
                f.pc = next;
            }
            Instr::StoreReg { reg } => {
                let f = frame(batch, id)?;
                let value = pop(f, pc)?;
                let slot = f
                    .registers
                    .get_mut(usize::from(*reg))
                    .ok_or(VmError::BadRegister { pc, reg: *reg })?;
                *slot = value;
                f.pc = next;
            }
            Instr::LoadCounter { counter } => {
                let value = batch.instance().counter(self.symbol(SymbolKind::Counter, *counter)?);
                let f = frame(batch, id)?;
                f.stack.push(Value::Int(value));
                f.pc = next;
            }
            Instr::IncCounter { counter } => {
                let name = self.symbol(SymbolKind::Counter, *counter)?.to_owned();
                let f = frame(batch, id)?;
                f.loop_epoch += 1;
                f.pc = next;
                let slot = batch.instance_mut().counters.entry(name.clone()).or_insert(0);
                *slot += 1;
                let value = *slot;
                batch.emit(RuntimeEvent::CounterIncremented { counter: name, value });
            }
            Instr::Eq => {
                let f = frame(batch, id)?;
                let b = pop(f, pc)?;
                let a = pop(f, pc)?;
                f.stack.push(Value::Bool(a == b));
                f.pc = next;
            }
            Instr::Lt => {
                let f = frame(batch, id)?;
                let b = int(pop(f, pc)?, pc)?;
                let a = int(pop(f, pc)?, pc)?;
                f.stack.push(Value::Bool(a < b));
                f.pc = next;
            }
            Instr::Not => {
                let f = frame(batch, id)?;
                let a = pop(f, pc)?;
                f.stack.push(Value::Bool(!a.is_truthy()));
                f.pc = next;
            }
            Instr::And | Instr::Or => {
                let f = frame(batch, id)?;
                let b = pop(f, pc)?.is_truthy();
                let a = pop(f, pc)?.is_truthy();
                let result = if matches!(instr, Instr::And) { a && b } else { a || b };
                f.stack.push(Value::Bool(result));
                f.pc = next;
            }
            Instr::Jump { target } => frame(batch, id)?.pc = *target,
            Instr::BrIf { target } | Instr::BrIfNot { target } => {
                let f = frame(batch, id)?;
                let truthy = pop(f, pc)?.is_truthy();
                let taken = truthy == matches!(instr, Instr::BrIf { .. });
                f.pc = if taken { *target } else { next };
            }
            Instr::Dispatch {
                task_type,
                node,
                retries,
                ..
            } => {
                self.dispatch(batch, id, pc, *task_type, *node, *retries)?;
                return Ok(Flow::Yield);
            }
            Instr::WaitTimer { ms } => {
                let due_at = after(batch.now(), Duration::from_millis(*ms));
                batch.park(id, pc, WaitState::Timer { due_at });
                return Ok(Flow::Yield);
            }
            Instr::WaitMessage {
                message,
                correlation,
            } => {
                let name = self.symbol(SymbolKind::Message, *message)?.to_owned();
                let correlation = correlation_value(batch, id, pc, correlation)?;
                batch.park(id, pc, WaitState::Message { name, correlation });
                return Ok(Flow::Yield);
            }
            Instr::WaitHuman { task } => {
                let task = self.symbol(SymbolKind::HumanTask, *task)?.to_owned();
                batch.park(id, pc, WaitState::Human { task });
                return Ok(Flow::Yield);
            }
            Instr::Race { race, arms } => {
                self.race(batch, id, pc, *race, arms)?;
                return Ok(Flow::Yield);
            }
            Instr::Watch {
                boundary,
                ms,
                interrupting,
                target,
            } => {
                let boundary = self.node(*boundary)?.clone();
                let due_at = after(batch.now(), Duration::from_millis(*ms));
                let watchdog = batch.spawn(pc, Some(id));
                if let Some(w) = batch.fiber_mut(watchdog) {
                    w.wait = WaitState::Timer { due_at };
                    w.watch = Some(Watch {
                        host: id,
                        boundary,
                        interrupting: *interrupting,
                        target: *target,
                    });
                }
                let f = frame(batch, id)?;
                f.watchdog = Some(watchdog);
                f.pc = next;
            }
            Instr::Unwatch { .. } => {
                let f = frame(batch, id)?;
                f.pc = next;
                if let Some(watchdog) = f.watchdog.take() {
                    batch.end_fiber(watchdog);
                }
            }
            Instr::Fork { join, targets } => {
                if targets.is_empty() {
                    return Err(VmError::EmptyFork { pc });
                }
                let join = self.node(*join)?.clone();
                self.fork(batch, id, &join, targets)?;
                return Ok(Flow::Yield);
            }
            Instr::ForkInclusive {
                join,
                targets,
                default,
                gateway,
            } => {
                let f = frame(batch, id)?;
                let mut picked = vec![false; targets.len()];
                for slot in picked.iter_mut().rev() {
                    *slot = pop(f, pc)?.is_truthy();
                }
                let mut selected: Vec<Addr> = targets
                    .iter()
                    .zip(&picked)
                    .filter(|(_, on)| **on)
                    .map(|(t, _)| *t)
                    .collect();
                if selected.is_empty() {
                    match default {
                        Some(target) => selected.push(*target),
                        None => {
                            let message = self.fault_message(&FaultReason::NoBranch {
                                gateway: *gateway,
                            });
                            self.raise(batch, id, pc, ErrorClass::NoRoute, message);
                            return Ok(Flow::Yield);
                        }
                    }
                }
                let join = self.node(*join)?.clone();
                self.fork(batch, id, &join, &selected)?;
                return Ok(Flow::Yield);
            }
            Instr::Join { join } => {
                let join = self.node(*join)?.clone();
                return self.join(batch, id, next, &join);
            }
            Instr::End => {
                self.retire(batch, id);
                self.complete_if_idle(batch)?;
                return Ok(Flow::Yield);
            }
            Instr::EndTerminate => {
                let node = self.program.symbols().node_containing(pc).cloned();
                tracing::info!(instance = %batch.instance().id, ?node, "instance terminated");
                self.close(
                    batch,
                    InstanceStatus::Terminated,
                    RuntimeEvent::InstanceTerminated { node },
                )?;
                return Ok(Flow::Yield);
            }
            Instr::Fault { reason } => {
                let message = self.fault_message(reason);
                self.raise(batch, id, pc, ErrorClass::NoRoute, message);
                return Ok(Flow::Yield);
            }
        }
        Ok(Flow::Continue)
    }

    fn symbol(&self, kind: SymbolKind, index: u32) -> Result<&'p str, VmError> {
        Ok(self.program.symbols().resolve(kind, index)?)
    }

    fn node(&self, index: u32) -> Result<&'p NodeKey, VmError> {
        Ok(self.program.symbols().node(index)?)
    }

    fn fault_message(&self, reason: &FaultReason) -> String {
        let name = |index: u32| {
            self.program
                .symbols()
                .node(index)
                .map_or_else(|_| format!("#{index}"), ToString::to_string)
        };
        match reason {
            FaultReason::NoRoute { gateway } => {
                format!("exclusive gateway {} has no true condition and no default", name(*gateway))
            }
            FaultReason::NoBranch { gateway } => {
                format!("inclusive gateway {} selected no branch and has no default", name(*gateway))
            }
        }
    }

    fn dispatch(
        &self,
        batch: &mut Batch,
        id: FiberId,
        pc: Addr,
        task_type: u32,
        node: u32,
        retries: u32,
    ) -> Result<(), VmError> {
        let task_type = self.symbol(SymbolKind::TaskType, task_type)?.to_owned();
        let node = self.node(node)?.clone();
        let (seq, epoch) = {
            let f = frame(batch, id)?;
            (f.seq, f.loop_epoch)
        };
        let instance = batch.instance();
        let input = (&instance.payload, &instance.flags);
        let key = JobKey::generate(instance.id, &node, seq, epoch, &input)?;
        let job = Job {
            key: key.clone(),
            instance: instance.id,
            fiber: id,
            epoch,
            node,
            task_type,
            payload: instance.payload.clone(),
            flags: instance.flags.clone(),
            attempt: 1,
            retries_remaining: retries,
            max_retries: retries,
            status: JobStatus::Pending,
            not_before: batch.now(),
            claimed_at: None,
            claimed_by: None,
            last_error: None,
            created_at: batch.now(),
        };
        tracing::debug!(fiber = %id, job_key = %key, task_type = %job.task_type, "job dispatched");
        batch.dispatch(job);
        batch.park(id, pc, WaitState::Job { job_key: key });
        Ok(())
    }

    fn race(
        &self,
        batch: &mut Batch,
        id: FiberId,
        pc: Addr,
        race: u32,
        arms: &[RaceArmInstr],
    ) -> Result<(), VmError> {
        let race = self.node(race)?.clone();
        let mut waits = Vec::with_capacity(arms.len());
        for arm in arms {
            let trigger = match &arm.trigger {
                ArmTrigger::Timer { ms } => ArmWaitTrigger::Timer {
                    due_at: after(batch.now(), Duration::from_millis(*ms)),
                },
                ArmTrigger::Message {
                    message,
                    correlation,
                } => ArmWaitTrigger::Message {
                    name: self.symbol(SymbolKind::Message, *message)?.to_owned(),
                    correlation: correlation_value(batch, id, pc, correlation)?,
                },
            };
            waits.push(ArmWait {
                trigger,
                target: arm.target,
            });
        }
        batch.park(id, pc, WaitState::Race { race, arms: waits });
        Ok(())
    }

    fn fork(
        &self,
        batch: &mut Batch,
        id: FiberId,
        join: &NodeKey,
        targets: &[Addr],
    ) -> Result<(), VmError> {
        let parent = batch.fiber(id).cloned().ok_or(VmError::MissingFiber(id))?;
        let expected = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        let activation = batch.activate_join(join, expected);
        let ticket = JoinTicket {
            join: join.clone(),
            activation,
        };
        for target in targets {
            let child = batch.spawn(*target, Some(id));
            if let Some(c) = batch.fiber_mut(child) {
                c.tickets = parent.tickets.clone();
                c.tickets.push(ticket.clone());
                c.loop_epoch = parent.loop_epoch;
            }
        }
        batch.end_fiber(id);
        Ok(())
    }

    fn join(
        &self,
        batch: &mut Batch,
        id: FiberId,
        next: Addr,
        join: &NodeKey,
    ) -> Result<Flow, VmError> {
        let f = batch.fiber(id).ok_or(VmError::MissingFiber(id))?;
        let Some(pos) = f.tickets.iter().rposition(|t| t.join == *join) else {
            tracing::warn!(fiber = %id, %join, "arrival without a ticket");
            self.retire(batch, id);
            self.complete_if_idle(batch)?;
            return Ok(Flow::Yield);
        };
        let ticket = f.tickets[pos].clone();
        match batch.arrive(&ticket)? {
            Arrival::Satisfied { .. } => {
                let f = frame(batch, id)?;
                f.tickets.remove(pos);
                f.pc = next;
                Ok(Flow::Continue)
            }
            Arrival::Waiting { .. } => {
                self.retire(batch, id);
                Ok(Flow::Yield)
            }
            Arrival::Stale => {
                tracing::warn!(fiber = %id, %join, "stale join ticket");
                self.retire(batch, id);
                self.complete_if_idle(batch)?;
                Ok(Flow::Yield)
            }
        }
    }

    /// End a fiber together with its watchdog.
    fn retire(&self, batch: &mut Batch, id: FiberId) {
        if let Some(fiber) = batch.end_fiber(id)
            && let Some(watchdog) = fiber.watchdog
        {
            batch.end_fiber(watchdog);
        }
    }

    fn complete_if_idle(&self, batch: &mut Batch) -> Result<(), VmError> {
        if !batch.instance().is_running() || !batch.state().fibers.is_empty() {
            return Ok(());
        }
        let now = batch.now();
        let instance = batch.instance_mut();
        validate_instance_transition(instance.status, InstanceStatus::Completed)?;
        instance.status = InstanceStatus::Completed;
        instance.ended_at = Some(now);
        tracing::info!(instance = %batch.instance().id, "instance completed");
        batch.emit(RuntimeEvent::InstanceCompleted);
        Ok(())
    }

    /// End every fiber, cancel their open jobs and close the instance.
    fn close(
        &self,
        batch: &mut Batch,
        status: InstanceStatus,
        event: RuntimeEvent,
    ) -> Result<(), VmError> {
        validate_instance_transition(batch.instance().status, status)?;
        let ids: Vec<FiberId> = batch.state().fibers_by_seq().iter().map(|f| f.id).collect();
        for id in ids {
            if let Some(Fiber {
                wait: WaitState::Job { job_key },
                ..
            }) = batch.fiber(id)
            {
                let key = job_key.clone();
                batch.cancel_job(key);
            }
            batch.end_fiber(id);
        }
        let now = batch.now();
        let instance = batch.instance_mut();
        instance.status = status;
        instance.ended_at = Some(now);
        batch.emit(event);
        Ok(())
    }

    /// Cancel a running instance.
    pub fn cancel(&self, batch: &mut Batch, reason: impl Into<String>) -> Result<(), VmError> {
        let reason = reason.into();
        tracing::info!(instance = %batch.instance().id, %reason, "instance cancelled");
        self.close(
            batch,
            InstanceStatus::Cancelled,
            RuntimeEvent::InstanceCancelled { reason },
        )
    }

    fn raise(&self, batch: &mut Batch, id: FiberId, pc: Addr, class: ErrorClass, message: String) {
        let node = self.program.symbols().node_containing(pc).cloned();
        let incident = Incident::raise(batch.instance().id, id, pc, class, message, batch.now())
            .with_node(node);
        self.halt(batch, incident);
    }

    /// Park the incident's fiber on it and record it.
    pub fn halt(&self, batch: &mut Batch, incident: Incident) {
        tracing::warn!(
            instance = %incident.instance,
            fiber = %incident.fiber,
            incident = %incident.id,
            class = %incident.class,
            message = %incident.message,
            "incident raised"
        );
        batch.emit(RuntimeEvent::IncidentRaised {
            incident: incident.id,
            class: incident.class.clone(),
        });
        batch.park(
            incident.fiber,
            incident.addr,
            WaitState::Incident {
                incident: incident.id,
            },
        );
        batch.put_incident(incident);
    }

    /// Wake the fiber halted on a resolved job-less incident, restarting the
    /// block of the node that faulted.
    pub fn restart(&self, batch: &mut Batch, incident: &Incident) -> bool {
        let Some(fiber) = batch.fiber(incident.fiber) else {
            return false;
        };
        if fiber.wait
            != (WaitState::Incident {
                incident: incident.id,
            })
        {
            return false;
        }
        let pc = incident
            .node
            .as_ref()
            .and_then(|node| self.program.address_of(node))
            .unwrap_or(incident.addr);
        batch.wake(incident.fiber, pc);
        true
    }

    /// Resume a fiber whose job completed.
    pub fn resume_job(
        &self,
        batch: &mut Batch,
        id: FiberId,
        completion: &JobCompletion,
    ) -> Result<(), VmError> {
        let pc = frame(batch, id)?.pc;
        apply_inputs(batch, &completion.flags, completion.payload.as_ref())?;
        batch.wake(id, pc + 1);
        Ok(())
    }

    /// The error route a business error code takes at the fiber's dispatch.
    #[must_use]
    pub fn error_route(&self, fiber: &Fiber, code: &str) -> Option<Addr> {
        match self.program.get(fiber.pc) {
            Some(Instr::Dispatch { error_routes, .. }) => error_routes
                .iter()
                .find(|r: &&ErrorRoute| r.code == code)
                .map(|r| r.target),
            _ => None,
        }
    }

    /// Move a fiber to an error route, dropping its watchdog.
    pub fn route_error(&self, batch: &mut Batch, id: FiberId, target: Addr) -> Result<(), VmError> {
        let f = frame(batch, id)?;
        let watchdog = f.watchdog.take();
        if let Some(watchdog) = watchdog {
            batch.end_fiber(watchdog);
        }
        batch.wake(id, target);
        Ok(())
    }

    /// Deliver a wake signal.
    pub fn deliver(&self, batch: &mut Batch, signal: &WakeSignal) -> Result<Delivery, VmError> {
        let resume = match self.match_signal(batch, signal) {
            Ok(resume) => resume,
            Err(reason) => {
                tracing::debug!(
                    instance = %signal.instance,
                    fiber = %signal.fiber,
                    epoch = signal.epoch,
                    %reason,
                    "signal discarded"
                );
                batch.emit(RuntimeEvent::SignalDiscarded {
                    fiber: signal.fiber,
                    reason: reason.clone(),
                });
                return Ok(Delivery::Discarded { reason });
            }
        };

        apply_inputs(batch, &signal.flags, signal.payload.as_ref())?;
        match resume {
            Resume::At(pc) => batch.wake(signal.fiber, pc),
            Resume::Race {
                race,
                winner,
                losers,
            } => {
                batch.emit(RuntimeEvent::RaceWon {
                    race: race.clone(),
                    target: winner,
                });
                for target in losers {
                    batch.emit(RuntimeEvent::RaceArmCancelled {
                        race: race.clone(),
                        target,
                    });
                }
                batch.wake(signal.fiber, winner);
            }
            Resume::Boundary(watch) => self.fire_boundary(batch, signal.fiber, watch),
        }
        Ok(Delivery::Woken)
    }

    fn match_signal(&self, batch: &Batch, signal: &WakeSignal) -> Result<Resume, String> {
        if !batch.instance().is_running() {
            return Err(format!("instance is {}", batch.instance().status));
        }
        let Some(fiber) = batch.fiber(signal.fiber) else {
            return Err("fiber no longer exists".to_owned());
        };
        if fiber.loop_epoch != signal.epoch {
            return Err(format!(
                "epoch {} superseded by {}",
                signal.epoch, fiber.loop_epoch
            ));
        }
        let now = batch.now();
        let next = fiber.pc + 1;
        match (&fiber.wait, &signal.kind) {
            (WaitState::Timer { due_at }, WakeKind::Timer) if *due_at <= now => {
                Ok(match &fiber.watch {
                    Some(watch) => Resume::Boundary(watch.clone()),
                    None => Resume::At(next),
                })
            }
            (WaitState::Message { name, correlation }, WakeKind::Message { name: n, correlation: c })
                if name == n && correlation == c =>
            {
                Ok(Resume::At(next))
            }
            (WaitState::Human { task }, WakeKind::Human { task: t }) if task == t => {
                Ok(Resume::At(next))
            }
            (WaitState::Race { race, arms }, kind) => {
                let winner = pick_arm(arms, kind, now).ok_or_else(|| {
                    format!("no armed trigger of race {race} matches")
                })?;
                Ok(Resume::Race {
                    race: race.clone(),
                    winner,
                    losers: arms
                        .iter()
                        .map(|a| a.target)
                        .filter(|t| *t != winner)
                        .collect(),
                })
            }
            (wait, _) => Err(format!("fiber is waiting on {}", wait.label())),
        }
    }

    fn fire_boundary(&self, batch: &mut Batch, watchdog: FiberId, watch: Watch) {
        tracing::info!(
            instance = %batch.instance().id,
            boundary = %watch.boundary,
            interrupting = watch.interrupting,
            "boundary timer fired"
        );
        batch.emit(RuntimeEvent::BoundaryFired {
            boundary: watch.boundary.clone(),
            interrupting: watch.interrupting,
        });

        let mut tickets = Vec::new();
        if watch.interrupting {
            if let Some(host) = batch.fiber(watch.host).cloned() {
                if let WaitState::Job { job_key } = host.wait {
                    batch.cancel_job(job_key);
                }
                tickets = host.tickets;
                batch.end_fiber(host.id);
            }
        } else if let Some(host) = batch.fiber_mut(watch.host) {
            host.watchdog = None;
        }

        if let Some(w) = batch.fiber_mut(watchdog) {
            w.watch = None;
            w.tickets = tickets;
        }
        batch.wake(watchdog, watch.target);
    }
}

fn frame(batch: &mut Batch, id: FiberId) -> Result<&mut Fiber, VmError> {
    batch.fiber_mut(id).ok_or(VmError::MissingFiber(id))
}

fn pop(fiber: &mut Fiber, pc: Addr) -> Result<Value, VmError> {
    fiber.stack.pop().ok_or(VmError::StackUnderflow { pc })
}

fn int(value: Value, pc: Addr) -> Result<i64, VmError> {
    value.as_int().ok_or(VmError::TypeMismatch {
        pc,
        expected: "int",
        found: value.type_name(),
    })
}

fn correlation_value(
    batch: &Batch,
    id: FiberId,
    pc: Addr,
    correlation: &Correlation,
) -> Result<String, VmError> {
    match correlation {
        Correlation::Instance => Ok(batch.instance().correlation_id.clone()),
        Correlation::Register { reg } => batch
            .fiber(id)
            .ok_or(VmError::MissingFiber(id))?
            .registers
            .get(usize::from(*reg))
            .map(ToString::to_string)
            .ok_or(VmError::BadRegister { pc, reg: *reg }),
    }
}

fn pick_arm(
    arms: &[ArmWait],
    kind: &WakeKind,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<Addr> {
    match kind {
        WakeKind::Timer => arms
            .iter()
            .filter_map(|a| match a.trigger {
                ArmWaitTrigger::Timer { due_at } if due_at <= now => Some((due_at, a.target)),
                _ => None,
            })
            .min_by_key(|(due_at, _)| *due_at)
            .map(|(_, target)| target),
        WakeKind::Message { name, correlation } => arms
            .iter()
            .find(|a| {
                matches!(&a.trigger, ArmWaitTrigger::Message { name: n, correlation: c }
                    if n == name && c == correlation)
            })
            .map(|a| a.target),
        WakeKind::Human { .. } => None,
    }
}

fn apply_inputs(
    batch: &mut Batch,
    flags: &std::collections::BTreeMap<String, Value>,
    payload: Option<&serde_json::Value>,
) -> Result<(), VmError> {
    let instance = batch.instance_mut();
    instance.merge_flags(flags);
    if let Some(payload) = payload {
        instance.set_payload(payload.clone())?;
    }
    Ok(())
}
