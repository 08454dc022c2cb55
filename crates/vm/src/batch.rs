//! The working set of one atomic step.
//!
//! A [`Batch`] owns a private copy of an instance's state. Every mutation
//! goes through it so that the resulting [`Transition`] lists exactly the
//! rows and events the step touched.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use weft_bytecode::Addr;
use weft_core::{FiberId, NodeKey};
use weft_execution::{
    Arrival, CompletionRecord, DeadLetter, ExecutionError, Fiber, Incident, InstanceState, Job,
    JobKey, JobWrite, JoinTicket, ProcessInstance, RuntimeEvent, Transition, WaitState,
};

/// Mutable view of one instance during a step.
#[derive(Debug)]
pub struct Batch {
    state: InstanceState,
    base_version: Option<u64>,
    at: DateTime<Utc>,
    touched: HashSet<FiberId>,
    deleted: Vec<FiberId>,
    barriers: BTreeSet<NodeKey>,
    jobs: Vec<JobWrite>,
    cancel_jobs: Vec<JobKey>,
    completions: Vec<CompletionRecord>,
    incidents: Vec<Incident>,
    dead_letters: Vec<DeadLetter>,
    remove_dead_letters: Vec<(String, JobKey)>,
    events: Vec<RuntimeEvent>,
}

impl Batch {
    /// A batch that creates `instance`.
    #[must_use]
    pub fn create(instance: ProcessInstance, at: DateTime<Utc>) -> Self {
        let mut batch = Self::with_base(InstanceState::new(instance), None, at);
        batch.events.push(RuntimeEvent::InstanceStarted {
            program: batch.state.instance.program.clone(),
            correlation_id: batch.state.instance.correlation_id.clone(),
        });
        batch
    }

    /// A batch on top of stored state.
    #[must_use]
    pub fn begin(state: InstanceState, at: DateTime<Utc>) -> Self {
        let base = Some(state.instance.version);
        Self::with_base(state, base, at)
    }

    fn with_base(state: InstanceState, base_version: Option<u64>, at: DateTime<Utc>) -> Self {
        Self {
            state,
            base_version,
            at,
            touched: HashSet::new(),
            deleted: Vec::new(),
            barriers: BTreeSet::new(),
            jobs: Vec::new(),
            cancel_jobs: Vec::new(),
            completions: Vec::new(),
            incidents: Vec::new(),
            dead_letters: Vec::new(),
            remove_dead_letters: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Step time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.at
    }

    /// Read-only state.
    #[must_use]
    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// The instance record.
    #[must_use]
    pub fn instance(&self) -> &ProcessInstance {
        &self.state.instance
    }

    /// The instance record, mutably.
    pub fn instance_mut(&mut self) -> &mut ProcessInstance {
        &mut self.state.instance
    }

    /// Look up a fiber.
    #[must_use]
    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.state.fiber(id)
    }

    /// Look up a fiber for writing; it will be persisted.
    pub fn fiber_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        let fiber = self.state.fibers.get_mut(&id)?;
        self.touched.insert(id);
        Some(fiber)
    }

    /// Spawn a ready fiber at `pc`.
    pub fn spawn(&mut self, pc: Addr, parent: Option<FiberId>) -> FiberId {
        let seq = self.state.instance.take_fiber_seq();
        let fiber = Fiber::new(self.state.instance.id, seq, pc);
        let id = fiber.id;
        self.state.fibers.insert(id, fiber);
        self.touched.insert(id);
        self.events.push(RuntimeEvent::FiberSpawned { fiber: id, parent, pc });
        id
    }

    /// Remove a fiber; returns it if it existed.
    pub fn end_fiber(&mut self, id: FiberId) -> Option<Fiber> {
        let fiber = self.state.fibers.remove(&id)?;
        self.touched.remove(&id);
        self.deleted.push(id);
        self.events.push(RuntimeEvent::FiberEnded { fiber: id });
        Some(fiber)
    }

    /// Park a fiber at `pc` on `wait`.
    pub fn park(&mut self, id: FiberId, pc: Addr, wait: WaitState) {
        let label = wait.label().to_owned();
        if let Some(fiber) = self.fiber_mut(id) {
            fiber.pc = pc;
            fiber.wait = wait;
            tracing::debug!(fiber = %id, pc, wait = %label, "fiber parked");
        }
        self.events.push(RuntimeEvent::FiberParked { fiber: id, wait: label, pc });
    }

    /// Wake a parked fiber at `pc`, bumping its epoch.
    pub fn wake(&mut self, id: FiberId, pc: Addr) {
        let Some(fiber) = self.fiber_mut(id) else {
            return;
        };
        fiber.wake(pc);
        let epoch = fiber.loop_epoch;
        self.events.push(RuntimeEvent::FiberResumed { fiber: id, epoch });
    }

    /// Start a new activation of a join.
    pub fn activate_join(&mut self, join: &NodeKey, expected: u32) -> u64 {
        let activation = self.state.activate_join(join, expected);
        self.barriers.insert(join.clone());
        self.events.push(RuntimeEvent::JoinActivated {
            join: join.clone(),
            activation,
            expected,
        });
        activation
    }

    /// Spend a join ticket.
    pub fn arrive(&mut self, ticket: &JoinTicket) -> Result<Arrival, ExecutionError> {
        let arrival = self.state.arrive(ticket)?;
        self.barriers.insert(ticket.join.clone());
        match arrival {
            Arrival::Waiting { arrived, expected } => {
                self.events.push(RuntimeEvent::JoinArrived {
                    join: ticket.join.clone(),
                    arrived,
                    expected,
                });
            }
            Arrival::Satisfied { activation } => {
                self.events.push(RuntimeEvent::JoinSatisfied {
                    join: ticket.join.clone(),
                    activation,
                });
            }
            Arrival::Stale => {}
        }
        Ok(arrival)
    }

    /// Create a job unless one with the same key exists.
    pub fn dispatch(&mut self, job: Job) {
        self.events.push(RuntimeEvent::JobDispatched {
            job_key: job.key.clone(),
            task_type: job.task_type.clone(),
        });
        self.jobs.push(JobWrite::Dispatch(job));
    }

    /// Overwrite a job row.
    pub fn update_job(&mut self, job: Job) {
        self.jobs.push(JobWrite::Update(job));
    }

    /// Cancel a job if it is still open.
    pub fn cancel_job(&mut self, key: JobKey) {
        self.events.push(RuntimeEvent::JobCancelled {
            job_key: key.clone(),
        });
        self.cancel_jobs.push(key);
    }

    /// Record a job result in the dedupe cache.
    pub fn record_completion(&mut self, record: CompletionRecord) {
        self.completions.push(record);
    }

    /// Store a new or changed incident.
    pub fn put_incident(&mut self, incident: Incident) {
        self.incidents.push(incident);
    }

    /// Add a dead-letter entry.
    pub fn put_dead_letter(&mut self, entry: DeadLetter) {
        self.dead_letters.push(entry);
    }

    /// Drop a dead-letter entry.
    pub fn remove_dead_letter(&mut self, task_type: String, key: JobKey) {
        self.remove_dead_letters.push((task_type, key));
    }

    /// Append an event.
    pub fn emit(&mut self, event: RuntimeEvent) {
        self.events.push(event);
    }

    /// Events recorded so far.
    #[must_use]
    pub fn events(&self) -> &[RuntimeEvent] {
        &self.events
    }

    /// Whether nothing was changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base_version.is_some()
            && self.touched.is_empty()
            && self.deleted.is_empty()
            && self.barriers.is_empty()
            && self.jobs.is_empty()
            && self.cancel_jobs.is_empty()
            && self.completions.is_empty()
            && self.incidents.is_empty()
            && self.dead_letters.is_empty()
            && self.remove_dead_letters.is_empty()
            && self.events.is_empty()
    }

    /// Close the batch into a transition one version ahead of its base.
    #[must_use]
    pub fn finish(self) -> (Transition, InstanceState) {
        let Self {
            mut state,
            base_version,
            at,
            touched,
            deleted,
            barriers,
            jobs,
            cancel_jobs,
            completions,
            incidents,
            dead_letters,
            remove_dead_letters,
            events,
        } = self;

        state.instance.version = base_version.map_or(0, |v| v + 1);
        state.instance.updated_at = at;

        let mut upsert: Vec<Fiber> = touched
            .iter()
            .filter_map(|id| state.fibers.get(id).cloned())
            .collect();
        upsert.sort_by_key(|f| f.seq);

        let mut transition = Transition::new(state.instance.clone(), base_version, at);
        transition.upsert_fibers = upsert;
        transition.delete_fibers = deleted;
        transition.barriers = barriers
            .iter()
            .filter_map(|join| state.barriers.get(join).cloned())
            .collect();
        transition.jobs = jobs;
        transition.cancel_jobs = cancel_jobs;
        transition.completions = completions;
        transition.incidents = incidents;
        transition.dead_letters = dead_letters;
        transition.remove_dead_letters = remove_dead_letters;
        transition.events = events;
        (transition, state)
    }
}
