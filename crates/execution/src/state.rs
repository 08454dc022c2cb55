//! In-memory view of one instance and the atomic unit that changes it.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_core::{FiberId, NodeKey};

use crate::dead_letter::DeadLetter;
use crate::event::RuntimeEvent;
use crate::fiber::Fiber;
use crate::incident::Incident;
use crate::instance::ProcessInstance;
use crate::job::{CompletionRecord, Job, JobKey};
use crate::join::JoinBarrier;

/// An instance record together with its live fibers and join barriers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// The instance record.
    pub instance: ProcessInstance,
    /// Live fibers by id.
    pub fibers: HashMap<FiberId, Fiber>,
    /// Join barriers by join node.
    pub barriers: BTreeMap<NodeKey, JoinBarrier>,
}

impl InstanceState {
    /// A state with no fibers or barriers yet.
    #[must_use]
    pub fn new(instance: ProcessInstance) -> Self {
        Self {
            instance,
            fibers: HashMap::new(),
            barriers: BTreeMap::new(),
        }
    }

    /// Look up a fiber.
    #[must_use]
    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(&id)
    }

    /// Look up a fiber mutably.
    pub fn fiber_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.fibers.get_mut(&id)
    }

    /// All fibers in spawn order.
    #[must_use]
    pub fn fibers_by_seq(&self) -> Vec<&Fiber> {
        let mut fibers: Vec<&Fiber> = self.fibers.values().collect();
        fibers.sort_by_key(|f| f.seq);
        fibers
    }

    /// Ids of runnable fibers in spawn order.
    #[must_use]
    pub fn ready_fibers(&self) -> Vec<FiberId> {
        self.fibers_by_seq()
            .into_iter()
            .filter(|f| f.wait.is_ready())
            .map(|f| f.id)
            .collect()
    }
}

/// A job row write inside a [`Transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "write", rename_all = "snake_case")]
pub enum JobWrite {
    /// Insert the job unless a job with the same key already exists.
    Dispatch(Job),
    /// Overwrite an existing job row.
    Update(Job),
}

impl JobWrite {
    /// The job being written.
    #[must_use]
    pub fn job(&self) -> &Job {
        match self {
            Self::Dispatch(job) | Self::Update(job) => job,
        }
    }
}

/// Everything one step changes, committed atomically.
///
/// The store accepts a transition only if the stored instance version
/// equals `base_version`, then writes `instance` (whose version is one
/// higher) along with every listed row and event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// The instance record after the step.
    pub instance: ProcessInstance,
    /// Version the step was computed from; `None` creates the instance.
    pub base_version: Option<u64>,
    /// Commit time.
    pub at: DateTime<Utc>,
    /// Fibers created or changed.
    pub upsert_fibers: Vec<Fiber>,
    /// Fibers that ended.
    pub delete_fibers: Vec<FiberId>,
    /// Barriers created or changed.
    pub barriers: Vec<JoinBarrier>,
    /// Job rows.
    pub jobs: Vec<JobWrite>,
    /// Jobs whose branch went away; cancelled if still open.
    pub cancel_jobs: Vec<JobKey>,
    /// Recorded job results.
    pub completions: Vec<CompletionRecord>,
    /// Incidents created or changed.
    pub incidents: Vec<Incident>,
    /// Dead letters created.
    pub dead_letters: Vec<DeadLetter>,
    /// Dead letters removed, by task type and job key.
    pub remove_dead_letters: Vec<(String, JobKey)>,
    /// Events to append, in order.
    pub events: Vec<RuntimeEvent>,
}

impl Transition {
    /// An empty transition on top of `base_version`.
    #[must_use]
    pub fn new(instance: ProcessInstance, base_version: Option<u64>, at: DateTime<Utc>) -> Self {
        Self {
            instance,
            base_version,
            at,
            upsert_fibers: Vec::new(),
            delete_fibers: Vec::new(),
            barriers: Vec::new(),
            jobs: Vec::new(),
            cancel_jobs: Vec::new(),
            completions: Vec::new(),
            incidents: Vec::new(),
            dead_letters: Vec::new(),
            remove_dead_letters: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Whether the transition creates the instance.
    #[must_use]
    pub fn is_create(&self) -> bool {
        self.base_version.is_none()
    }

    /// Apply the instance-scoped parts to `state`.
    pub fn apply_to(&self, state: &mut InstanceState) {
        state.instance = self.instance.clone();
        for id in &self.delete_fibers {
            state.fibers.remove(id);
        }
        for fiber in &self.upsert_fibers {
            state.fibers.insert(fiber.id, fiber.clone());
        }
        for barrier in &self.barriers {
            state.barriers.insert(barrier.join.clone(), barrier.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use weft_bytecode::ProgramHash;
    use weft_core::InstanceId;

    fn instance() -> ProcessInstance {
        let hash = ProgramHash::parse(&"a".repeat(64)).unwrap();
        ProcessInstance::new(InstanceId::new(), hash, serde_json::json!({}), "c", Utc::now()).unwrap()
    }

    #[test]
    fn ready_fibers_follow_spawn_order() {
        let mut state = InstanceState::new(instance());
        let id = state.instance.id;
        let mut late = Fiber::new(id, 5, 0);
        let early = Fiber::new(id, 1, 0);
        let parked = {
            let mut f = Fiber::new(id, 3, 0);
            f.wait = crate::fiber::WaitState::Human { task: "t".into() };
            f
        };
        late.pc = 7;
        for f in [late.clone(), early.clone(), parked] {
            state.fibers.insert(f.id, f);
        }
        assert_eq!(state.ready_fibers(), vec![early.id, late.id]);
    }

    #[test]
    fn apply_deletes_then_upserts() {
        let mut state = InstanceState::new(instance());
        let id = state.instance.id;
        let gone = Fiber::new(id, 1, 0);
        state.fibers.insert(gone.id, gone.clone());

        let mut next = state.instance.clone();
        next.version = 1;
        let mut transition = Transition::new(next, Some(0), Utc::now());
        let born = Fiber::new(id, 2, 4);
        transition.delete_fibers.push(gone.id);
        transition.upsert_fibers.push(born.clone());
        transition.barriers.push(JoinBarrier {
            join: NodeKey::new("j").unwrap(),
            activation: 1,
            arrived: 0,
        });
        transition.apply_to(&mut state);

        assert_eq!(state.instance.version, 1);
        assert!(state.fiber(gone.id).is_none());
        assert_eq!(state.fiber(born.id).map(|f| f.pc), Some(4));
        assert_eq!(state.barriers.len(), 1);
        assert!(!transition.is_create());
    }
}
