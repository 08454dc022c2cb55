//! In-memory store for tests and single-process embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use weft_bytecode::{Program, ProgramHash};
use weft_core::{IncidentId, InstanceId};
use weft_execution::{
    CompletionRecord, DeadLetter, EventRecord, Incident, InstanceState, Job, JobKey, JobStatus,
    JobWrite, Transition,
};

use crate::error::StoreError;
use crate::store::{FiberRef, ProcessStore};

#[derive(Debug, Default)]
struct Inner {
    programs: HashMap<ProgramHash, Program>,
    instances: HashMap<InstanceId, InstanceState>,
    jobs: BTreeMap<JobKey, Job>,
    completions: HashMap<JobKey, CompletionRecord>,
    incidents: HashMap<IncidentId, Incident>,
    dead_letters: BTreeMap<(String, JobKey), DeadLetter>,
    events: HashMap<InstanceId, Vec<EventRecord>>,
}

/// A [`ProcessStore`] kept in process memory.
///
/// Clones share the same data, so dropping an engine and building a new one
/// over a clone behaves like a process restart against a durable database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.inner.lock().instances.len()
    }

    /// Number of stored jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.inner.lock().jobs.len()
    }
}

fn check_version(inner: &Inner, transition: &Transition) -> Result<(), StoreError> {
    let id = transition.instance.id;
    let found = inner.instances.get(&id).map(|s| s.instance.version);
    if found != transition.base_version {
        return Err(StoreError::Conflict {
            instance: id,
            expected: transition.base_version,
            found,
        });
    }
    Ok(())
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn put_program(&self, program: &Program) -> Result<(), StoreError> {
        program.verify_hash()?;
        self.inner
            .lock()
            .programs
            .entry(program.hash().clone())
            .or_insert_with(|| program.clone());
        Ok(())
    }

    async fn get_program(&self, hash: &ProgramHash) -> Result<Option<Program>, StoreError> {
        Ok(self.inner.lock().programs.get(hash).cloned())
    }

    async fn commit(&self, transition: &Transition) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        check_version(&inner, transition)?;

        let id = transition.instance.id;
        let state = inner
            .instances
            .entry(id)
            .or_insert_with(|| InstanceState::new(transition.instance.clone()));
        transition.apply_to(state);

        for write in &transition.jobs {
            match write {
                JobWrite::Dispatch(job) => {
                    inner.jobs.entry(job.key.clone()).or_insert_with(|| job.clone());
                }
                JobWrite::Update(job) => {
                    inner.jobs.insert(job.key.clone(), job.clone());
                }
            }
        }
        for key in &transition.cancel_jobs {
            if let Some(job) = inner.jobs.get_mut(key).filter(|j| j.status.is_open()) {
                job.status = JobStatus::Cancelled;
            }
        }
        for record in &transition.completions {
            inner
                .completions
                .entry(record.job_key.clone())
                .or_insert_with(|| record.clone());
        }
        for incident in &transition.incidents {
            inner.incidents.insert(incident.id, incident.clone());
        }
        for key in &transition.remove_dead_letters {
            inner.dead_letters.remove(key);
        }
        for entry in &transition.dead_letters {
            inner.dead_letters.insert(
                (entry.task_type.clone(), entry.job_key.clone()),
                entry.clone(),
            );
        }

        let log = inner.events.entry(id).or_default();
        let mut seq = log.last().map_or(0, |r| r.seq);
        for event in &transition.events {
            seq += 1;
            log.push(EventRecord {
                instance: id,
                seq,
                at: transition.at,
                event: event.clone(),
            });
        }
        tracing::trace!(instance = %id, version = transition.instance.version, "committed");
        Ok(())
    }

    async fn load_state(&self, id: InstanceId) -> Result<Option<InstanceState>, StoreError> {
        Ok(self.inner.lock().instances.get(&id).cloned())
    }

    async fn list_runnable(&self) -> Result<Vec<InstanceId>, StoreError> {
        let inner = self.inner.lock();
        let mut runnable: Vec<&InstanceState> = inner
            .instances
            .values()
            .filter(|s| s.instance.is_running() && !s.ready_fibers().is_empty())
            .collect();
        runnable.sort_by_key(|s| s.instance.created_at);
        Ok(runnable.into_iter().map(|s| s.instance.id).collect())
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().jobs.get(key).cloned())
    }

    async fn jobs_for_instance(&self, id: InstanceId) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.instance == id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn claim_jobs(
        &self,
        task_types: &[String],
        worker: &str,
        max: usize,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.inner.lock();
        let mut candidates: Vec<&mut Job> = inner
            .jobs
            .values_mut()
            .filter(|j| task_types.contains(&j.task_type) && j.is_claimable(now, lease))
            .collect();
        candidates.sort_by_key(|j| (j.not_before, j.created_at));

        let mut claimed = Vec::new();
        for job in candidates.into_iter().take(max) {
            job.claim(worker, now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn get_completion(&self, key: &JobKey) -> Result<Option<CompletionRecord>, StoreError> {
        Ok(self.inner.lock().completions.get(key).cloned())
    }

    async fn read_events(
        &self,
        id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .events
            .get(&id)
            .map(|log| log.iter().filter(|r| r.seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        Ok(self.inner.lock().incidents.get(&id).cloned())
    }

    async fn list_incidents(
        &self,
        instance: Option<InstanceId>,
    ) -> Result<Vec<Incident>, StoreError> {
        let inner = self.inner.lock();
        let mut incidents: Vec<Incident> = inner
            .incidents
            .values()
            .filter(|i| instance.is_none_or(|id| i.instance == id))
            .cloned()
            .collect();
        incidents.sort_by_key(|i| i.raised_at);
        Ok(incidents)
    }

    async fn get_dead_letter(
        &self,
        task_type: &str,
        key: &JobKey,
    ) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self
            .inner
            .lock()
            .dead_letters
            .get(&(task_type.to_owned(), key.clone()))
            .cloned())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let mut entries: Vec<DeadLetter> =
            self.inner.lock().dead_letters.values().cloned().collect();
        entries.sort_by_key(|d| d.dead_lettered_at);
        Ok(entries)
    }

    async fn purge_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.dead_letters.len();
        inner.dead_letters.retain(|_, d| !d.is_expired(now));
        Ok(before - inner.dead_letters.len())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<FiberRef>, StoreError> {
        let inner = self.inner.lock();
        let mut due = Vec::new();
        for state in inner.instances.values().filter(|s| s.instance.is_running()) {
            for fiber in state.fibers_by_seq() {
                if let Some(at) = fiber.wait.due_at().filter(|at| *at <= now) {
                    due.push((at, state.instance.created_at, fiber.seq, FiberRef {
                        instance: fiber.instance,
                        fiber: fiber.id,
                        epoch: fiber.loop_epoch,
                    }));
                }
            }
        }
        due.sort_by_key(|(at, created, seq, _)| (*at, *created, *seq));
        Ok(due.into_iter().map(|(.., r)| r).collect())
    }

    async fn find_message_waiters(
        &self,
        name: &str,
        correlation: &str,
    ) -> Result<Vec<FiberRef>, StoreError> {
        let inner = self.inner.lock();
        let mut states: Vec<&InstanceState> = inner
            .instances
            .values()
            .filter(|s| s.instance.is_running())
            .collect();
        states.sort_by_key(|s| s.instance.created_at);
        Ok(states
            .into_iter()
            .flat_map(|s| s.fibers_by_seq())
            .filter(|f| f.wait.awaits_message(name, correlation))
            .map(|f| FiberRef {
                instance: f.instance,
                fiber: f.id,
                epoch: f.loop_epoch,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use weft_core::NodeKey;
    use weft_execution::{Fiber, ProcessInstance, RuntimeEvent, WaitState};

    fn hash() -> ProgramHash {
        ProgramHash::parse(&"b".repeat(64)).unwrap()
    }

    fn created(now: DateTime<Utc>) -> Transition {
        let instance =
            ProcessInstance::new(InstanceId::new(), hash(), serde_json::json!({}), "c-1", now)
                .unwrap();
        let mut t = Transition::new(instance, None, now);
        t.events.push(RuntimeEvent::InstanceStarted {
            program: hash(),
            correlation_id: "c-1".into(),
        });
        t
    }

    fn next(state: &InstanceState, now: DateTime<Utc>) -> Transition {
        let mut instance = state.instance.clone();
        instance.version += 1;
        Transition::new(instance, Some(state.instance.version), now)
    }

    fn job(instance: InstanceId, task_type: &str, now: DateTime<Utc>) -> Job {
        let fiber = Fiber::new(instance, 0, 0);
        Job {
            key: JobKey::from_raw(format!("{instance}:{task_type}")),
            instance,
            fiber: fiber.id,
            epoch: 0,
            node: NodeKey::new("task").unwrap(),
            task_type: task_type.into(),
            payload: serde_json::json!({}),
            flags: BTreeMap::new(),
            attempt: 1,
            retries_remaining: 0,
            max_retries: 0,
            status: JobStatus::Pending,
            not_before: now,
            claimed_at: None,
            claimed_by: None,
            last_error: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn commit_checks_base_version() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let create = created(now);
        let id = create.instance.id;
        store.commit(&create).await.unwrap();

        let err = store.commit(&create).await.unwrap_err();
        assert!(err.is_conflict());

        let state = store.load_state(id).await.unwrap().unwrap();
        store.commit(&next(&state, now)).await.unwrap();
        let stale = next(&state, now);
        assert!(store.commit(&stale).await.unwrap_err().is_conflict());
        assert_eq!(store.load_state(id).await.unwrap().unwrap().instance.version, 1);
    }

    #[tokio::test]
    async fn events_get_monotonic_sequence() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let create = created(now);
        let id = create.instance.id;
        store.commit(&create).await.unwrap();
        let state = store.load_state(id).await.unwrap().unwrap();
        let mut t = next(&state, now);
        t.events.push(RuntimeEvent::InstanceCompleted);
        store.commit(&t).await.unwrap();

        let seqs: Vec<u64> = store
            .read_events(id, 0)
            .await
            .unwrap()
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(store.read_events(id, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_is_insert_if_absent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut create = created(now);
        let id = create.instance.id;
        let original = job(id, "work", now);
        create.jobs.push(JobWrite::Dispatch(original.clone()));
        store.commit(&create).await.unwrap();

        let state = store.load_state(id).await.unwrap().unwrap();
        let mut t = next(&state, now);
        let mut duplicate = original.clone();
        duplicate.attempt = 9;
        t.jobs.push(JobWrite::Dispatch(duplicate));
        store.commit(&t).await.unwrap();

        assert_eq!(store.job_count(), 1);
        assert_eq!(store.get_job(&original.key).await.unwrap().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn claim_respects_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut create = created(now);
        let id = create.instance.id;
        create.jobs.push(JobWrite::Dispatch(job(id, "work", now)));
        store.commit(&create).await.unwrap();

        let types = vec!["work".to_owned()];
        let lease = TimeDelta::seconds(30);
        assert_eq!(store.claim_jobs(&types, "w1", 10, now, lease).await.unwrap().len(), 1);
        assert!(store.claim_jobs(&types, "w2", 10, now, lease).await.unwrap().is_empty());

        let later = now + TimeDelta::seconds(31);
        let reclaimed = store.claim_jobs(&types, "w2", 10, later, lease).await.unwrap();
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn timers_and_message_waiters_are_indexed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut create = created(now);
        let id = create.instance.id;
        let mut sleeper = Fiber::new(id, 0, 3);
        sleeper.wait = WaitState::Timer {
            due_at: now + TimeDelta::seconds(5),
        };
        let mut listener = Fiber::new(id, 1, 4);
        listener.wait = WaitState::Message {
            name: "paid".into(),
            correlation: "c-1".into(),
        };
        create.upsert_fibers.extend([sleeper.clone(), listener.clone()]);
        store.commit(&create).await.unwrap();

        assert!(store.due_timers(now).await.unwrap().is_empty());
        let due = store.due_timers(now + TimeDelta::seconds(5)).await.unwrap();
        assert_eq!(due.iter().map(|r| r.fiber).collect::<Vec<_>>(), vec![sleeper.id]);

        let waiters = store.find_message_waiters("paid", "c-1").await.unwrap();
        assert_eq!(waiters.len(), 1);
        assert_eq!(waiters[0].fiber, listener.id);
        assert!(store.find_message_waiters("paid", "c-2").await.unwrap().is_empty());
        assert!(store.list_runnable().await.unwrap().is_empty());
    }
}
