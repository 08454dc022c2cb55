//! Process engine.
//!
//! Owns the program cache and the store, and is the only path through which
//! instance state changes: every operation loads an instance, applies its
//! effect and runs the VM inside one [`Batch`], then commits the resulting
//! transition atomically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use weft_bytecode::{Program, ProgramCache, ProgramHash};
use weft_core::{Clock, InstanceId, SystemClock};
use weft_execution::{EventRecord, InstanceState, ProcessInstance, RuntimeEvent, Transition};
use weft_ir::ProcessGraph;
use weft_storage::ProcessStore;
use weft_vm::{Batch, Vm};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// The process engine.
///
/// Work for one instance is serialised by an in-process lock; the store's
/// optimistic version check covers other processes sharing the store.
/// Independent instances proceed concurrently.
pub struct Engine<S> {
    store: S,
    programs: Arc<ProgramCache>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
    runs_tx: async_channel::Sender<InstanceId>,
    runs_rx: async_channel::Receiver<InstanceId>,
}

impl<S: ProcessStore> Engine<S> {
    /// Create an engine over `store` with a private program cache and the
    /// system clock.
    pub fn new(store: S, config: EngineConfig) -> Self {
        let (runs_tx, runs_rx) = async_channel::bounded(config.queue_capacity.max(1));
        Self {
            store,
            programs: Arc::new(ProgramCache::new()),
            clock: Arc::new(SystemClock),
            config,
            locks: DashMap::new(),
            runs_tx,
            runs_rx,
        }
    }

    /// Use a different clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a program cache owned by the embedding application.
    #[must_use]
    pub fn with_programs(mut self, programs: Arc<ProgramCache>) -> Self {
        self.programs = programs;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The program cache.
    pub fn programs(&self) -> &Arc<ProgramCache> {
        &self.programs
    }

    /// The engine's notion of now.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── programs ───────────────────────────────────────────────────────────

    /// Verify, lower, cache and persist a process graph.
    pub async fn deploy(&self, graph: &ProcessGraph) -> Result<ProgramHash, EngineError> {
        let program = weft_compiler::compile(graph)?;
        self.install(program).await
    }

    /// Cache and persist an already compiled program.
    pub async fn install(&self, program: Program) -> Result<ProgramHash, EngineError> {
        let program = self.programs.insert(program)?;
        self.store.put_program(&program).await?;
        let hash = program.hash().clone();
        tracing::info!(program = %hash.short(), instructions = program.len(), "program deployed");
        Ok(hash)
    }

    /// Look a program up in the cache, falling back to the store.
    pub async fn program(&self, hash: &ProgramHash) -> Result<Arc<Program>, EngineError> {
        if let Some(program) = self.programs.get(hash) {
            return Ok(program);
        }
        let program = self
            .store
            .get_program(hash)
            .await?
            .ok_or_else(|| EngineError::UnknownProgram(hash.clone()))?;
        tracing::debug!(program = %hash.short(), "program loaded from store");
        Ok(self.programs.insert(program)?)
    }

    // ── instances ──────────────────────────────────────────────────────────

    /// Start an instance of a deployed program and run it to its first
    /// suspension.
    pub async fn start(
        &self,
        program: &ProgramHash,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Result<InstanceId, EngineError> {
        let code = self.program(program).await?;
        let now = self.now();
        let instance = ProcessInstance::new(
            InstanceId::new(),
            program.clone(),
            payload,
            correlation_id,
            now,
        )?;
        let id = instance.id;
        let _guard = self.lock(id).await;

        let vm = self.vm(&code);
        let mut batch = Batch::create(instance, now);
        vm.start(&mut batch);
        let report = vm.run(&mut batch)?;
        let (transition, _) = batch.finish();
        self.store.commit(&transition).await?;
        tracing::info!(instance = %id, program = %program.short(), "instance started");
        self.committed(&transition, report.exhausted);
        Ok(id)
    }

    /// Run an instance's ready fibers for one slice.
    pub async fn run_instance(&self, id: InstanceId) -> Result<(), EngineError> {
        let _guard = self.lock(id).await;
        self.transact(id, |_, _| Ok(())).await
    }

    /// Run every instance the store reports as runnable, e.g. after a
    /// restart. Returns how many were visited.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let ids = self.store.list_runnable().await?;
        for id in &ids {
            if let Err(err) = self.run_instance(*id).await {
                tracing::warn!(instance = %id, error = %err, "recovery slice failed");
            }
        }
        if !ids.is_empty() {
            tracing::info!(instances = ids.len(), "recovered runnable instances");
        }
        Ok(ids.len())
    }

    /// Cancel a running instance: every fiber is deleted and its open jobs
    /// are cancelled.
    pub async fn cancel(&self, id: InstanceId, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        let _guard = self.lock(id).await;
        self.transact(id, |vm, batch| {
            ensure_running(batch)?;
            vm.cancel(batch, reason.clone())?;
            Ok(())
        })
        .await
    }

    /// The instance record with its fibers and join barriers.
    pub async fn inspect(&self, id: InstanceId) -> Result<InstanceState, EngineError> {
        self.store
            .load_state(id)
            .await?
            .ok_or(EngineError::UnknownInstance(id))
    }

    /// Event log entries with `seq >= from_seq`.
    pub async fn read_events(
        &self,
        id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>, EngineError> {
        if self.store.load_state(id).await?.is_none() {
            return Err(EngineError::UnknownInstance(id));
        }
        Ok(self.store.read_events(id, from_seq).await?)
    }

    // ── plumbing ───────────────────────────────────────────────────────────

    pub(crate) fn vm<'p>(&self, program: &'p Program) -> Vm<'p> {
        Vm::new(program).with_max_steps(self.config.max_steps_per_slice)
    }

    /// Serialise work on one instance.
    pub(crate) async fn lock(&self, id: InstanceId) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    /// Load, apply, run, commit. The caller holds the instance lock.
    ///
    /// `apply` may run more than once when the commit loses a version race;
    /// it sees fresh state each time. Returning an error abandons the batch.
    pub(crate) async fn transact<R>(
        &self,
        id: InstanceId,
        mut apply: impl FnMut(&Vm<'_>, &mut Batch) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(out) = self.try_commit(id, &mut apply).await? {
                return Ok(out);
            }
            self.conflicted(id, attempt)?;
        }
    }

    /// One load, apply, run, commit pass. `None` means the commit lost a
    /// version race and nothing was written.
    pub(crate) async fn try_commit<R>(
        &self,
        id: InstanceId,
        apply: impl FnOnce(&Vm<'_>, &mut Batch) -> Result<R, EngineError>,
    ) -> Result<Option<R>, EngineError> {
        let state = self.inspect(id).await?;
        let program = self.program(&state.instance.program).await?;
        let vm = self.vm(&program);
        let mut batch = Batch::begin(state, self.now());
        let out = apply(&vm, &mut batch)?;
        let report = vm.run(&mut batch)?;
        if batch.is_empty() {
            return Ok(Some(out));
        }

        let (transition, _) = batch.finish();
        match self.store.commit(&transition).await {
            Ok(()) => {
                self.committed(&transition, report.exhausted);
                Ok(Some(out))
            }
            Err(err) if err.is_conflict() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Account for a lost commit race; fails once the attempts run out.
    pub(crate) fn conflicted(&self, id: InstanceId, attempt: u32) -> Result<(), EngineError> {
        if attempt >= self.config.commit_attempts {
            return Err(EngineError::Contention {
                instance: id,
                attempts: attempt,
            });
        }
        tracing::warn!(instance = %id, attempt, "commit conflict, retrying");
        Ok(())
    }

    fn committed(&self, transition: &Transition, exhausted: bool) {
        let instance = &transition.instance;
        if transition.events.iter().any(RuntimeEvent::is_terminal) {
            tracing::info!(instance = %instance.id, status = %instance.status, "instance finished");
        }
        if !instance.status.is_terminal() && exhausted {
            self.enqueue(instance.id);
        }
    }

    /// Drop per-instance locks nobody holds or waits on. Returns how many
    /// went. The worker pool calls this on every sweep.
    pub fn prune_locks(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Ask the worker pool to run an instance.
    pub fn enqueue(&self, id: InstanceId) {
        if let Err(err) = self.runs_tx.try_send(id) {
            tracing::debug!(instance = %id, error = %err, "run queue full, leaving it to the sweep");
        }
    }

    pub(crate) fn run_queue(&self) -> async_channel::Receiver<InstanceId> {
        self.runs_rx.clone()
    }
}

impl<S> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("programs", &self.programs.len())
            .field("locked_instances", &self.locks.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn ensure_running(batch: &Batch) -> Result<(), EngineError> {
    let instance = batch.instance();
    if instance.is_running() {
        Ok(())
    } else {
        Err(EngineError::NotRunning {
            instance: instance.id,
            status: instance.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_storage::MemoryStore;

    #[tokio::test]
    async fn held_locks_survive_pruning() {
        let engine = Engine::new(MemoryStore::new(), EngineConfig::default());
        let id = InstanceId::new();
        let guard = engine.lock(id).await;
        assert_eq!(engine.prune_locks(), 0);
        assert_eq!(engine.locks.len(), 1);

        drop(guard);
        assert_eq!(engine.prune_locks(), 1);
        assert!(engine.locks.is_empty());
    }

    #[tokio::test]
    async fn waiters_share_one_mutex() {
        let engine = Arc::new(Engine::new(MemoryStore::new(), EngineConfig::default()));
        let id = InstanceId::new();
        let guard = engine.lock(id).await;

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let _guard = engine.lock(id).await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(engine.prune_locks(), 0);
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(engine.prune_locks(), 1);
    }
}
