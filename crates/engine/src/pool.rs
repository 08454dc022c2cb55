//! Background workers that keep instances moving.
//!
//! - run workers drain the engine's run queue, one slice per dequeue
//! - a sweeper requeues runnable instances on every tick, and fires due
//!   timers too when [`EngineConfig::sweep_timers`] is set
//!
//! [`EngineConfig::sweep_timers`]: crate::EngineConfig::sweep_timers

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use weft_storage::ProcessStore;

use crate::engine::Engine;

/// A running set of engine workers.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `config.workers` run workers and one sweeper on the current
    /// runtime.
    #[must_use]
    pub fn start<S: ProcessStore>(engine: Arc<Engine<S>>) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let workers = engine.config().workers.max(1);
        for worker in 0..workers {
            tasks.spawn(run_worker(Arc::clone(&engine), shutdown.child_token(), worker));
        }
        tasks.spawn(sweep(Arc::clone(&engine), shutdown.child_token()));
        tracing::info!(workers, "worker pool started");
        Self { shutdown, tasks }
    }

    /// A token that stops the pool when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every worker and wait for in-flight slices to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "worker task panicked");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn run_worker<S: ProcessStore>(
    engine: Arc<Engine<S>>,
    cancel: CancellationToken,
    worker: usize,
) {
    let queue = engine.run_queue();
    loop {
        let id = tokio::select! {
            () = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Ok(id) => id,
                Err(_) => break,
            },
        };
        if let Err(err) = engine.run_instance(id).await {
            tracing::warn!(worker, instance = %id, error = %err, "slice failed");
        }
    }
    tracing::debug!(worker, "run worker stopped");
}

async fn sweep<S: ProcessStore>(engine: Arc<Engine<S>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.config().tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if engine.config().sweep_timers
            && let Err(err) = engine.fire_due_timers().await
        {
            tracing::warn!(error = %err, "timer sweep failed");
        }
        match engine.store().list_runnable().await {
            Ok(ids) => ids.into_iter().for_each(|id| engine.enqueue(id)),
            Err(err) => tracing::warn!(error = %err, "runnable sweep failed"),
        }
        let pruned = engine.prune_locks();
        if pruned > 0 {
            tracing::trace!(pruned, "idle instance locks dropped");
        }
    }
    tracing::debug!("sweeper stopped");
}
