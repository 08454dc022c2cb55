//! The storage trait.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use weft_bytecode::{Program, ProgramHash};
use weft_core::{FiberId, IncidentId, InstanceId};
use weft_execution::{
    CompletionRecord, DeadLetter, EventRecord, Incident, InstanceState, Job, JobKey, Transition,
};

use crate::error::StoreError;

/// Address of one parked fiber at a given epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiberRef {
    /// Owning instance.
    pub instance: InstanceId,
    /// The fiber.
    pub fiber: FiberId,
    /// Loop epoch observed when the reference was taken.
    pub epoch: u64,
}

/// Durable storage for programs, instances, jobs, incidents, and events.
///
/// Instance-scoped state changes only through [`commit`](Self::commit).
/// The job queue additionally supports [`claim_jobs`](Self::claim_jobs),
/// which touches claim metadata only.
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    /// Store a compiled program. Storing the same hash twice is a no-op.
    async fn put_program(&self, program: &Program) -> Result<(), StoreError>;

    /// Fetch a program by content hash.
    async fn get_program(&self, hash: &ProgramHash) -> Result<Option<Program>, StoreError>;

    /// Atomically apply a transition.
    ///
    /// Fails with [`StoreError::Conflict`] unless the stored version equals
    /// `transition.base_version` (or the instance is absent when it is `None`).
    async fn commit(&self, transition: &Transition) -> Result<(), StoreError>;

    /// Load an instance with its fibers and barriers.
    async fn load_state(&self, id: InstanceId) -> Result<Option<InstanceState>, StoreError>;

    /// Running instances that have at least one ready fiber.
    async fn list_runnable(&self) -> Result<Vec<InstanceId>, StoreError>;

    /// Fetch a job.
    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>, StoreError>;

    /// All jobs of one instance, oldest first.
    async fn jobs_for_instance(&self, id: InstanceId) -> Result<Vec<Job>, StoreError>;

    /// Claim up to `max` jobs of the given task types for `worker`.
    async fn claim_jobs(
        &self,
        task_types: &[String],
        worker: &str,
        max: usize,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Vec<Job>, StoreError>;

    /// The recorded result for a job key, if any.
    async fn get_completion(&self, key: &JobKey) -> Result<Option<CompletionRecord>, StoreError>;

    /// Events of one instance with `seq >= from_seq`, in order.
    async fn read_events(
        &self,
        id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Fetch an incident.
    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError>;

    /// Incidents, optionally filtered by instance, oldest first.
    async fn list_incidents(
        &self,
        instance: Option<InstanceId>,
    ) -> Result<Vec<Incident>, StoreError>;

    /// Fetch a dead-letter entry.
    async fn get_dead_letter(
        &self,
        task_type: &str,
        key: &JobKey,
    ) -> Result<Option<DeadLetter>, StoreError>;

    /// All dead-letter entries, oldest first.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError>;

    /// Drop dead-letter entries that expired at or before `now`.
    async fn purge_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Fibers whose timer, race timer arm, or watchdog is due at `now`.
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<FiberRef>, StoreError>;

    /// Fibers waiting on a message, directly or through a race arm.
    async fn find_message_waiters(
        &self,
        name: &str,
        correlation: &str,
    ) -> Result<Vec<FiberRef>, StoreError>;
}
