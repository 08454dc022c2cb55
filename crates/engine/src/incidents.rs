//! Incident and dead-letter administration.

use weft_core::{IncidentId, InstanceId};
use weft_execution::transition::validate_job_transition;
use weft_execution::{DeadLetter, Incident, JobKey, JobStatus, RuntimeEvent, WaitState};
use weft_storage::ProcessStore;

use crate::engine::{Engine, ensure_running};
use crate::error::EngineError;

impl<S: ProcessStore> Engine<S> {
    /// Fetch an incident.
    pub async fn get_incident(&self, id: IncidentId) -> Result<Incident, EngineError> {
        self.store()
            .get_incident(id)
            .await?
            .ok_or(EngineError::UnknownIncident(id))
    }

    /// Incidents, optionally for one instance.
    pub async fn list_incidents(
        &self,
        instance: Option<InstanceId>,
    ) -> Result<Vec<Incident>, EngineError> {
        Ok(self.store().list_incidents(instance).await?)
    }

    /// Mark an incident resolved.
    ///
    /// A fiber halted by a job-less fault restarts at the block of the
    /// faulting node. Incidents tied to a dead-lettered job keep their fiber
    /// halted until the job is requeued or cancelled.
    pub async fn resolve_incident(
        &self,
        id: IncidentId,
        resolution: impl Into<String>,
    ) -> Result<(), EngineError> {
        let resolution = resolution.into();
        let instance = self.get_incident(id).await?.instance;
        let _guard = self.lock(instance).await;
        let current = self.get_incident(id).await?;
        if !current.is_open() {
            return Err(EngineError::AlreadyResolved(id));
        }

        self.transact(instance, |vm, batch| {
            let mut incident = current.clone();
            incident.resolve(resolution.clone(), batch.now())?;
            batch.emit(RuntimeEvent::IncidentResolved { incident: id });
            let restarted = incident.job_key.is_none()
                && batch.instance().is_running()
                && vm.restart(batch, &incident);
            tracing::info!(%id, instance = %incident.instance, restarted, "incident resolved");
            batch.put_incident(incident);
            Ok(())
        })
        .await
    }

    /// Dead-letter entries, oldest first.
    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, EngineError> {
        Ok(self.store().list_dead_letters().await?)
    }

    /// Put a dead-lettered job back in the queue with a fresh retry budget
    /// and park its fiber on it again. The linked incident is resolved.
    pub async fn requeue_dead_letter(&self, task_type: &str, key: &JobKey) -> Result<(), EngineError> {
        let instance = self.dead_letter(task_type, key).await?.job.instance;
        let _guard = self.lock(instance).await;
        let entry = self.dead_letter(task_type, key).await?;
        let linked = match entry.incident {
            Some(id) => self.store().get_incident(id).await?,
            None => None,
        };

        self.transact(instance, |_, batch| {
            ensure_running(batch)?;
            let mut job = entry.job.clone();
            let pc = match batch.fiber(job.fiber) {
                Some(fiber) if matches!(fiber.wait, WaitState::Incident { .. }) => fiber.pc,
                _ => return Err(EngineError::OrphanedDeadLetter(key.clone())),
            };
            validate_job_transition(JobStatus::DeadLettered, JobStatus::Pending)?;

            let now = batch.now();
            job.status = JobStatus::Pending;
            job.retries_remaining = job.max_retries;
            job.attempt += 1;
            job.not_before = now;
            job.claimed_at = None;
            job.claimed_by = None;
            batch.park(
                job.fiber,
                pc,
                WaitState::Job {
                    job_key: key.clone(),
                },
            );
            batch.update_job(job);
            batch.remove_dead_letter(task_type.to_owned(), key.clone());

            if let Some(mut incident) = linked.clone().filter(Incident::is_open) {
                incident.resolve("job requeued", now)?;
                batch.emit(RuntimeEvent::IncidentResolved {
                    incident: incident.id,
                });
                batch.put_incident(incident);
            }
            batch.emit(RuntimeEvent::JobRequeued {
                job_key: key.clone(),
            });
            tracing::info!(job_key = %key, task_type, "dead letter requeued");
            Ok(())
        })
        .await
    }

    /// Give up on a dead-lettered job. Its fiber stays halted on the
    /// incident, which can still be resolved or the instance cancelled.
    pub async fn cancel_dead_letter(&self, task_type: &str, key: &JobKey) -> Result<(), EngineError> {
        let instance = self.dead_letter(task_type, key).await?.job.instance;
        let _guard = self.lock(instance).await;
        let entry = self.dead_letter(task_type, key).await?;

        self.transact(instance, |_, batch| {
            validate_job_transition(JobStatus::DeadLettered, JobStatus::Cancelled)?;
            let mut job = entry.job.clone();
            job.status = JobStatus::Cancelled;
            batch.update_job(job);
            batch.remove_dead_letter(task_type.to_owned(), key.clone());
            batch.emit(RuntimeEvent::JobCancelled {
                job_key: key.clone(),
            });
            tracing::info!(job_key = %key, task_type, "dead letter cancelled");
            Ok(())
        })
        .await
    }

    /// Drop expired dead-letter entries. Returns how many went.
    pub async fn purge_expired_dead_letters(&self) -> Result<usize, EngineError> {
        let purged = self.store().purge_expired_dead_letters(self.now()).await?;
        if purged > 0 {
            tracing::info!(purged, "expired dead letters purged");
        }
        Ok(purged)
    }

    async fn dead_letter(&self, task_type: &str, key: &JobKey) -> Result<DeadLetter, EngineError> {
        self.store()
            .get_dead_letter(task_type, key)
            .await?
            .ok_or_else(|| EngineError::UnknownDeadLetter {
                task_type: task_type.to_owned(),
                job_key: key.clone(),
            })
    }
}
