//! Job dispatcher: activation, completion and failure handling.
//!
//! Jobs are created by the VM when a fiber reaches a ServiceTask; this
//! module is the executor-facing side. Results are applied exactly once
//! through the dedupe cache, failures either retry with backoff, follow a
//! business error route, or escalate to an incident plus a dead-letter entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use weft_core::clock::after;
use weft_core::IncidentId;
use weft_execution::transition::validate_job_transition;
use weft_execution::{
    CompletionRecord, DeadLetter, ErrorClass, FailureKind, Incident, Job, JobCompletion,
    JobFailure, JobKey, JobStatus, RetryPolicy, RuntimeEvent, WaitState,
};
use weft_storage::ProcessStore;
use weft_vm::{Batch, Vm};

use crate::engine::Engine;
use crate::error::EngineError;

/// What happened to a reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The result was applied and the fiber resumed.
    Applied,
    /// A result for this job was already recorded; nothing changed.
    Duplicate,
    /// The job no longer matters (cancelled branch, lost race, finished
    /// instance). The result was recorded and otherwise ignored.
    Ignored,
}

/// What happened to a reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The job was put back in the queue.
    RetryScheduled {
        /// The upcoming attempt number.
        attempt: u32,
        /// Earliest time it may be claimed again.
        not_before: DateTime<Utc>,
    },
    /// The business error followed an error route.
    Routed {
        /// The error code.
        code: String,
    },
    /// Retries are exhausted or the error had no route.
    DeadLettered {
        /// The incident raised alongside.
        incident: IncidentId,
    },
    /// The job no longer matters.
    Ignored,
}

impl<S: ProcessStore> Engine<S> {
    /// Claim up to `max` jobs of the given types for `worker`.
    pub async fn activate_jobs(
        &self,
        task_types: &[String],
        worker: &str,
        max: usize,
    ) -> Result<Vec<Job>, EngineError> {
        let jobs = self
            .store()
            .claim_jobs(task_types, worker, max, self.now(), self.config().claim_lease())
            .await?;
        for job in &jobs {
            tracing::debug!(job_key = %job.key, worker, attempt = job.attempt, "job activated");
        }
        Ok(jobs)
    }

    /// Look up a job.
    pub async fn job(&self, key: &JobKey) -> Result<Job, EngineError> {
        self.store()
            .get_job(key)
            .await?
            .ok_or_else(|| EngineError::UnknownJob(key.clone()))
    }

    /// Apply an executor's result.
    ///
    /// Applying the same key twice is a no-op the second time.
    pub async fn complete_job(
        &self,
        key: &JobKey,
        completion: JobCompletion,
    ) -> Result<CompletionOutcome, EngineError> {
        let instance = self.job(key).await?.instance;
        let _guard = self.lock(instance).await;
        if self.store().get_completion(key).await?.is_some() {
            tracing::debug!(job_key = %key, "duplicate completion");
            return Ok(CompletionOutcome::Duplicate);
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            // Reloaded per attempt: a lost commit race may have moved the job.
            let job = self.job(key).await?;
            let applied = self
                .try_commit(instance, |vm, batch| apply_completion(vm, batch, &job, &completion))
                .await?;
            if let Some(outcome) = applied {
                return Ok(outcome);
            }
            self.conflicted(instance, attempt)?;
        }
    }

    /// Handle an executor's failure report.
    pub async fn fail_job(
        &self,
        key: &JobKey,
        failure: JobFailure,
    ) -> Result<FailureOutcome, EngineError> {
        let instance = self.job(key).await?.instance;
        let _guard = self.lock(instance).await;
        if self.store().get_completion(key).await?.is_some() {
            return Ok(FailureOutcome::Ignored);
        }
        let retry = self.config().retry.clone();
        let ttl = self.config().dead_letter_ttl();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let job = self.job(key).await?;
            let applied = self
                .try_commit(instance, |vm, batch| {
                    apply_failure(vm, batch, &job, &failure, &retry, ttl)
                })
                .await?;
            if let Some(outcome) = applied {
                return Ok(outcome);
            }
            self.conflicted(instance, attempt)?;
        }
    }
}

/// Record a completion and, when the job is still awaited, resume its fiber.
fn apply_completion(
    vm: &Vm<'_>,
    batch: &mut Batch,
    job: &Job,
    completion: &JobCompletion,
) -> Result<CompletionOutcome, EngineError> {
    let key = &job.key;
    let live = job.status.is_open() && parked_on(batch, job);

    batch.record_completion(CompletionRecord {
        job_key: key.clone(),
        completion: completion.clone(),
        applied: live,
        recorded_at: batch.now(),
    });
    if !live {
        tracing::debug!(job_key = %key, status = %job.status, "completion ignored");
        batch.emit(RuntimeEvent::CompletionIgnored {
            job_key: key.clone(),
        });
        return Ok(CompletionOutcome::Ignored);
    }

    validate_job_transition(job.status, JobStatus::Completed)?;
    let mut done = job.clone();
    done.status = JobStatus::Completed;
    batch.update_job(done);
    batch.emit(RuntimeEvent::JobCompleted {
        job_key: key.clone(),
    });
    vm.resume_job(batch, job.fiber, completion)?;
    Ok(CompletionOutcome::Applied)
}

/// Retry, route or dead-letter a failed job that is still awaited.
fn apply_failure(
    vm: &Vm<'_>,
    batch: &mut Batch,
    job: &Job,
    failure: &JobFailure,
    retry: &RetryPolicy,
    ttl: Duration,
) -> Result<FailureOutcome, EngineError> {
    let key = &job.key;
    if !job.status.is_open() || !parked_on(batch, job) {
        tracing::debug!(job_key = %key, status = %job.status, "failure ignored");
        return Ok(FailureOutcome::Ignored);
    }

    match &failure.kind {
        FailureKind::Transient if job.retries_remaining > 0 => {
            let delay = retry.delay_for_attempt(job.attempt.saturating_sub(1));
            let not_before = after(batch.now(), delay);
            validate_job_transition(job.status, JobStatus::Pending)?;
            let mut next = job.clone();
            next.schedule_retry(not_before, failure.message.clone());
            tracing::warn!(
                job_key = %key,
                attempt = next.attempt,
                retries_remaining = next.retries_remaining,
                %not_before,
                error = %failure.message,
                "job failed, retry scheduled"
            );
            let attempt = next.attempt;
            batch.update_job(next);
            batch.emit(RuntimeEvent::JobRetryScheduled {
                job_key: key.clone(),
                attempt,
                not_before,
            });
            Ok(FailureOutcome::RetryScheduled {
                attempt,
                not_before,
            })
        }
        FailureKind::Transient => {
            let incident =
                dead_letter(vm, batch, job, ErrorClass::RetryExhausted, &failure.message, ttl)?;
            Ok(FailureOutcome::DeadLettered { incident })
        }
        FailureKind::Business { code } => {
            let route = batch
                .fiber(job.fiber)
                .and_then(|fiber| vm.error_route(fiber, code));
            let Some(target) = route else {
                let class = ErrorClass::UnroutedBusinessError { code: code.clone() };
                let incident = dead_letter(vm, batch, job, class, &failure.message, ttl)?;
                return Ok(FailureOutcome::DeadLettered { incident });
            };

            validate_job_transition(job.status, JobStatus::Completed)?;
            let mut done = job.clone();
            done.status = JobStatus::Completed;
            done.last_error = Some(failure.message.clone());
            batch.update_job(done);
            batch.emit(RuntimeEvent::JobErrorRouted {
                job_key: key.clone(),
                code: code.clone(),
            });
            vm.route_error(batch, job.fiber, target)?;
            tracing::info!(job_key = %key, %code, route = target, "business error routed");
            Ok(FailureOutcome::Routed { code: code.clone() })
        }
    }
}

/// Whether the job's fiber is still parked on exactly this job.
pub(crate) fn parked_on(batch: &Batch, job: &Job) -> bool {
    batch
        .fiber(job.fiber)
        .is_some_and(|f| matches!(&f.wait, WaitState::Job { job_key } if *job_key == job.key))
}

/// Halt the job's fiber on a new incident and park the job in the
/// dead-letter queue.
fn dead_letter(
    vm: &Vm<'_>,
    batch: &mut Batch,
    job: &Job,
    class: ErrorClass,
    message: &str,
    ttl: Duration,
) -> Result<IncidentId, EngineError> {
    validate_job_transition(job.status, JobStatus::DeadLettered)?;
    let now = batch.now();
    let pc = batch.fiber(job.fiber).map_or(0, |f| f.pc);
    let incident = Incident::raise(job.instance, job.fiber, pc, class, message, now)
        .with_node(Some(job.node.clone()))
        .with_job(job.key.clone(), job.attempt);
    let id = incident.id;
    vm.halt(batch, incident);

    let mut dead = job.clone();
    dead.status = JobStatus::DeadLettered;
    dead.claimed_at = None;
    dead.claimed_by = None;
    dead.last_error = Some(message.to_owned());
    batch.put_dead_letter(DeadLetter {
        task_type: dead.task_type.clone(),
        job_key: dead.key.clone(),
        job: dead.clone(),
        reason: message.to_owned(),
        incident: Some(id),
        dead_lettered_at: now,
        expires_at: after(now, ttl),
    });
    batch.update_job(dead);
    batch.emit(RuntimeEvent::JobDeadLettered {
        job_key: job.key.clone(),
    });
    tracing::warn!(job_key = %job.key, incident = %id, attempts = job.attempt, "job dead-lettered");
    Ok(id)
}
