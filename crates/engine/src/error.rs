//! Engine error types.

use weft_bytecode::ProgramHash;
use weft_core::{IncidentId, InstanceId};
use weft_execution::{InstanceStatus, JobKey};

/// Errors from the engine layer.
///
/// Faults inside a running process never show up here; they become
/// incidents on the faulting fiber. These are caller mistakes and
/// infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No instance with this id.
    #[error("instance not found: {0}")]
    UnknownInstance(InstanceId),

    /// No program with this hash in the cache or the store.
    #[error("program not found: {0}")]
    UnknownProgram(ProgramHash),

    /// No job with this key.
    #[error("job not found: {0}")]
    UnknownJob(JobKey),

    /// No incident with this id.
    #[error("incident not found: {0}")]
    UnknownIncident(IncidentId),

    /// No dead-letter entry under this key.
    #[error("dead letter not found: {task_type}/{job_key}")]
    UnknownDeadLetter {
        /// Logical name.
        task_type: String,
        /// Correlation key.
        job_key: JobKey,
    },

    /// The operation needs a running instance.
    #[error("instance {instance} is {status}")]
    NotRunning {
        /// The instance.
        instance: InstanceId,
        /// Its final status.
        status: InstanceStatus,
    },

    /// The incident was already resolved.
    #[error("incident {0} is already resolved")]
    AlreadyResolved(IncidentId),

    /// The dead-lettered job's fiber is no longer halted on it.
    #[error("fiber of dead-lettered job {0} is gone")]
    OrphanedDeadLetter(JobKey),

    /// Commits kept losing the version race.
    #[error("instance {instance} still conflicting after {attempts} attempts")]
    Contention {
        /// The instance.
        instance: InstanceId,
        /// Attempts made.
        attempts: u32,
    },

    /// Compilation failed.
    #[error(transparent)]
    Compile(#[from] weft_compiler::CompileError),

    /// Program integrity error.
    #[error(transparent)]
    Bytecode(#[from] weft_bytecode::BytecodeError),

    /// Interpreter error outside any fiber.
    #[error(transparent)]
    Vm(#[from] weft_vm::VmError),

    /// Execution model rule violated.
    #[error(transparent)]
    Execution(#[from] weft_execution::ExecutionError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] weft_storage::StoreError),

    /// Payload could not be digested.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_job_display() {
        let err = EngineError::UnknownJob(JobKey::from_raw("i:t1:0:abc"));
        assert_eq!(err.to_string(), "job not found: i:t1:0:abc");
    }

    #[test]
    fn not_running_display() {
        let instance = InstanceId::new();
        let err = EngineError::NotRunning {
            instance,
            status: InstanceStatus::Cancelled,
        };
        assert!(err.to_string().ends_with("is cancelled"));
    }

    #[test]
    fn dead_letter_display() {
        let err = EngineError::UnknownDeadLetter {
            task_type: "charge".into(),
            job_key: JobKey::from_raw("k"),
        };
        assert_eq!(err.to_string(), "dead letter not found: charge/k");
    }
}
