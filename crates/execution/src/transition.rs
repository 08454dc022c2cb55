//! Status state machines for instances and jobs.

use crate::error::ExecutionError;
use crate::job::JobStatus;
use crate::status::InstanceStatus;

/// Returns `true` if an instance may move from `from` to `to`.
#[must_use]
pub fn can_transition_instance(from: InstanceStatus, to: InstanceStatus) -> bool {
    matches!(
        (from, to),
        (InstanceStatus::Running, InstanceStatus::Completed)
            | (InstanceStatus::Running, InstanceStatus::Terminated)
            | (InstanceStatus::Running, InstanceStatus::Cancelled)
    )
}

/// Validate an instance transition.
pub fn validate_instance_transition(
    from: InstanceStatus,
    to: InstanceStatus,
) -> Result<(), ExecutionError> {
    if can_transition_instance(from, to) {
        Ok(())
    } else {
        Err(ExecutionError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Returns `true` if a job may move from `from` to `to`.
///
/// `Pending -> Pending` and `Claimed -> Claimed` cover retries and
/// lease re-claims.
#[must_use]
pub fn can_transition_job(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (
            JobStatus::Pending,
            JobStatus::Pending
                | JobStatus::Claimed
                | JobStatus::Completed
                | JobStatus::DeadLettered
                | JobStatus::Cancelled
        ) | (
            JobStatus::Claimed,
            JobStatus::Pending
                | JobStatus::Claimed
                | JobStatus::Completed
                | JobStatus::DeadLettered
                | JobStatus::Cancelled
        ) | (
            JobStatus::DeadLettered,
            JobStatus::Pending | JobStatus::Cancelled
        )
    )
}

/// Validate a job transition.
pub fn validate_job_transition(from: JobStatus, to: JobStatus) -> Result<(), ExecutionError> {
    if can_transition_job(from, to) {
        Ok(())
    } else {
        Err(ExecutionError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(InstanceStatus::Running, InstanceStatus::Completed, true)]
    #[case(InstanceStatus::Running, InstanceStatus::Terminated, true)]
    #[case(InstanceStatus::Running, InstanceStatus::Cancelled, true)]
    #[case(InstanceStatus::Completed, InstanceStatus::Running, false)]
    #[case(InstanceStatus::Cancelled, InstanceStatus::Completed, false)]
    #[case(InstanceStatus::Running, InstanceStatus::Running, false)]
    fn instance_transitions(
        #[case] from: InstanceStatus,
        #[case] to: InstanceStatus,
        #[case] ok: bool,
    ) {
        assert_eq!(can_transition_instance(from, to), ok);
    }

    #[rstest]
    #[case(JobStatus::Pending, JobStatus::Claimed, true)]
    #[case(JobStatus::Claimed, JobStatus::Pending, true)]
    #[case(JobStatus::Claimed, JobStatus::Completed, true)]
    #[case(JobStatus::DeadLettered, JobStatus::Pending, true)]
    #[case(JobStatus::Completed, JobStatus::Pending, false)]
    #[case(JobStatus::Cancelled, JobStatus::Claimed, false)]
    #[case(JobStatus::DeadLettered, JobStatus::Completed, false)]
    fn job_transitions(#[case] from: JobStatus, #[case] to: JobStatus, #[case] ok: bool) {
        assert_eq!(can_transition_job(from, to), ok);
    }

    #[test]
    fn validate_reports_both_ends() {
        let err = validate_instance_transition(InstanceStatus::Completed, InstanceStatus::Running)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid transition from completed to running");
        assert!(validate_job_transition(JobStatus::Pending, JobStatus::Claimed).is_ok());
    }
}
