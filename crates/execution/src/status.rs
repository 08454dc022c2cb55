//! Instance-level status tracking.

use serde::{Deserialize, Serialize};

/// The overall status of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// At least one fiber is alive.
    Running,
    /// Every fiber reached an End node.
    Completed,
    /// A terminate End node finished the instance.
    Terminated,
    /// Cancelled by an operator.
    Cancelled,
}

impl InstanceStatus {
    /// Returns `true` if the instance has reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns `true` if the instance finished through its own End nodes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    /// The snake_case name, as stored.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Terminated.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
    }

    #[test]
    fn success_states() {
        assert!(InstanceStatus::Completed.is_success());
        assert!(InstanceStatus::Terminated.is_success());
        assert!(!InstanceStatus::Cancelled.is_success());
    }

    #[test]
    fn display_and_parse_agree() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::Terminated,
            InstanceStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }
}
