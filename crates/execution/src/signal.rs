//! External wake-up signals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use weft_core::{FiberId, InstanceId, Value};

/// What kind of wait a signal answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeKind {
    /// A timer, race timer arm, or boundary watchdog came due.
    Timer,
    /// A message arrived.
    Message {
        /// Message name.
        name: String,
        /// Correlation value.
        correlation: String,
    },
    /// A human task was completed.
    Human {
        /// Task name.
        task: String,
    },
}

/// A request to wake one parked fiber.
///
/// The epoch must equal the fiber's current loop epoch; otherwise the
/// signal is stale and is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeSignal {
    /// Target instance.
    pub instance: InstanceId,
    /// Target fiber.
    pub fiber: FiberId,
    /// Epoch the sender observed.
    pub epoch: u64,
    /// What fired.
    pub kind: WakeKind,
    /// Flags to merge into the instance on wake-up.
    #[serde(default)]
    pub flags: BTreeMap<String, Value>,
    /// Replacement payload, if any.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl WakeSignal {
    /// A timer signal.
    #[must_use]
    pub fn timer(instance: InstanceId, fiber: FiberId, epoch: u64) -> Self {
        Self {
            instance,
            fiber,
            epoch,
            kind: WakeKind::Timer,
            flags: BTreeMap::new(),
            payload: None,
        }
    }

    /// A message signal.
    #[must_use]
    pub fn message(
        instance: InstanceId,
        fiber: FiberId,
        epoch: u64,
        name: impl Into<String>,
        correlation: impl Into<String>,
    ) -> Self {
        Self {
            kind: WakeKind::Message {
                name: name.into(),
                correlation: correlation.into(),
            },
            ..Self::timer(instance, fiber, epoch)
        }
    }

    /// A human task signal.
    #[must_use]
    pub fn human(instance: InstanceId, fiber: FiberId, epoch: u64, task: impl Into<String>) -> Self {
        Self {
            kind: WakeKind::Human { task: task.into() },
            ..Self::timer(instance, fiber, epoch)
        }
    }

    /// Attach flags to merge on wake-up.
    #[must_use]
    pub fn with_flags(mut self, flags: BTreeMap<String, Value>) -> Self {
        self.flags = flags;
        self
    }

    /// Attach a replacement payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
