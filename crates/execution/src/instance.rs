//! Process instance records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_bytecode::ProgramHash;
use weft_core::{InstanceId, NodeKey, Value, json_digest};

use crate::status::InstanceStatus;

/// One execution of a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique id.
    pub id: InstanceId,
    /// The pinned program.
    pub program: ProgramHash,
    /// Opaque domain payload, replaced by job completions that carry one.
    pub payload: serde_json::Value,
    /// Digest of `payload`, kept for audit.
    pub payload_hash: String,
    /// Flags read by gateway conditions.
    pub flags: BTreeMap<String, Value>,
    /// Loop counters.
    pub counters: BTreeMap<String, i64>,
    /// Outstanding join expectations: join node to expected arrivals of
    /// its current activation.
    pub join_expected: BTreeMap<NodeKey, u32>,
    /// External correlation id.
    pub correlation_id: String,
    /// Spawn sequence number handed to the next fiber.
    pub next_fiber_seq: u64,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Optimistic concurrency version; bumped by every commit.
    pub version: u64,
    /// When the instance was started.
    pub created_at: DateTime<Utc>,
    /// Last commit time.
    pub updated_at: DateTime<Utc>,
    /// When the instance reached a final status.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    /// Create a running instance at version 0.
    pub fn new(
        id: InstanceId,
        program: ProgramHash,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let payload_hash = json_digest(&payload)?;
        Ok(Self {
            id,
            program,
            payload,
            payload_hash,
            flags: BTreeMap::new(),
            counters: BTreeMap::new(),
            join_expected: BTreeMap::new(),
            correlation_id: correlation_id.into(),
            next_fiber_seq: 0,
            status: InstanceStatus::Running,
            version: 0,
            created_at: now,
            updated_at: now,
            ended_at: None,
        })
    }

    /// Replace the payload and refresh its digest.
    pub fn set_payload(&mut self, payload: serde_json::Value) -> Result<(), serde_json::Error> {
        self.payload_hash = json_digest(&payload)?;
        self.payload = payload;
        Ok(())
    }

    /// Merge flags, overwriting existing values.
    pub fn merge_flags(&mut self, flags: &BTreeMap<String, Value>) {
        for (k, v) in flags {
            self.flags.insert(k.clone(), v.clone());
        }
    }

    /// A flag's value, `Bool(false)` when unset.
    #[must_use]
    pub fn flag(&self, name: &str) -> Value {
        self.flags.get(name).cloned().unwrap_or_default()
    }

    /// A counter's value, `0` when unset.
    #[must_use]
    pub fn counter(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Take the next fiber sequence number.
    pub fn take_fiber_seq(&mut self) -> u64 {
        let seq = self.next_fiber_seq;
        self.next_fiber_seq += 1;
        seq
    }

    /// Whether the instance still accepts work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ProcessInstance {
        ProcessInstance::new(
            InstanceId::new(),
            ProgramHash::parse(&"0".repeat(64)).unwrap(),
            serde_json::json!({"order": 7}),
            "order-7",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn new_instance_is_running_at_version_zero() {
        let i = instance();
        assert!(i.is_running());
        assert_eq!(i.version, 0);
        assert_eq!(i.payload_hash.len(), 64);
    }

    #[test]
    fn unset_flags_and_counters_have_defaults() {
        let i = instance();
        assert_eq!(i.flag("missing"), Value::Bool(false));
        assert_eq!(i.counter("missing"), 0);
    }

    #[test]
    fn set_payload_refreshes_hash() {
        let mut i = instance();
        let before = i.payload_hash.clone();
        i.set_payload(serde_json::json!({"order": 8})).unwrap();
        assert_ne!(before, i.payload_hash);
    }

    #[test]
    fn merge_flags_overwrites() {
        let mut i = instance();
        i.flags.insert("x".into(), Value::Bool(true));
        i.merge_flags(&BTreeMap::from([("x".to_owned(), Value::Bool(false))]));
        assert_eq!(i.flag("x"), Value::Bool(false));
    }
}
