//! Storage errors.

use thiserror::Error;
use weft_core::InstanceId;

/// Errors returned by a [`ProcessStore`](crate::ProcessStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored instance version differs from the transition's base.
    #[error("version conflict on instance {instance}: expected {expected:?}, found {found:?}")]
    Conflict {
        /// The instance.
        instance: InstanceId,
        /// Base version of the rejected transition.
        expected: Option<u64>,
        /// Version actually stored.
        found: Option<u64>,
    },

    /// A stored program failed to decode or verify.
    #[error("program: {0}")]
    Program(#[from] weft_bytecode::BytecodeError),

    /// A row failed to serialize or deserialize.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row is malformed.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        /// Table name.
        table: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// Invalid backend configuration.
    #[error("invalid store configuration: {0}")]
    Config(String),

    /// The database driver failed.
    #[cfg(feature = "postgres")]
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[cfg(feature = "postgres")]
    #[error("migration: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Whether retrying from a fresh read may succeed.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display_names_versions() {
        let err = StoreError::Conflict {
            instance: InstanceId::new(),
            expected: Some(2),
            found: Some(3),
        };
        assert!(err.is_conflict());
        assert!(err.to_string().contains("expected Some(2), found Some(3)"));
    }
}
