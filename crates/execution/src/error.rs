//! Execution error types.

use thiserror::Error;

/// Errors raised by the execution model's own rules.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A state transition is not valid for the current status.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Attempted target status.
        to: String,
    },

    /// An arrival would push a barrier past its expected count.
    #[error("join {join} over-arrived: {arrived} of {expected}")]
    JoinOverflow {
        /// The join node.
        join: String,
        /// Arrivals recorded so far.
        arrived: u32,
        /// Expected arrivals.
        expected: u32,
    },

    /// A serialization or deserialization error.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
