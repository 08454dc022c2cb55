//! Logger setup errors.

/// Result alias for logger operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors raised while configuring the logger.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The filter directive could not be parsed.
    #[error("invalid filter '{filter}': {reason}")]
    Filter {
        /// The rejected directive.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// A configuration value was rejected.
    #[error("configuration error: {0}")]
    Config(String),

    /// A global subscriber is already installed.
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}
