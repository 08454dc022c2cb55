#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft Log
//!
//! Subscriber setup shared by every weft binary and test suite. The other
//! crates only ever use `tracing` macros; this crate decides where the
//! output goes and how it looks.
//!
//! - [`Config`] with [`Config::from_env`], [`Config::development`] and
//!   [`Config::production`] presets
//! - [`LoggerBuilder`] installing a `tracing-subscriber` registry
//! - [`LoggerGuard`] holding the optional [`ReloadHandle`]
//! - [`init_test`] for test binaries

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard, ReloadHandle};
pub use config::{Config, DisplayConfig, Format, Writer};
pub use error::{LogError, LogResult};

/// Initialize with [`Config::from_env`].
pub fn init() -> LogResult<LoggerGuard> {
    init_with(Config::from_env())
}

/// Initialize with a custom configuration.
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Initialize for tests: output goes through the test harness capture.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test() -> LoggerGuard {
    if tracing::dispatcher::has_been_set() {
        return LoggerGuard::noop();
    }
    init_with(Config::test()).unwrap_or_else(|_| LoggerGuard::noop())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_test_tolerates_repeated_calls() {
        let _first = init_test();
        let _second = init_test();
        tracing::info!(marker = 1, "still logging");
        assert!(tracing::dispatcher::has_been_set());
    }
}
