//! Logger builder implementation
//!
//! - `format`: fmt layer construction macros
//! - `reload`: runtime filter reload

#[macro_use]
mod format;
mod reload;

pub use reload::ReloadHandle;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, Format, Writer};
use crate::error::{LogError, LogResult};

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Keeps the logger's runtime handles alive.
#[derive(Debug, Default)]
pub struct LoggerGuard {
    reload: Option<ReloadHandle>,
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Build and install the global subscriber.
    ///
    /// # Errors
    ///
    /// Returns error if the filter directive cannot be parsed or a global
    /// subscriber is already installed.
    pub fn build(self) -> LogResult<LoggerGuard> {
        let filter = EnvFilter::try_new(&self.config.level).map_err(|e| LogError::Filter {
            filter: self.config.level.clone(),
            reason: e.to_string(),
        })?;
        let (filter_layer, reload) =
            reload::create_filter_layer(filter, &self.config.level, self.config.reloadable);
        let display = &self.config.display;
        let writer = make_writer(self.config.writer);

        let installed = match self.config.format {
            Format::Pretty => Registry::default()
                .with(filter_layer)
                .with(create_fmt_layer!(pretty, display, writer))
                .try_init(),
            Format::Compact => Registry::default()
                .with(filter_layer)
                .with(create_fmt_layer!(compact, display, writer))
                .try_init(),
            Format::Json => Registry::default()
                .with(filter_layer)
                .with(create_json_layer!(display, writer))
                .try_init(),
        };
        installed.map_err(|_| LogError::AlreadyInitialized)?;

        tracing::debug!(
            level = %self.config.level,
            format = %self.config.format,
            "logger initialized"
        );
        Ok(LoggerGuard { reload })
    }
}

fn make_writer(writer: Writer) -> BoxMakeWriter {
    match writer {
        Writer::Stderr => BoxMakeWriter::new(std::io::stderr),
        Writer::Stdout => BoxMakeWriter::new(std::io::stdout),
        Writer::Test => BoxMakeWriter::new(tracing_subscriber::fmt::TestWriter::new),
    }
}

impl LoggerGuard {
    pub(crate) fn noop() -> Self {
        Self { reload: None }
    }

    /// The reload handle, present when the config asked for one.
    #[must_use]
    pub fn reload_handle(&self) -> Option<&ReloadHandle> {
        self.reload.as_ref()
    }
}
