//! Configuration types
//!
//! - `Config`: filter, format, writer and display switches
//! - `presets`: environment parsing and the development/production setups

mod presets;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LogError;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `EnvFilter` directive, e.g. `info` or `weft_vm=debug,info`
    pub level: String,

    /// Output format
    pub format: Format,

    /// Where output goes
    pub writer: Writer,

    /// Display switches
    pub display: DisplayConfig,

    /// Wrap the filter so it can be swapped at runtime
    pub reloadable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Compact,
            writer: Writer::Stderr,
            display: DisplayConfig::default(),
            reloadable: false,
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Multi-line, human-readable
    Pretty,
    /// Single-line
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for Format {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(LogError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// Output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Writer {
    /// Standard error
    Stderr,
    /// Standard output
    Stdout,
    /// The test harness capture
    Test,
}

/// Display switches applied to the fmt layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// ANSI colors
    pub colors: bool,
    /// Event target (module path)
    pub target: bool,
    /// File and line
    pub source: bool,
    /// Thread ids
    pub thread_ids: bool,
    /// Thread names
    pub thread_names: bool,
    /// JSON only: put event fields at the top level
    pub flatten: bool,
    /// JSON only: include the full span list
    pub span_list: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            colors: true,
            target: true,
            source: false,
            thread_ids: false,
            thread_names: false,
            flatten: false,
            span_list: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("pretty", Format::Pretty)]
    #[case("JSON", Format::Json)]
    #[case(" compact ", Format::Compact)]
    fn format_parses_case_insensitively(#[case] raw: &str, #[case] expected: Format) {
        assert_eq!(raw.parse::<Format>().unwrap(), expected);
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!("logfmt".parse::<Format>().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"format":"json"}"#).unwrap();
        assert_eq!(cfg.format, Format::Json);
        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.writer, Writer::Stderr);
    }
}
