//! Configuration presets for common scenarios

use super::{Config, DisplayConfig, Format, Writer};

impl Config {
    /// Create configuration from environment variables.
    ///
    /// `WEFT_LOG` takes precedence over `RUST_LOG`; `WEFT_LOG_FORMAT` picks
    /// the format. Unknown formats keep the default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(level) = lookup("WEFT_LOG").or_else(|| lookup("RUST_LOG")) {
            config.level = level;
        }

        if let Some(Ok(format)) = lookup("WEFT_LOG_FORMAT").map(|f| f.parse::<Format>()) {
            config.format = format;
        }

        if config.format == Format::Json {
            config.display.colors = false;
        }
        config
    }

    /// Development configuration (pretty, debug level)
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Pretty,
            display: DisplayConfig {
                colors: true,
                source: true,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production configuration (JSON, info level)
    #[must_use]
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            display: DisplayConfig {
                colors: false,
                source: false,
                flatten: true,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Test configuration (captured by the harness)
    #[must_use]
    pub fn test() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Compact,
            writer: Writer::Test,
            display: DisplayConfig {
                colors: false,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn weft_log_wins_over_rust_log() {
        let cfg = Config::from_lookup(lookup(&[("WEFT_LOG", "debug"), ("RUST_LOG", "warn")]));
        assert_eq!(cfg.level, "debug");
    }

    #[test]
    fn rust_log_is_the_fallback() {
        let cfg = Config::from_lookup(lookup(&[("RUST_LOG", "weft_vm=trace")]));
        assert_eq!(cfg.level, "weft_vm=trace");
    }

    #[test]
    fn json_format_disables_colors() {
        let cfg = Config::from_lookup(lookup(&[("WEFT_LOG_FORMAT", "json")]));
        assert_eq!(cfg.format, Format::Json);
        assert!(!cfg.display.colors);
    }

    #[test]
    fn unknown_format_keeps_default() {
        let cfg = Config::from_lookup(lookup(&[("WEFT_LOG_FORMAT", "xml")]));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn presets_differ_in_format() {
        assert_eq!(Config::development().format, Format::Pretty);
        assert_eq!(Config::production().format, Format::Json);
        assert_eq!(Config::test().writer, Writer::Test);
    }
}
