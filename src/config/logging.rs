//! Logging configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log severity level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl LoggingConfig {
    /// Level after applying `-v` flags: one raises to debug, two or more to
    /// trace. Never lowers the configured level.
    pub fn effective_level(&self, verbose: u8) -> LogLevel {
        let requested = match verbose {
            0 => self.level,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        };
        requested.max(self.level)
    }

    /// Default `EnvFilter` directive for the server
    pub fn filter_directive(&self, verbose: u8) -> String {
        format!("lindex={}", self.effective_level(verbose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_level() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.effective_level(0), LogLevel::Info);
        assert_eq!(cfg.effective_level(1), LogLevel::Debug);
        assert_eq!(cfg.effective_level(5), LogLevel::Trace);
        assert_eq!(cfg.filter_directive(1), "lindex=debug");
    }

    #[test]
    fn verbosity_never_lowers_configured_level() {
        let cfg = LoggingConfig {
            format: LogFormat::Json,
            level: LogLevel::Trace,
        };
        assert_eq!(cfg.effective_level(1), LogLevel::Trace);
    }

    #[test]
    fn parses_lowercase_names() {
        let cfg: LoggingConfig = toml::from_str("format = \"json\"\nlevel = \"warn\"").unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, LogLevel::Warn);
    }
}
