//! Logging configuration and subscriber bootstrap.

use serde::{Deserialize, Serialize};

pub mod logging;

pub use logging::init_logging;

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very verbose, per packet and per record
    Trace,
    /// Diagnostic details
    Debug,
    /// Lifecycle events
    #[default]
    Info,
    /// Recoverable problems
    Warn,
    /// Failures
    Error,
}

impl LogLevel {
    /// Filter directive understood by `EnvFilter`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON structured format
    Json,
}

/// Structured logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level; `RUST_LOG` overrides it when set
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Include the event target
    pub with_target: bool,
    /// Include the emitting thread id
    pub with_thread_ids: bool,
    /// Include the emitting thread name
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            with_target: true,
            with_thread_ids: false,
            with_thread_names: true,
        }
    }
}
