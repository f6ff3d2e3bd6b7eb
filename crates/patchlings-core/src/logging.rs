//! Structured logging for patchlings
//!
//! Uses `tracing` with configurable output formats. The engine itself only
//! emits events through the `tracing` macros; collaborators (CLI, servers,
//! adapters) call [`init_logging`] once at startup.
//!
//! # Safety
//!
//! **Never log raw event attributes.** Attribute values may contain secrets
//! until the redactor has run; log only counts, ids, and hashed identifiers.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for CI and ops
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Overridable via the RUST_LOG environment variable.
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to a log file; when set, lines go there instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(String),
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging once; later calls fail with `AlreadyInitialized`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = env_filter(&config.level);

    let outcome = match (&config.file, config.format) {
        (Some(path), format) => {
            let file = Arc::new(std::fs::File::create(path)?);
            let builder = fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false);
            match format {
                LogFormat::Json => builder.json().finish().try_init(),
                LogFormat::Pretty => builder.finish().try_init(),
            }
        }
        (None, LogFormat::Json) => fmt().with_env_filter(filter).json().finish().try_init(),
        (None, LogFormat::Pretty) => fmt().with_env_filter(filter).finish().try_init(),
    };
    outcome.map_err(|err| LogError::SetSubscriber(err.to_string()))?;

    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_info_pretty() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn filter_falls_back_on_bad_level() {
        // Must not panic on nonsense input.
        let _ = env_filter("definitely!!not@@a##filter");
    }

    #[test]
    fn log_format_serde_roundtrip() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");
        let back: LogFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LogFormat::Json);
    }
}
