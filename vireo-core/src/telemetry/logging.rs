//! Global `tracing` subscriber installation.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};
use crate::telemetry::{LogFormat, LoggingConfig};

/// Install the process wide subscriber described by `config`.
///
/// Returns `Ok(false)` if a subscriber was already installed, which lets
/// tests and embedding applications call this unconditionally.
///
/// # Errors
/// Returns a configuration error if `RUST_LOG` holds an invalid directive.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .map_err(|e| Error::configuration(format!("invalid {}: {e}", EnvFilter::DEFAULT_ENV)))?,
        _ => EnvFilter::new(config.level.as_str()),
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_thread_names(config.with_thread_names);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    };

    if installed {
        tracing::debug!(level = %config.level, format = ?config.format, "Logging initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_not_an_error() {
        let config = LoggingConfig::default();
        let first = init_logging(&config).unwrap();
        let second = init_logging(&config).unwrap();
        assert!(!second || !first);
        assert!(!second);
    }
}
