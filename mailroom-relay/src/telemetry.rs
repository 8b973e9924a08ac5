//! Logging setup.
//!
//! `RUST_LOG` takes precedence over `logging.level`.

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter {directive:?}: {reason}")]
    Filter {
        /// The directive that failed.
        directive: String,
        /// Parser message.
        reason: String,
    },
    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Build the filter: `RUST_LOG` if set, else the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| TelemetryError::Filter {
            directive: config.level.clone(),
            reason: e.to_string(),
        })
}

/// Install the global subscriber, pretty or JSON per `config.format`.
pub fn init(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_builds_filter() {
        let config = LoggingConfig {
            level: "mailroom_relay=debug,info".to_string(),
            format: "pretty".to_string(),
        };
        assert!(env_filter(&config).is_ok());
    }

    #[test]
    fn second_init_reports_error() {
        let config = LoggingConfig::default();
        let _ = init(&config);
        assert!(matches!(init(&config), Err(TelemetryError::Init(_))));
    }
}
