//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber. `RUST_LOG` wins over the
//! configured level when set; the format is plain text or JSON with span context.

use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, RuntimeConfig};
use crate::core::error::{GatewayError, GatewayResult};

/// Build the filter from `RUST_LOG`, falling back to the configured directive
pub fn env_filter(config: &RuntimeConfig) -> GatewayResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| GatewayError::config(format!("Invalid log level `{}`: {}", config.log_level, e))),
    }
}

/// Install the global subscriber
///
/// A second call keeps the first subscriber and logs a warning.
pub fn init_logging(config: &RuntimeConfig) -> GatewayResult<()> {
    let env_filter = env_filter(config)?;

    let result = match config.log_format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_directive() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = RuntimeConfig {
            log_level: "resource_gateway=loudest".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(env_filter(&config).is_err());
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = RuntimeConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }
}
