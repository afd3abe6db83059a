// src/observability/mod.rs
//! Logging and metrics export
//!
//! Both are process-global and installed once from `main`.

use crate::utils::config::{LogFormat, LoggingConfig};
use crate::utils::errors::{PipelineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Content type of the Prometheus text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| PipelineError::ConfigError(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_ansi(false),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| PipelineError::ConfigError(format!("Tracing already initialized: {}", e)))
}

/// Install the global Prometheus recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PipelineError::ConfigError(format!("Metrics recorder: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_strings_are_valid_filters() {
        for level in ["error", "warn", "info", "debug", "trace", "audit_fanout=debug,info"] {
            assert!(EnvFilter::try_new(level).is_ok(), "{} should parse", level);
        }
    }

    #[test]
    fn test_content_type() {
        assert!(PROMETHEUS_CONTENT_TYPE.starts_with("text/plain"));
    }
}
