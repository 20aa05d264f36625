//! Structured logging for njordr
//!
//! Builds the global subscriber from [`LoggingConfig`]: an `EnvFilter`
//! plus a pretty, compact or JSON formatter with UTC timestamps.

use njordr_core::{LogFormat, LoggingConfig};
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{TelemetryError, TelemetryResult};

/// Build the filter: explicit filter string, then `RUST_LOG`, then the level
fn build_filter(config: &LoggingConfig) -> TelemetryResult<EnvFilter> {
    if let Some(filter_str) = &config.env_filter {
        return EnvFilter::try_new(filter_str).map_err(|e| TelemetryError::Logging(e.to_string()));
    }

    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| TelemetryError::Logging(e.to_string())),
    }
}

/// Initialize logging with configuration
pub fn init_logging(config: &LoggingConfig) -> TelemetryResult<()> {
    let filter = build_filter(config)?;

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_timer(UtcTime::rfc_3339())
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_timer(UtcTime::rfc_3339())
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_timer(UtcTime::rfc_3339())
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(config.include_target),
            )
            .try_init(),
    };
    result.map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        "Logging initialized"
    );

    Ok(())
}

/// Test-writer subscriber; safe to call from every test
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("njordr_broker=debug,njordr_service=debug")),
        )
        .try_init();
}
