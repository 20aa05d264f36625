//! njordr telemetry - observability for the broker and services
//!
//! - Structured logging via `tracing-subscriber`
//! - Prometheus metrics (feature `metrics`, on by default)

#[cfg(feature = "metrics")]
pub mod metrics;

pub mod logging;

#[cfg(feature = "metrics")]
pub use metrics::NjordrMetrics;

pub use logging::{init_logging, init_test_logging};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
