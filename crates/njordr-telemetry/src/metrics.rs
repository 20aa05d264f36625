//! Prometheus metrics for njordr
//!
//! - Item counters (submitted, dispatched, completed, failed, requeued, abandoned)
//! - Pending depth and worker health gauges
//! - Dispatch-to-report latency histogram

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::{TelemetryError, TelemetryResult};

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============ Item Counters ============

    pub static ref ITEMS_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("njordr_items_submitted_total", "Total number of items admitted"),
        &["job"]
    ).expect("metric can be created");

    pub static ref ITEMS_REJECTED: IntCounter = IntCounter::new(
        "njordr_items_rejected_total", "Submissions refused because the queue was full"
    ).expect("metric can be created");

    pub static ref ITEMS_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("njordr_items_dispatched_total", "Total number of dispatches"),
        &["job"]
    ).expect("metric can be created");

    pub static ref ITEMS_COMPLETED: IntCounterVec = IntCounterVec::new(
        Opts::new("njordr_items_completed_total", "Total number of items completed"),
        &["job"]
    ).expect("metric can be created");

    pub static ref ITEMS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("njordr_items_failed_total", "Total number of items that exhausted their attempts"),
        &["job"]
    ).expect("metric can be created");

    /// Requeues, labelled by reason (`failure` or `worker_lost`)
    pub static ref ITEMS_REQUEUED: IntCounterVec = IntCounterVec::new(
        Opts::new("njordr_items_requeued_total", "Total number of requeues"),
        &["reason"]
    ).expect("metric can be created");

    pub static ref ITEMS_ABANDONED: IntCounter = IntCounter::new(
        "njordr_items_abandoned_total", "Total number of items abandoned by an operator"
    ).expect("metric can be created");

    pub static ref REPORTS_DISCARDED: IntCounter = IntCounter::new(
        "njordr_reports_discarded_total", "Stale or duplicate reports ignored"
    ).expect("metric can be created");

    // ============ Gauges ============

    pub static ref PENDING_DEPTH: IntGauge = IntGauge::new(
        "njordr_pending_depth", "Items waiting for a worker"
    ).expect("metric can be created");

    pub static ref WORKERS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("njordr_workers", "Registered workers by health"),
        &["health"]
    ).expect("metric can be created");

    // ============ Latency ============

    pub static ref ITEM_EXECUTION_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("njordr_item_execution_seconds", "Time from dispatch to report")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
    ).expect("metric can be created");
}

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

/// njordr metrics interface
#[derive(Debug, Clone, Copy)]
pub struct NjordrMetrics;

impl NjordrMetrics {
    /// Register all metrics with the registry; later calls are no-ops
    pub fn init() -> TelemetryResult<Self> {
        REGISTERED
            .get_or_init(|| Self::register_metrics().map_err(|e| e.to_string()))
            .clone()
            .map_err(TelemetryError::Metrics)?;
        Ok(Self)
    }

    fn register_metrics() -> prometheus::Result<()> {
        REGISTRY.register(Box::new(ITEMS_SUBMITTED.clone()))?;
        REGISTRY.register(Box::new(ITEMS_REJECTED.clone()))?;
        REGISTRY.register(Box::new(ITEMS_DISPATCHED.clone()))?;
        REGISTRY.register(Box::new(ITEMS_COMPLETED.clone()))?;
        REGISTRY.register(Box::new(ITEMS_FAILED.clone()))?;
        REGISTRY.register(Box::new(ITEMS_REQUEUED.clone()))?;
        REGISTRY.register(Box::new(ITEMS_ABANDONED.clone()))?;
        REGISTRY.register(Box::new(REPORTS_DISCARDED.clone()))?;
        REGISTRY.register(Box::new(PENDING_DEPTH.clone()))?;
        REGISTRY.register(Box::new(WORKERS.clone()))?;
        REGISTRY.register(Box::new(ITEM_EXECUTION_TIME.clone()))?;
        Ok(())
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }

    pub fn item_submitted(job: &str) {
        ITEMS_SUBMITTED.with_label_values(&[job]).inc();
    }

    pub fn item_rejected() {
        ITEMS_REJECTED.inc();
    }

    pub fn item_dispatched(job: &str) {
        ITEMS_DISPATCHED.with_label_values(&[job]).inc();
    }

    pub fn item_completed(job: &str) {
        ITEMS_COMPLETED.with_label_values(&[job]).inc();
    }

    pub fn item_failed(job: &str) {
        ITEMS_FAILED.with_label_values(&[job]).inc();
    }

    pub fn item_requeued(reason: &str) {
        ITEMS_REQUEUED.with_label_values(&[reason]).inc();
    }

    pub fn item_abandoned() {
        ITEMS_ABANDONED.inc();
    }

    pub fn report_discarded() {
        REPORTS_DISCARDED.inc();
    }

    pub fn set_pending_depth(depth: usize) {
        PENDING_DEPTH.set(depth as i64);
    }

    pub fn set_workers(healthy: usize, suspected: usize) {
        WORKERS.with_label_values(&["healthy"]).set(healthy as i64);
        WORKERS.with_label_values(&["suspected"]).set(suspected as i64);
    }

    pub fn record_execution_time(duration_secs: f64) {
        ITEM_EXECUTION_TIME.observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let metrics = NjordrMetrics::init().unwrap();
        assert!(NjordrMetrics::init().is_ok());

        NjordrMetrics::item_submitted("echo");
        NjordrMetrics::set_pending_depth(3);

        let text = metrics.gather().unwrap();
        assert!(text.contains("njordr_items_submitted_total"));
        assert!(text.contains("njordr_pending_depth 3"));
    }
}
