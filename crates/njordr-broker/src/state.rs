//! Broker shared state

use njordr_core::{
    BrokerConfig, BrokerMessage, Error, ItemId, ItemStatus, Outcome, ReportDisposition, Result,
    WorkItem, WorkerHealth, WorkerId,
};
use njordr_telemetry::NjordrMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tracing::{debug, info, warn};

use crate::registry::{Registry, RegistryConfig, RegistryStats, SweepReport, WorkerInfo};

/// Outbound half of a worker connection
#[derive(Debug, Clone)]
pub struct WorkerChannel {
    /// Connection the worker registered on
    pub connection: u64,
    pub sender: mpsc::UnboundedSender<BrokerMessage>,
}

/// State shared by the transport server, the background loops and the admin API
pub struct BrokerState {
    pub config: BrokerConfig,

    registry: Mutex<Registry>,

    /// Worker id to its connection's writer
    channels: Mutex<HashMap<WorkerId, WorkerChannel>>,

    /// Wakes the dispatch loop
    dispatch_notify: Notify,

    metrics: Option<NjordrMetrics>,

    next_connection: AtomicU64,

    started_at: Instant,
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> Self {
        let metrics = match NjordrMetrics::init() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!(error = %e, "Metrics unavailable");
                None
            }
        };

        Self {
            registry: Mutex::new(Registry::new(RegistryConfig::from(&config))),
            channels: Mutex::new(HashMap::new()),
            dispatch_notify: Notify::new(),
            metrics,
            next_connection: AtomicU64::new(1),
            started_at: Instant::now(),
            config,
        }
    }

    /// Direct access to the registry
    pub async fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().await
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn metrics(&self) -> Option<NjordrMetrics> {
        self.metrics
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the dispatch loop to run
    pub fn notify_dispatch(&self) {
        self.dispatch_notify.notify_one();
    }

    pub async fn dispatch_requested(&self) {
        self.dispatch_notify.notified().await;
    }

    fn refresh_gauges(registry: &Registry) {
        let stats = registry.stats();
        NjordrMetrics::set_pending_depth(stats.pending);
        NjordrMetrics::set_workers(stats.workers_healthy, stats.workers_suspected);
    }

    // ============ Producer operations ============

    pub async fn submit(&self, job: String, payload: serde_json::Value) -> Result<ItemId> {
        let mut registry = self.registry.lock().await;
        let result = registry.submit(job.clone(), payload);
        match &result {
            Ok(item_id) => {
                debug!(item_id = %item_id, job = %job, "Item submitted");
                NjordrMetrics::item_submitted(&job);
                Self::refresh_gauges(&registry);
                drop(registry);
                self.notify_dispatch();
            }
            Err(e) => {
                warn!(job = %job, error = %e, "Submission refused");
                NjordrMetrics::item_rejected();
            }
        }
        result
    }

    pub async fn item(&self, item_id: &ItemId) -> Option<WorkItem> {
        self.registry.lock().await.item(item_id).cloned()
    }

    pub async fn abandon(&self, item_id: &ItemId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.abandon(item_id)?;
        info!(item_id = %item_id, "Item abandoned");
        NjordrMetrics::item_abandoned();
        Self::refresh_gauges(&registry);
        Ok(())
    }

    // ============ Worker operations ============

    /// Register a worker and bind it to a connection's writer
    pub async fn register(&self, worker_id: &WorkerId, channel: WorkerChannel) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.register(worker_id.clone(), Instant::now())?;
        self.channels.lock().await.insert(worker_id.clone(), channel);
        Self::refresh_gauges(&registry);
        drop(registry);

        info!(worker_id = %worker_id, "Worker registered");
        self.notify_dispatch();
        Ok(())
    }

    /// Fail with `UnknownWorker` unless `connection` holds the registration
    ///
    /// A connection whose worker was swept, and whose id another connection
    /// then registered, no longer speaks for that id.
    async fn check_owner(&self, worker_id: &WorkerId, connection: u64) -> Result<()> {
        match self.channels.lock().await.get(worker_id) {
            Some(channel) if channel.connection == connection => Ok(()),
            _ => Err(Error::UnknownWorker(worker_id.0.clone())),
        }
    }

    pub async fn heartbeat(&self, worker_id: &WorkerId, connection: u64) -> Result<()> {
        let mut registry = self.registry.lock().await;
        self.check_owner(worker_id, connection).await?;
        let was_suspected = registry
            .worker(worker_id)
            .is_some_and(|w| w.health == WorkerHealth::Suspected);
        registry.heartbeat(worker_id, Instant::now())?;
        if was_suspected {
            info!(worker_id = %worker_id, "Worker recovered");
            Self::refresh_gauges(&registry);
            drop(registry);
            self.notify_dispatch();
        }
        Ok(())
    }

    pub async fn report(
        &self,
        worker_id: &WorkerId,
        connection: u64,
        item_id: &ItemId,
        outcome: Outcome,
    ) -> Result<ReportDisposition> {
        let mut registry = self.registry.lock().await;
        self.check_owner(worker_id, connection).await?;

        let dispatched = registry
            .item(item_id)
            .filter(|item| item.status == ItemStatus::Dispatched)
            .map(|item| (item.job.clone(), item.dispatched_at));

        let error = match &outcome {
            Outcome::Failure(e) => Some(e.clone()),
            Outcome::Success => None,
        };
        let disposition = registry.report(worker_id, item_id, outcome, Instant::now())?;
        Self::refresh_gauges(&registry);
        drop(registry);

        let job = dispatched
            .as_ref()
            .map(|(job, _)| job.as_str())
            .unwrap_or("unknown");
        match disposition {
            ReportDisposition::Completed => {
                info!(worker_id = %worker_id, item_id = %item_id, job, "Item completed");
                NjordrMetrics::item_completed(job);
            }
            ReportDisposition::Requeued { attempts } => {
                warn!(
                    worker_id = %worker_id,
                    item_id = %item_id,
                    job,
                    attempts,
                    error = error.as_deref().unwrap_or(""),
                    "Attempt failed, item requeued"
                );
                NjordrMetrics::item_requeued("failure");
            }
            ReportDisposition::Failed { attempts } => {
                warn!(
                    worker_id = %worker_id,
                    item_id = %item_id,
                    job,
                    attempts,
                    error = error.as_deref().unwrap_or(""),
                    "Item failed permanently"
                );
                NjordrMetrics::item_failed(job);
            }
            ReportDisposition::Discarded => {
                debug!(worker_id = %worker_id, item_id = %item_id, "Stale report discarded");
                NjordrMetrics::report_discarded();
            }
        }

        if disposition != ReportDisposition::Discarded {
            if let Some((_, Some(dispatched_at))) = dispatched {
                let elapsed = chrono::Utc::now() - dispatched_at;
                NjordrMetrics::record_execution_time(elapsed.num_milliseconds() as f64 / 1000.0);
            }
        }

        // Worker is idle again either way
        self.notify_dispatch();
        Ok(disposition)
    }

    /// Drop a worker whose connection closed
    ///
    /// Only the connection the worker registered on may remove it.
    pub async fn disconnect(&self, worker_id: &WorkerId, connection: u64) {
        let mut registry = self.registry.lock().await;
        let mut channels = self.channels.lock().await;

        match channels.get(worker_id) {
            Some(channel) if channel.connection == connection => {
                channels.remove(worker_id);
            }
            _ => return,
        }
        drop(channels);

        let requeued = registry.unregister(worker_id);
        Self::refresh_gauges(&registry);
        drop(registry);

        info!(worker_id = %worker_id, "Worker disconnected");
        if let Some(item_id) = requeued {
            warn!(worker_id = %worker_id, item_id = %item_id, "Item requeued after disconnect");
            NjordrMetrics::item_requeued("worker_lost");
            self.notify_dispatch();
        }
    }

    // ============ Background passes ============

    /// Run one dispatch pass and hand assignments to worker connections
    pub async fn dispatch_once(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let assignments = registry.dispatch(Instant::now());
        if assignments.is_empty() {
            return 0;
        }

        let mut channels = self.channels.lock().await;
        let mut sent = 0;
        let mut lost = Vec::new();

        for (worker_id, assignment) in assignments {
            let item_id = assignment.item_id.clone();
            let job = assignment.job.clone();
            let delivered = channels
                .get(&worker_id)
                .map(|channel| {
                    channel
                        .sender
                        .send(BrokerMessage::Dispatch { assignment })
                        .is_ok()
                })
                .unwrap_or(false);

            if delivered {
                debug!(worker_id = %worker_id, item_id = %item_id, job = %job, "Item dispatched");
                NjordrMetrics::item_dispatched(&job);
                sent += 1;
            } else {
                lost.push(worker_id);
            }
        }

        for worker_id in &lost {
            channels.remove(worker_id);
            if let Some(item_id) = registry.unregister(worker_id) {
                warn!(worker_id = %worker_id, item_id = %item_id, "Worker channel closed, item requeued");
                NjordrMetrics::item_requeued("worker_lost");
            }
        }
        Self::refresh_gauges(&registry);
        drop(channels);
        drop(registry);

        if !lost.is_empty() {
            self.notify_dispatch();
        }
        sent
    }

    /// Run one liveness sweep
    pub async fn sweep_once(&self) -> SweepReport {
        let mut registry = self.registry.lock().await;
        let report = registry.sweep(Instant::now());
        if report.is_empty() {
            return report;
        }
        Self::refresh_gauges(&registry);

        // Under the registry lock, so a re-registration cannot slip in between
        let mut channels = self.channels.lock().await;
        for worker_id in &report.dead {
            channels.remove(worker_id);
        }
        drop(channels);
        drop(registry);

        for worker_id in &report.suspected {
            warn!(worker_id = %worker_id, "Worker heartbeat is late, marked suspected");
        }
        for worker_id in &report.dead {
            let timeout = Error::WorkerTimeout(worker_id.0.clone());
            warn!(worker_id = %worker_id, error = %timeout, "Worker declared dead");
        }

        for item_id in &report.requeued {
            warn!(item_id = %item_id, "Item requeued after worker loss");
            NjordrMetrics::item_requeued("worker_lost");
        }
        if !report.requeued.is_empty() {
            self.notify_dispatch();
        }
        report
    }

    // ============ Queries ============

    pub async fn stats(&self) -> RegistryStats {
        self.registry.lock().await.stats()
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let now = Instant::now();
        self.registry
            .lock()
            .await
            .workers()
            .into_iter()
            .map(|w| w.info(now))
            .collect()
    }

    pub async fn worker(&self, worker_id: &WorkerId) -> Option<WorkerInfo> {
        let now = Instant::now();
        self.registry
            .lock()
            .await
            .worker(worker_id)
            .map(|w| w.info(now))
    }
}
