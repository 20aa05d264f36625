//! Queue and worker registry
//!
//! All broker state lives in one [`Registry`]. Every operation is a
//! synchronous `&mut self` call and time-dependent operations take `now`
//! explicitly, so the whole state machine can be driven step by step in tests.
//!
//! Invariants kept by every operation:
//! - an item is assigned to at most one worker;
//! - a `dispatched` item names its worker and that worker's `current` names it;
//! - a worker declared dead never keeps a `dispatched` item;
//! - only healthy idle workers receive dispatches.

use chrono::{DateTime, Utc};
use njordr_core::{
    Assignment, BrokerConfig, Error, ItemId, ItemStatus, Outcome, ReportDisposition, Result,
    WorkItem, WorkerHealth, WorkerId,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Limits and timeouts the registry enforces
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub queue_capacity: usize,
    pub retry_limit: u32,
    pub heartbeat_timeout: Duration,
    pub dead_grace: Duration,
    pub finished_retention: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for RegistryConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            retry_limit: config.retry_limit,
            heartbeat_timeout: config.heartbeat_timeout(),
            dead_grace: config.dead_grace(),
            finished_retention: config.finished_retention,
        }
    }
}

/// Broker-side record of a registered worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    /// Item the worker is executing
    pub current: Option<ItemId>,
    pub health: WorkerHealth,
    /// When the worker last became idle, used to prefer the most recently idle
    pub idle_since: Instant,
    pub completed: u64,
    pub failed: u64,
}

impl WorkerHandle {
    fn new(id: WorkerId, now: Instant) -> Self {
        Self {
            id,
            registered_at: Utc::now(),
            last_heartbeat: now,
            current: None,
            health: WorkerHealth::Healthy,
            idle_since: now,
            completed: 0,
            failed: 0,
        }
    }

    /// Healthy and not executing anything
    pub fn is_available(&self) -> bool {
        self.health == WorkerHealth::Healthy && self.current.is_none()
    }

    fn release(&mut self, now: Instant) {
        self.current = None;
        self.idle_since = now;
    }

    /// Serializable view of the handle
    pub fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            health: self.health,
            current: self.current.clone(),
            registered_at: self.registered_at,
            last_heartbeat_ms: now.saturating_duration_since(self.last_heartbeat).as_millis() as u64,
            completed: self.completed,
            failed: self.failed,
        }
    }
}

/// Worker details exposed by the admin API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub health: WorkerHealth,
    pub current: Option<ItemId>,
    pub registered_at: DateTime<Utc>,
    /// Milliseconds since the last heartbeat
    pub last_heartbeat_ms: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Result of a liveness sweep
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Workers that became suspected in this sweep
    pub suspected: Vec<WorkerId>,
    /// Workers declared dead and removed
    pub dead: Vec<WorkerId>,
    /// Items returned to pending because their worker died
    pub requeued: Vec<ItemId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.suspected.is_empty() && self.dead.is_empty() && self.requeued.is_empty()
    }
}

/// Queue and worker counts
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub pending: usize,
    pub dispatched: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub abandoned_total: u64,
    pub submitted_total: u64,
    pub workers_healthy: usize,
    pub workers_suspected: usize,
    pub workers_busy: usize,
}

/// The broker's queue and worker state
#[derive(Debug)]
pub struct Registry {
    config: RegistryConfig,
    items: HashMap<ItemId, WorkItem>,
    /// Pending items by admission sequence
    pending: BTreeMap<u64, ItemId>,
    /// Terminal items, oldest first
    finished: VecDeque<ItemId>,
    workers: HashMap<WorkerId, WorkerHandle>,
    next_sequence: u64,
    completed_total: u64,
    failed_total: u64,
    abandoned_total: u64,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            items: HashMap::new(),
            pending: BTreeMap::new(),
            finished: VecDeque::new(),
            workers: HashMap::new(),
            next_sequence: 0,
            completed_total: 0,
            failed_total: 0,
            abandoned_total: 0,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a new pending item
    pub fn submit(&mut self, job: impl Into<String>, payload: serde_json::Value) -> Result<ItemId> {
        if self.pending.len() >= self.config.queue_capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.config.queue_capacity,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let item = WorkItem::new(job, payload, sequence);
        let id = item.id.clone();
        self.pending.insert(sequence, id.clone());
        self.items.insert(id.clone(), item);
        Ok(id)
    }

    /// Create a healthy, idle handle for a new worker
    pub fn register(&mut self, worker_id: WorkerId, now: Instant) -> Result<()> {
        if self.workers.contains_key(&worker_id) {
            return Err(Error::DuplicateWorker(worker_id.0));
        }
        self.workers
            .insert(worker_id.clone(), WorkerHandle::new(worker_id, now));
        Ok(())
    }

    /// Refresh a worker's liveness; a suspected worker becomes healthy again
    pub fn heartbeat(&mut self, worker_id: &WorkerId, now: Instant) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::UnknownWorker(worker_id.0.clone()))?;
        worker.last_heartbeat = now;
        worker.health = WorkerHealth::Healthy;
        Ok(())
    }

    /// Pair the oldest pending items with the most recently idle workers
    ///
    /// A worker already silent past the heartbeat timeout is skipped even if
    /// no sweep has marked it suspected yet.
    pub fn dispatch(&mut self, now: Instant) -> Vec<(WorkerId, Assignment)> {
        let mut assigned = Vec::new();

        while let Some((&sequence, _)) = self.pending.first_key_value() {
            let Some(worker_id) = self.next_available_worker(now) else {
                break;
            };
            let Some(item_id) = self.pending.remove(&sequence) else {
                break;
            };
            let Some(item) = self.items.get_mut(&item_id) else {
                continue;
            };

            item.mark_dispatched(worker_id.clone());
            let assignment = item.assignment();

            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.current = Some(item_id);
            }
            assigned.push((worker_id, assignment));
        }

        assigned
    }

    fn next_available_worker(&self, now: Instant) -> Option<WorkerId> {
        let timeout = self.config.heartbeat_timeout;
        self.workers
            .values()
            .filter(|w| w.is_available())
            .filter(|w| now.saturating_duration_since(w.last_heartbeat) <= timeout)
            // Most recently idle wins; ties go to the smaller id
            .max_by(|a, b| {
                a.idle_since
                    .cmp(&b.idle_since)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|w| w.id.clone())
    }

    /// Reconcile an outcome reported by a worker
    ///
    /// Reports that do not match the worker's current dispatch are discarded
    /// without changing any item.
    pub fn report(
        &mut self,
        worker_id: &WorkerId,
        item_id: &ItemId,
        outcome: Outcome,
        now: Instant,
    ) -> Result<ReportDisposition> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::UnknownWorker(worker_id.0.clone()))?;

        let holds = worker.current.as_ref() == Some(item_id);
        let matches = holds
            && self.items.get(item_id).is_some_and(|item| {
                item.status == ItemStatus::Dispatched
                    && item.assigned_worker.as_ref() == Some(worker_id)
            });

        if !matches {
            // Abandoned while held, or evicted after abandonment
            if holds {
                worker.release(now);
            }
            return Ok(ReportDisposition::Discarded);
        }

        worker.release(now);
        let Some(item) = self.items.get_mut(item_id) else {
            return Ok(ReportDisposition::Discarded);
        };

        let disposition = match outcome {
            Outcome::Success => {
                item.mark_completed();
                worker.completed += 1;
                self.completed_total += 1;
                ReportDisposition::Completed
            }
            Outcome::Failure(error) => {
                item.mark_attempt_failed(error, self.config.retry_limit);
                worker.failed += 1;
                if item.status == ItemStatus::Pending {
                    self.pending.insert(item.sequence, item_id.clone());
                    ReportDisposition::Requeued {
                        attempts: item.attempts,
                    }
                } else {
                    self.failed_total += 1;
                    ReportDisposition::Failed {
                        attempts: item.attempts,
                    }
                }
            }
        };

        if matches!(
            disposition,
            ReportDisposition::Completed | ReportDisposition::Failed { .. }
        ) {
            self.retire(item_id.clone());
        }
        Ok(disposition)
    }

    /// Liveness pass: suspect silent workers, remove dead ones and requeue their items
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let dead_after = self.config.heartbeat_timeout + self.config.dead_grace;

        for worker in self.workers.values_mut() {
            let silent = now.saturating_duration_since(worker.last_heartbeat);
            if silent > dead_after {
                worker.health = WorkerHealth::Dead;
                report.dead.push(worker.id.clone());
            } else if silent > self.config.heartbeat_timeout
                && worker.health == WorkerHealth::Healthy
            {
                worker.health = WorkerHealth::Suspected;
                report.suspected.push(worker.id.clone());
            }
        }

        report.dead.sort();
        report.suspected.sort();

        for worker_id in &report.dead {
            if let Some(item_id) = self.remove_worker(worker_id) {
                report.requeued.push(item_id);
            }
        }

        report
    }

    /// Remove a worker whose connection went away, requeueing its item
    pub fn unregister(&mut self, worker_id: &WorkerId) -> Option<ItemId> {
        self.remove_worker(worker_id)
    }

    fn remove_worker(&mut self, worker_id: &WorkerId) -> Option<ItemId> {
        let worker = self.workers.remove(worker_id)?;
        let item_id = worker.current?;
        let item = self.items.get_mut(&item_id)?;

        // Abandoned items stay abandoned
        if item.status != ItemStatus::Dispatched
            || item.assigned_worker.as_ref() != Some(worker_id)
        {
            return None;
        }

        item.mark_redelivered();
        self.pending.insert(item.sequence, item_id.clone());
        Some(item_id)
    }

    /// Operator cancellation of a pending or dispatched item
    pub fn abandon(&mut self, item_id: &ItemId) -> Result<()> {
        let item = self
            .items
            .get_mut(item_id)
            .ok_or_else(|| Error::UnknownItem(item_id.0.clone()))?;

        if item.status.is_terminal() {
            return Err(Error::InvalidTransition {
                item_id: item_id.0.clone(),
                message: format!("item is already {}", item.status),
            });
        }

        if item.status == ItemStatus::Pending {
            self.pending.remove(&item.sequence);
        }
        item.mark_abandoned();
        self.abandoned_total += 1;
        self.retire(item_id.clone());
        Ok(())
    }

    fn retire(&mut self, item_id: ItemId) {
        self.finished.push_back(item_id);
        while self.finished.len() > self.config.finished_retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.items.remove(&evicted);
            }
        }
    }

    pub fn item(&self, item_id: &ItemId) -> Option<&WorkItem> {
        self.items.get(item_id)
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(worker_id)
    }

    /// All registered workers, ordered by id
    pub fn workers(&self) -> Vec<&WorkerHandle> {
        let mut workers: Vec<_> = self.workers.values().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            pending: self.pending.len(),
            completed_total: self.completed_total,
            failed_total: self.failed_total,
            abandoned_total: self.abandoned_total,
            submitted_total: self.next_sequence,
            ..Default::default()
        };

        stats.dispatched = self
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Dispatched)
            .count();

        for worker in self.workers.values() {
            match worker.health {
                WorkerHealth::Healthy => stats.workers_healthy += 1,
                WorkerHealth::Suspected => stats.workers_suspected += 1,
                WorkerHealth::Dead => {}
            }
            if worker.current.is_some() {
                stats.workers_busy += 1;
            }
        }

        stats
    }
}
