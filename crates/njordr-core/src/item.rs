//! Work item definitions and lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::WorkerId;

/// Unique identifier for a work item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub String);

impl ItemId {
    /// Generate a new random item ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an item ID from an existing string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting for a worker
    Pending,
    /// Assigned to exactly one worker
    Dispatched,
    /// Reported successful
    Completed,
    /// Ran out of attempts
    Failed,
    /// Cancelled by an operator
    Abandoned,
}

impl ItemStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Abandoned
        )
    }

    /// Check if the item is still moving through the queue
    pub fn is_active(&self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::Dispatched)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Dispatched => write!(f, "dispatched"),
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Failed => write!(f, "failed"),
            ItemStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Outcome a worker reports for an assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "error", rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// A unit of dispatchable work, tracked by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique item identifier
    pub id: ItemId,

    /// Name of the job handler that executes this item
    pub job: String,

    /// Job description, opaque to the broker
    pub payload: serde_json::Value,

    /// Admission order, used for FIFO dispatch
    pub sequence: u64,

    /// When the item was submitted
    pub created_at: DateTime<Utc>,

    /// Failed attempts so far
    pub attempts: u32,

    /// Times the item was requeued because its worker was lost
    pub redeliveries: u32,

    /// Current status
    pub status: ItemStatus,

    /// Worker holding the item while dispatched
    pub assigned_worker: Option<WorkerId>,

    /// When the item was last dispatched
    pub dispatched_at: Option<DateTime<Utc>>,

    /// When the item reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,

    /// Last failure reported for the item
    pub last_error: Option<String>,
}

impl WorkItem {
    /// Create a new pending item
    pub fn new(job: impl Into<String>, payload: serde_json::Value, sequence: u64) -> Self {
        Self {
            id: ItemId::new(),
            job: job.into(),
            payload,
            sequence,
            created_at: Utc::now(),
            attempts: 0,
            redeliveries: 0,
            status: ItemStatus::Pending,
            assigned_worker: None,
            dispatched_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// Mark the item as dispatched to a worker
    pub fn mark_dispatched(&mut self, worker_id: WorkerId) {
        self.status = ItemStatus::Dispatched;
        self.assigned_worker = Some(worker_id);
        self.dispatched_at = Some(Utc::now());
    }

    /// Mark the item as completed
    pub fn mark_completed(&mut self) {
        self.status = ItemStatus::Completed;
        self.assigned_worker = None;
        self.finished_at = Some(Utc::now());
    }

    /// Record a failed attempt, returning to pending or failing permanently
    pub fn mark_attempt_failed(&mut self, error: impl Into<String>, retry_limit: u32) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.assigned_worker = None;
        if self.attempts < retry_limit {
            self.status = ItemStatus::Pending;
        } else {
            self.status = ItemStatus::Failed;
            self.finished_at = Some(Utc::now());
        }
    }

    /// Return the item to pending after its worker was lost
    pub fn mark_redelivered(&mut self) {
        self.status = ItemStatus::Pending;
        self.assigned_worker = None;
        self.redeliveries += 1;
    }

    /// Mark the item as abandoned by an operator
    ///
    /// The assigned worker is kept so a late report can still be matched.
    pub fn mark_abandoned(&mut self) {
        self.status = ItemStatus::Abandoned;
        self.finished_at = Some(Utc::now());
    }

    /// Build the dispatch record sent to a worker
    pub fn assignment(&self) -> Assignment {
        Assignment {
            item_id: self.id.clone(),
            job: self.job.clone(),
            payload: self.payload.clone(),
            attempts: self.attempts,
        }
    }
}

/// Dispatch record carried to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub item_id: ItemId,
    pub job: String,
    pub payload: serde_json::Value,
    /// Failed attempts before this one
    pub attempts: u32,
}
