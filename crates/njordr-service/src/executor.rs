//! Job handlers and their execution

use async_trait::async_trait;
use njordr_core::{Assignment, Outcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Result of running one assignment
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Success or failure
    pub success: bool,

    /// Result value (JSON), logged but not sent to the broker
    pub result: Option<serde_json::Value>,

    /// Error message if failed
    pub error: Option<String>,

    /// Execution duration
    pub duration: Duration,
}

impl JobOutcome {
    /// Create a success outcome
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            duration,
        }
    }

    /// Create a failure outcome
    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            duration,
        }
    }

    /// Outcome as reported to the broker
    pub fn to_outcome(&self) -> Outcome {
        if self.success {
            Outcome::Success
        } else {
            Outcome::Failure(self.error.clone().unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

/// Trait for job handlers
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute an assignment
    async fn execute(&self, item: &Assignment) -> JobOutcome;

    /// Get the handler name
    fn name(&self) -> &str;
}

/// Job handlers keyed by job name
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the `echo`, `sleep` and `fail` handlers
    pub async fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_handler(Arc::new(EchoHandler)).await;
        registry.register_handler(Arc::new(SleepHandler)).await;
        registry.register_handler(Arc::new(FailHandler)).await;
        registry
    }

    /// Register a handler under a job name
    pub async fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(name.into(), handler);
    }

    /// Register a handler under its own name
    pub async fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        let name = handler.name().to_string();
        self.register(name, handler).await;
    }

    /// Get a handler
    pub async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().await;
        handlers.get(name).cloned()
    }

    /// Check if a handler exists
    pub async fn has(&self, name: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers.contains_key(name)
    }

    /// Registered job names, sorted
    pub async fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        let mut names: Vec<_> = handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs assignments through the registry with a time limit
#[derive(Clone)]
pub struct JobExecutor {
    worker_id: String,
    registry: Arc<HandlerRegistry>,
    timeout: Duration,
}

impl JobExecutor {
    pub fn new(worker_id: impl Into<String>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            worker_id: worker_id.into(),
            registry,
            timeout: Duration::from_secs(300),
        }
    }

    /// Set execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute an assignment; unknown jobs and timeouts are failures
    pub async fn execute(&self, item: &Assignment) -> JobOutcome {
        info!(
            worker_id = %self.worker_id,
            item_id = %item.item_id,
            job = %item.job,
            attempts = item.attempts,
            "Executing item"
        );

        let Some(handler) = self.registry.get(&item.job).await else {
            error!(item_id = %item.item_id, job = %item.job, "No handler registered");
            return JobOutcome::failure(
                format!("No handler registered for job '{}'", item.job),
                Duration::ZERO,
            );
        };

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, handler.execute(item)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(item_id = %item.item_id, timeout = ?self.timeout, "Item timed out");
                JobOutcome::failure(
                    format!("Job timed out after {} seconds", self.timeout.as_secs()),
                    start.elapsed(),
                )
            }
        };

        if outcome.success {
            info!(item_id = %item.item_id, duration = ?outcome.duration, "Item succeeded");
        } else {
            error!(
                item_id = %item.item_id,
                error = outcome.error.as_deref().unwrap_or("unknown error"),
                "Item failed"
            );
        }
        outcome
    }
}

/// Returns its payload
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(&self, item: &Assignment) -> JobOutcome {
        let start = Instant::now();
        let result = serde_json::json!({
            "item_id": item.item_id,
            "payload": item.payload,
        });
        JobOutcome::success(result, start.elapsed())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Sleeps for `payload.ms` milliseconds (or `payload.seconds`), default one second
pub struct SleepHandler;

impl SleepHandler {
    fn duration(payload: &serde_json::Value) -> Duration {
        if let Some(ms) = payload.get("ms").and_then(|v| v.as_u64()) {
            return Duration::from_millis(ms);
        }
        let seconds = payload
            .get("seconds")
            .and_then(|v| v.as_f64())
            .or_else(|| payload.as_f64())
            .unwrap_or(1.0);
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn execute(&self, item: &Assignment) -> JobOutcome {
        let start = Instant::now();
        let duration = Self::duration(&item.payload);
        tokio::time::sleep(duration).await;

        JobOutcome::success(
            serde_json::json!({ "slept_ms": duration.as_millis() as u64 }),
            start.elapsed(),
        )
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

/// Always fails, with `payload.message` if given
pub struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn execute(&self, item: &Assignment) -> JobOutcome {
        let start = Instant::now();
        let message = item
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Intentional failure");

        JobOutcome::failure(message, start.elapsed())
    }

    fn name(&self) -> &str {
        "fail"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use njordr_core::ItemId;
    use serde_json::json;

    fn assignment(job: &str, payload: serde_json::Value) -> Assignment {
        Assignment {
            item_id: ItemId::from("item-1"),
            job: job.to_string(),
            payload,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_echo_handler() {
        let outcome = EchoHandler.execute(&assignment("echo", json!({"text": "hello"}))).await;
        assert!(outcome.success);
        assert_eq!(outcome.result.unwrap()["payload"]["text"], "hello");
    }

    #[tokio::test]
    async fn test_fail_handler() {
        let outcome = FailHandler
            .execute(&assignment("fail", json!({"message": "test error"})))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.to_outcome(), Outcome::Failure("test error".into()));
    }

    #[test]
    fn test_sleep_duration_from_payload() {
        assert_eq!(SleepHandler::duration(&json!({"ms": 250})), Duration::from_millis(250));
        assert_eq!(SleepHandler::duration(&json!({"seconds": 2})), Duration::from_secs(2));
        assert_eq!(SleepHandler::duration(&json!(null)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = HandlerRegistry::with_builtins().await;

        assert!(registry.has("echo").await);
        assert!(!registry.has("unknown").await);
        assert_eq!(registry.names().await, vec!["echo", "fail", "sleep"]);
    }

    #[tokio::test]
    async fn test_unknown_job_fails() {
        let executor = JobExecutor::new("w1", Arc::new(HandlerRegistry::new()));
        let outcome = executor.execute(&assignment("missing", json!(null))).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let executor = JobExecutor::new("w1", Arc::new(HandlerRegistry::with_builtins().await))
            .with_timeout(Duration::from_millis(20));
        let outcome = executor.execute(&assignment("sleep", json!({"ms": 5000}))).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }
}
