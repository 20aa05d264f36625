//! Common test utilities and fixtures

use njordr_broker::{BrokerServer, BrokerState};
use njordr_core::{BrokerConfig, ItemId, ItemStatus, Serializer, ServiceConfig, WorkItem};
use njordr_service::{BrokerClient, HandlerRegistry, ServiceRuntime, ShutdownHandle};
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

/// How long a test waits for an item to reach a status
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(njordr_telemetry::init_test_logging);
}

/// Broker settings with short timeouts on an ephemeral port
pub fn broker_config() -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        enable_admin: false,
        retry_limit: 2,
        heartbeat_timeout_ms: 150,
        dead_grace_ms: 150,
        sweep_interval_ms: 20,
        dispatch_interval_ms: 20,
        ..Default::default()
    }
}

/// A broker running in the background
pub struct TestBroker {
    pub addr: SocketAddr,
    pub state: Arc<BrokerState>,
    task: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::with_config(broker_config()).await
    }

    pub async fn with_config(config: BrokerConfig) -> Self {
        init();
        let server = BrokerServer::bind(config).await.expect("bind broker");
        let addr = server.local_addr().expect("broker address");
        let state = server.state();
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });
        Self { addr, state, task }
    }

    /// A producer connection
    pub async fn client(&self) -> BrokerClient {
        BrokerClient::connect(
            &self.addr.to_string(),
            Serializer::Json,
            ServiceConfig::default().max_frame_size,
        )
        .await
        .expect("connect producer")
    }

    /// Service settings for a worker pointed at this broker
    pub fn service_config(&self, worker_id: &str) -> ServiceConfig {
        ServiceConfig {
            id: Some(worker_id.to_string()),
            broker_addr: self.addr.to_string(),
            heartbeat_interval_ms: 30,
            connect_attempts: 3,
            connect_backoff_ms: 10,
            max_backoff_ms: 50,
            shutdown_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Register and run a worker with the built-in handlers
    pub async fn spawn_worker(&self, worker_id: &str) -> TestWorker {
        spawn_worker_with(self.service_config(worker_id)).await
    }
}

/// Register and run a worker from explicit settings
pub async fn spawn_worker_with(config: ServiceConfig) -> TestWorker {
    let handlers = Arc::new(HandlerRegistry::with_builtins().await);
    let runtime = ServiceRuntime::start(config, handlers)
        .await
        .expect("start worker");
    TestWorker::run(runtime)
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A worker running in the background
pub struct TestWorker {
    pub shutdown: ShutdownHandle,
    pub task: JoinHandle<njordr_core::Result<()>>,
}

impl TestWorker {
    /// Run an already registered runtime in the background
    pub fn run(runtime: ServiceRuntime) -> Self {
        let shutdown = runtime.shutdown_handle();
        let task = tokio::spawn(runtime.run());
        Self { shutdown, task }
    }

    /// Graceful stop, waiting for the runtime to exit
    pub async fn stop(self) {
        self.shutdown.shutdown();
        let result = tokio::time::timeout(WAIT, self.task)
            .await
            .expect("worker did not stop in time")
            .expect("worker task panicked");
        assert!(result.is_ok(), "worker exited with {:?}", result);
    }
}

/// Poll the broker until the item reaches `status`
pub async fn wait_for_status(
    client: &mut BrokerClient,
    item_id: &ItemId,
    status: ItemStatus,
) -> WorkItem {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let item = client.status(item_id).await.expect("status query");
        if item.status == status {
            return item;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "item {} stuck in {}, expected {}",
            item_id,
            item.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Generate a unique worker ID
pub fn unique_worker(prefix: &str) -> String {
    format!("{}-{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..8])
}
