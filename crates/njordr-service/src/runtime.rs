//! Worker runtime
//!
//! One [`ServiceRuntime`] is one worker identity: it registers with the
//! broker, heartbeats, executes dispatched items and reports every outcome
//! until the broker acknowledges it.

use njordr_core::{
    Assignment, BrokerMessage, ClientMessage, Error, ErrorCode, ItemId, Outcome, Result,
    ServiceConfig, WorkerId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{BrokerClient, ClientWriter};
use crate::executor::{HandlerRegistry, JobExecutor, JobOutcome};

/// Shortest heartbeat interval the runtime will use
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Counters for one worker identity
#[derive(Debug, Default)]
pub struct RuntimeStats {
    completed: AtomicU64,
    failed: AtomicU64,
}

impl RuntimeStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Requests a graceful stop of a running [`ServiceRuntime`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

enum Exit {
    Shutdown,
    Disconnected,
}

/// A registered worker
pub struct ServiceRuntime {
    worker_id: WorkerId,
    config: ServiceConfig,
    client: Option<BrokerClient>,
    heartbeat_interval: Duration,
    executor: JobExecutor,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<RuntimeStats>,

    /// Outcomes sent but not yet acknowledged, in report order
    unacked: Vec<(ItemId, Outcome)>,
    in_flight: HashMap<ItemId, JoinHandle<()>>,
    done_tx: mpsc::UnboundedSender<(ItemId, JobOutcome)>,
    done_rx: mpsc::UnboundedReceiver<(ItemId, JobOutcome)>,
    shutting_down: bool,
    deadline: Option<tokio::time::Instant>,
    reregistering: bool,
}

impl ServiceRuntime {
    /// Connect to the broker and register
    ///
    /// Fails with `RegistrationError` when the broker stays unreachable or
    /// refuses the worker id.
    pub async fn start(config: ServiceConfig, handlers: Arc<HandlerRegistry>) -> Result<Self> {
        let worker_id = WorkerId::from(config.get_id());

        let mut client = BrokerClient::connect_with_backoff(&config).await?;
        let advertised_ms = client
            .register(&worker_id)
            .await
            .map_err(as_registration_error)?;

        let heartbeat_interval = heartbeat_interval(&config, advertised_ms);
        info!(
            worker_id = %worker_id,
            broker = %client.addr(),
            heartbeat_ms = heartbeat_interval.as_millis() as u64,
            "Registered with broker"
        );

        let executor =
            JobExecutor::new(worker_id.0.clone(), handlers).with_timeout(config.job_timeout());
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        Ok(Self {
            worker_id,
            config,
            client: Some(client),
            heartbeat_interval,
            executor,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown,
            stats: Arc::new(RuntimeStats::default()),
            unacked: Vec::new(),
            in_flight: HashMap::new(),
            done_tx,
            done_rx,
            shutting_down: false,
            deadline: None,
            reregistering: false,
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn stats(&self) -> Arc<RuntimeStats> {
        self.stats.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Serve until shut down; reconnects when the broker connection drops
    pub async fn run(mut self) -> Result<()> {
        loop {
            let client = match self.client.take() {
                Some(client) => client,
                None => {
                    let (client, interval) = reconnect(&self.config, &self.worker_id).await?;
                    self.heartbeat_interval = interval;
                    self.reregistering = false;
                    client
                }
            };

            let (mut reader, mut writer) = client.into_split();
            let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
            let reader_task = tokio::spawn(async move {
                loop {
                    let message = reader.recv().await;
                    let closed = message.is_err();
                    if inbound_tx.send(message).is_err() || closed {
                        break;
                    }
                }
            });

            let exit = self.drive(&mut inbound, &mut writer).await;
            reader_task.abort();

            match exit {
                Exit::Shutdown => break,
                Exit::Disconnected if self.shutting_down => {
                    warn!(
                        worker_id = %self.worker_id,
                        unacked = self.unacked.len(),
                        "Broker connection lost during shutdown"
                    );
                    break;
                }
                Exit::Disconnected => {
                    warn!(worker_id = %self.worker_id, "Broker connection lost, reconnecting");
                }
            }
        }

        for (item_id, handle) in self.in_flight.drain() {
            warn!(item_id = %item_id, "Abandoning in-flight item at shutdown");
            handle.abort();
        }

        info!(
            worker_id = %self.worker_id,
            completed = self.stats.completed(),
            failed = self.stats.failed(),
            "Worker stopped"
        );
        Ok(())
    }

    async fn drive(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<Result<BrokerMessage>>,
        writer: &mut ClientWriter,
    ) -> Exit {
        // Anything reported on a previous connection may have been lost
        if self.resend_unacked(writer).await.is_err() {
            return Exit::Disconnected;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shutting_down && self.in_flight.is_empty() && self.unacked.is_empty() {
                return Exit::Shutdown;
            }

            let deadline = self.deadline;
            tokio::select! {
                _ = heartbeat.tick(), if !self.shutting_down => {
                    let message = ClientMessage::Heartbeat { worker_id: self.worker_id.clone() };
                    if let Err(e) = writer.send(&message).await {
                        debug!(error = %e, "Heartbeat failed");
                        return Exit::Disconnected;
                    }
                }
                message = inbound.recv() => match message {
                    Some(Ok(message)) => {
                        if let Err(e) = self.on_message(message, writer).await {
                            warn!(worker_id = %self.worker_id, error = %e, "Dropping broker connection");
                            return Exit::Disconnected;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "Read from broker failed");
                        return Exit::Disconnected;
                    }
                    None => return Exit::Disconnected,
                },
                Some((item_id, outcome)) = self.done_rx.recv() => {
                    let report = self.finish(item_id, outcome);
                    if writer.send(&report).await.is_err() {
                        return Exit::Disconnected;
                    }
                }
                _ = self.shutdown.changed(), if !self.shutting_down => {
                    self.begin_shutdown();
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    warn!(
                        worker_id = %self.worker_id,
                        in_flight = self.in_flight.len(),
                        "Shutdown timeout reached"
                    );
                    return Exit::Shutdown;
                }
            }
        }
    }

    async fn on_message(&mut self, message: BrokerMessage, writer: &mut ClientWriter) -> Result<()> {
        match message {
            BrokerMessage::Dispatch { assignment } => {
                if self.shutting_down {
                    // Closing the connection returns it to the queue
                    info!(item_id = %assignment.item_id, "Ignoring dispatch during shutdown");
                } else {
                    self.start_job(assignment);
                }
            }
            BrokerMessage::ReportAck {
                item_id,
                disposition,
            } => {
                debug!(item_id = %item_id, ?disposition, "Report acknowledged");
                self.unacked.retain(|(id, _)| id != &item_id);
            }
            BrokerMessage::Registered {
                heartbeat_interval_ms,
                ..
            } => {
                info!(
                    worker_id = %self.worker_id,
                    heartbeat_interval_ms,
                    "Re-registered with broker"
                );
                self.reregistering = false;
                self.resend_unacked(writer).await?;
            }
            BrokerMessage::Error {
                code: ErrorCode::UnknownWorker,
                ..
            } => {
                if !self.reregistering {
                    warn!(
                        worker_id = %self.worker_id,
                        "Broker dropped this worker, registering again"
                    );
                    self.reregistering = true;
                    writer
                        .send(&ClientMessage::Register {
                            worker_id: self.worker_id.clone(),
                        })
                        .await?;
                }
            }
            BrokerMessage::Error {
                code: ErrorCode::DuplicateWorker,
                message,
                ..
            } if self.reregistering => {
                // Someone else holds the id now; start over on a fresh connection
                self.reregistering = false;
                return Err(Error::RegistrationError(message));
            }
            BrokerMessage::Error { code, message, .. } => {
                warn!(worker_id = %self.worker_id, ?code, %message, "Broker error");
            }
            other => {
                debug!(?other, "Ignoring unexpected broker message");
            }
        }
        Ok(())
    }

    fn start_job(&mut self, assignment: Assignment) {
        if !self.in_flight.is_empty() {
            warn!(
                item_id = %assignment.item_id,
                in_flight = self.in_flight.len(),
                "Dispatch received while busy"
            );
        }

        let item_id = assignment.item_id.clone();
        let executor = self.executor.clone();
        let done = self.done_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = executor.execute(&assignment).await;
            let _ = done.send((assignment.item_id, outcome));
        });
        self.in_flight.insert(item_id, handle);
    }

    fn finish(&mut self, item_id: ItemId, outcome: JobOutcome) -> ClientMessage {
        self.in_flight.remove(&item_id);
        if outcome.success {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }

        let outcome = outcome.to_outcome();
        self.unacked.push((item_id.clone(), outcome.clone()));
        ClientMessage::Report {
            worker_id: self.worker_id.clone(),
            item_id,
            outcome,
        }
    }

    async fn resend_unacked(&self, writer: &mut ClientWriter) -> Result<()> {
        for (item_id, outcome) in &self.unacked {
            debug!(item_id = %item_id, "Re-sending unacknowledged report");
            writer
                .send(&ClientMessage::Report {
                    worker_id: self.worker_id.clone(),
                    item_id: item_id.clone(),
                    outcome: outcome.clone(),
                })
                .await?;
        }
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.deadline = Some(tokio::time::Instant::now() + self.config.shutdown_timeout());
        info!(
            worker_id = %self.worker_id,
            in_flight = self.in_flight.len(),
            "Shutting down, waiting for in-flight items"
        );
    }
}

/// Start one runtime per worker identity the config asks for
///
/// Identities register one after the other; the first refusal aborts startup.
pub async fn start_identities(
    config: &ServiceConfig,
    handlers: Arc<HandlerRegistry>,
) -> Result<Vec<ServiceRuntime>> {
    let ids = config.identity_ids();
    let mut runtimes = Vec::with_capacity(ids.len());
    for id in ids {
        let service = ServiceConfig {
            id: Some(id),
            ..config.clone()
        };
        runtimes.push(ServiceRuntime::start(service, handlers.clone()).await?);
    }
    Ok(runtimes)
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn heartbeat_interval(config: &ServiceConfig, advertised_ms: u64) -> Duration {
    config
        .heartbeat_interval()
        .min(Duration::from_millis(advertised_ms))
        .max(MIN_HEARTBEAT)
}

fn as_registration_error(err: Error) -> Error {
    match err {
        Error::RegistrationError(_) => err,
        other => Error::RegistrationError(other.to_string()),
    }
}

/// Connect and register again, retrying while the broker still holds the old handle
async fn reconnect(config: &ServiceConfig, worker_id: &WorkerId) -> Result<(BrokerClient, Duration)> {
    let attempts = config.connect_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        let mut client = BrokerClient::connect_with_backoff(config).await?;
        match client.register(worker_id).await {
            Ok(advertised_ms) => {
                info!(worker_id = %worker_id, "Reconnected to broker");
                return Ok((client, heartbeat_interval(config, advertised_ms)));
            }
            Err(e) => {
                warn!(worker_id = %worker_id, attempt = attempt + 1, error = %e, "Re-registration failed");
                last_error = Some(e);
                tokio::time::sleep(config.backoff(attempt)).await;
            }
        }
    }

    Err(Error::RegistrationError(format!(
        "could not re-register {}: {}",
        worker_id,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}
