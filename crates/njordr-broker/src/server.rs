//! TCP transport server and background loops

use njordr_core::tls::{self, TlsAcceptor};
use njordr_core::{
    read_frame, write_frame, BoxedTransport, BrokerConfig, BrokerMessage, ClientMessage, Error,
    Result, WorkerId,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::state::{BrokerState, WorkerChannel};

/// Time a client gets to finish the TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker process: transport listener, admin API and the dispatch and sweep loops
pub struct BrokerServer {
    state: Arc<BrokerState>,
    listener: TcpListener,
    admin_listener: Option<TcpListener>,
    acceptor: Option<TlsAcceptor>,
}

impl BrokerServer {
    /// Bind the transport (and admin, if enabled) listeners
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let acceptor = tls::acceptor(&config.tls)?;
        let listener = TcpListener::bind(config.addr()).await?;
        let admin_listener = if config.enable_admin {
            Some(TcpListener::bind(config.admin_addr()).await?)
        } else {
            None
        };

        Ok(Self {
            state: Arc::new(BrokerState::new(config)),
            listener,
            admin_listener,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn state(&self) -> Arc<BrokerState> {
        self.state.clone()
    }

    /// Serve until the process is killed
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            state,
            listener,
            admin_listener,
            acceptor,
        } = self;

        info!(
            addr = %listener.local_addr()?,
            tls = acceptor.is_some(),
            "Broker listening"
        );

        let admin = async {
            match admin_listener {
                Some(admin_listener) => {
                    info!(addr = %admin_listener.local_addr()?, "Admin API listening");
                    axum::serve(admin_listener, api::router(state.clone())).await?;
                    Ok::<(), Error>(())
                }
                None => std::future::pending::<Result<()>>().await,
            }
        };

        tokio::select! {
            result = accept_loop(state.clone(), listener, acceptor) => result,
            result = admin => result,
            _ = dispatch_loop(state.clone()) => Ok(()),
            _ = sweep_loop(state.clone()) => Ok(()),
            _ = shutdown => {
                info!("Broker shutting down");
                Ok(())
            }
        }
    }
}

async fn accept_loop(
    state: Arc<BrokerState>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Connection accepted");
                let state = state.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Some(transport) = open_transport(stream, peer, acceptor).await {
                        handle_connection(state, transport, peer).await;
                    }
                });
            }
            Err(e) => {
                // Usually fd exhaustion; keep serving
                error!(error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Finish the TLS handshake if enabled; `None` drops the connection
async fn open_transport(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> Option<BoxedTransport> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Could not set TCP_NODELAY");
    }

    let Some(acceptor) = acceptor else {
        return Some(Box::new(stream));
    };

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => Some(Box::new(stream)),
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "TLS handshake failed");
            None
        }
        Err(_) => {
            warn!(%peer, "TLS handshake timed out");
            None
        }
    }
}

async fn dispatch_loop(state: Arc<BrokerState>) {
    let mut ticker = tokio::time::interval(state.config.dispatch_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.dispatch_requested() => {}
        }
        state.dispatch_once().await;
    }
}

async fn sweep_loop(state: Arc<BrokerState>) {
    let mut ticker = tokio::time::interval(state.config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let report = state.sweep_once().await;
        if !report.dead.is_empty() {
            info!(
                dead = report.dead.len(),
                requeued = report.requeued.len(),
                "Sweep removed dead workers"
            );
        }
    }
}

/// One client connection: a worker, a producer, or both
struct Session {
    state: Arc<BrokerState>,
    connection: u64,
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<BrokerMessage>,
    /// Worker bound by `Register`; stays set after the broker drops the worker
    worker: Option<WorkerId>,
}

impl Session {
    async fn handle(&mut self, message: ClientMessage) -> Option<BrokerMessage> {
        let result = match message {
            ClientMessage::Register { worker_id } => self.register(worker_id).await.map(Some),
            ClientMessage::Heartbeat { worker_id } => match self.check_bound(&worker_id) {
                Ok(()) => self
                    .state
                    .heartbeat(&worker_id, self.connection)
                    .await
                    .map(|_| None),
                Err(e) => Err(e),
            },
            ClientMessage::Report {
                worker_id,
                item_id,
                outcome,
            } => match self.check_bound(&worker_id) {
                Ok(()) => self
                    .state
                    .report(&worker_id, self.connection, &item_id, outcome)
                    .await
                    .map(|disposition| {
                        Some(BrokerMessage::ReportAck {
                            item_id,
                            disposition,
                        })
                    }),
                Err(e) => Err(e),
            },
            ClientMessage::Submit { job, payload } => self
                .state
                .submit(job, payload)
                .await
                .map(|item_id| Some(BrokerMessage::Submitted { item_id })),
            ClientMessage::Status { item_id } => match self.state.item(&item_id).await {
                Some(item) => Ok(Some(BrokerMessage::ItemStatus {
                    item: Box::new(item),
                })),
                None => Err(Error::UnknownItem(item_id.0)),
            },
            ClientMessage::Abandon { item_id } => self
                .state
                .abandon(&item_id)
                .await
                .map(|_| Some(BrokerMessage::Abandoned { item_id })),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_protocol_misuse() {
                    warn!(peer = %self.peer, error = %e, "Rejected client request");
                } else {
                    debug!(peer = %self.peer, error = %e, "Request failed");
                }
                Some(BrokerMessage::error(&e))
            }
        }
    }

    async fn register(&mut self, worker_id: WorkerId) -> Result<BrokerMessage> {
        if let Some(bound) = &self.worker {
            if bound != &worker_id {
                return Err(Error::Protocol(format!(
                    "connection is already bound to worker {}",
                    bound
                )));
            }
        }

        let channel = WorkerChannel {
            connection: self.connection,
            sender: self.sender.clone(),
        };
        self.state.register(&worker_id, channel).await?;
        self.worker = Some(worker_id.clone());

        // Three heartbeats fit in one timeout window
        let heartbeat_interval_ms = (self.state.config.heartbeat_timeout_ms / 3).max(1);
        Ok(BrokerMessage::Registered {
            worker_id,
            heartbeat_interval_ms,
        })
    }

    fn check_bound(&self, worker_id: &WorkerId) -> Result<()> {
        match &self.worker {
            Some(bound) if bound == worker_id => Ok(()),
            _ => Err(Error::Protocol(format!(
                "worker {} is not registered on this connection",
                worker_id
            ))),
        }
    }
}

async fn handle_connection(state: Arc<BrokerState>, transport: BoxedTransport, peer: SocketAddr) {
    let connection = state.next_connection_id();
    let max_frame_size = state.config.max_frame_size;
    let serializer = state.config.serializer;

    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = BufReader::new(read_half);
    let (sender, mut outbound) = mpsc::unbounded_channel::<BrokerMessage>();

    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &message, serializer).await {
                debug!(%peer, error = %e, "Write failed, closing writer");
                break;
            }
        }
    });

    let mut session = Session {
        state: state.clone(),
        connection,
        peer,
        sender,
        worker: None,
    };

    loop {
        let message = match read_frame::<_, ClientMessage>(&mut reader, max_frame_size).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(Error::ConnectionClosed) | Err(Error::Io(_)) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Protocol error, closing connection");
                let _ = session.sender.send(BrokerMessage::error(&e));
                break;
            }
        };

        if let Some(reply) = session.handle(message).await {
            if session.sender.send(reply).is_err() {
                break;
            }
        }
    }

    if let Some(worker_id) = session.worker.take() {
        state.disconnect(&worker_id, connection).await;
    }
    drop(session);

    if let Err(e) = writer.await {
        debug!(%peer, error = %e, "Writer task ended abnormally");
    }
    debug!(%peer, "Connection closed");
}
