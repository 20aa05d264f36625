//! Connection to the broker

use njordr_core::tls::{self, ServerName, TlsConnector};
use njordr_core::{
    read_frame, write_frame, BoxedTransport, BrokerMessage, ClientMessage, Error, ItemId, Result,
    Serializer, ServiceConfig, WorkItem, WorkerId,
};
use tokio::io::{BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Receiving half of a broker connection
pub struct ClientReader {
    reader: BufReader<ReadHalf<BoxedTransport>>,
    max_frame_size: usize,
}

impl ClientReader {
    /// Next broker message; `ConnectionClosed` once the broker hangs up
    pub async fn recv(&mut self) -> Result<BrokerMessage> {
        read_frame(&mut self.reader, self.max_frame_size)
            .await?
            .ok_or(Error::ConnectionClosed)
    }
}

/// Sending half of a broker connection
pub struct ClientWriter {
    writer: BufWriter<WriteHalf<BoxedTransport>>,
    serializer: Serializer,
}

impl ClientWriter {
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        write_frame(&mut self.writer, message, self.serializer).await
    }
}

/// Framed connection to the broker, usable by workers and producers
pub struct BrokerClient {
    addr: String,
    reader: ClientReader,
    writer: ClientWriter,
}

impl BrokerClient {
    /// Connect once over plain TCP
    pub async fn connect(addr: &str, serializer: Serializer, max_frame_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::over(addr, Box::new(stream), serializer, max_frame_size))
    }

    /// Connect once and run the TLS handshake, presenting the connector's client certificate
    pub async fn connect_tls(
        addr: &str,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
        serializer: Serializer,
        max_frame_size: usize,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let stream = connector.connect(server_name, stream).await?;
        Ok(Self::over(addr, Box::new(stream), serializer, max_frame_size))
    }

    /// Connect once using the address and TLS settings in `config`
    pub async fn connect_config(config: &ServiceConfig) -> Result<Self> {
        match tls::connector(&config.tls)? {
            Some(connector) => {
                let server_name = tls::server_name(&config.tls, &config.broker_addr)?;
                Self::connect_tls(
                    &config.broker_addr,
                    &connector,
                    server_name,
                    config.serializer,
                    config.max_frame_size,
                )
                .await
            }
            None => {
                Self::connect(&config.broker_addr, config.serializer, config.max_frame_size).await
            }
        }
    }

    fn over(
        addr: &str,
        transport: BoxedTransport,
        serializer: Serializer,
        max_frame_size: usize,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            addr: addr.to_string(),
            reader: ClientReader {
                reader: BufReader::new(read_half),
                max_frame_size,
            },
            writer: ClientWriter {
                writer: BufWriter::new(write_half),
                serializer,
            },
        }
    }

    /// Connect with exponential backoff, giving up after `connect_attempts`
    ///
    /// Bad TLS settings fail immediately; they will not fix themselves.
    pub async fn connect_with_backoff(config: &ServiceConfig) -> Result<Self> {
        let attempts = config.connect_attempts.max(1);
        let mut last_error = None;

        let connector = match tls::connector(&config.tls)? {
            Some(connector) => Some((
                connector,
                tls::server_name(&config.tls, &config.broker_addr)?,
            )),
            None => None,
        };

        for attempt in 0..attempts {
            let connected = match &connector {
                Some((connector, server_name)) => {
                    Self::connect_tls(
                        &config.broker_addr,
                        connector,
                        server_name.clone(),
                        config.serializer,
                        config.max_frame_size,
                    )
                    .await
                }
                None => {
                    Self::connect(&config.broker_addr, config.serializer, config.max_frame_size)
                        .await
                }
            };

            match connected {
                Ok(client) => {
                    debug!(addr = %config.broker_addr, attempt, "Connected to broker");
                    return Ok(client);
                }
                Err(e) => {
                    warn!(
                        addr = %config.broker_addr,
                        attempt = attempt + 1,
                        of = attempts,
                        error = %e,
                        "Broker connection failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(config.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(Error::RegistrationError(format!(
            "broker at {} unreachable after {} attempts: {}",
            config.broker_addr,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        self.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<BrokerMessage> {
        self.reader.recv().await
    }

    /// Send a request and wait for the reply, turning broker errors into `Err`
    async fn request(&mut self, message: &ClientMessage) -> Result<BrokerMessage> {
        self.send(message).await?;
        let reply = self.recv().await?;
        match reply.as_error() {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }

    /// Register as a worker, returning the heartbeat interval the broker asks for
    pub async fn register(&mut self, worker_id: &WorkerId) -> Result<u64> {
        self.send(&ClientMessage::Register {
            worker_id: worker_id.clone(),
        })
        .await?;

        match self.recv().await? {
            BrokerMessage::Registered {
                heartbeat_interval_ms,
                ..
            } => Ok(heartbeat_interval_ms),
            BrokerMessage::Error { message, .. } => Err(Error::RegistrationError(message)),
            other => Err(Error::Protocol(format!(
                "unexpected reply to register: {:?}",
                other
            ))),
        }
    }

    /// Submit a work item
    pub async fn submit(&mut self, job: &str, payload: serde_json::Value) -> Result<ItemId> {
        let message = ClientMessage::Submit {
            job: job.to_string(),
            payload,
        };
        match self.request(&message).await? {
            BrokerMessage::Submitted { item_id } => Ok(item_id),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the current state of an item
    pub async fn status(&mut self, item_id: &ItemId) -> Result<WorkItem> {
        let message = ClientMessage::Status {
            item_id: item_id.clone(),
        };
        match self.request(&message).await? {
            BrokerMessage::ItemStatus { item } => Ok(*item),
            other => Err(unexpected(other)),
        }
    }

    /// Abandon an item
    pub async fn abandon(&mut self, item_id: &ItemId) -> Result<()> {
        let message = ClientMessage::Abandon {
            item_id: item_id.clone(),
        };
        match self.request(&message).await? {
            BrokerMessage::Abandoned { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Split for concurrent reading and writing
    pub fn into_split(self) -> (ClientReader, ClientWriter) {
        (self.reader, self.writer)
    }
}

fn unexpected(message: BrokerMessage) -> Error {
    Error::Protocol(format!("unexpected broker reply: {:?}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_broker_is_registration_error() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ServiceConfig {
            broker_addr: addr.to_string(),
            connect_attempts: 2,
            connect_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        };

        match BrokerClient::connect_with_backoff(&config).await {
            Err(Error::RegistrationError(message)) => assert!(message.contains("2 attempts")),
            Err(other) => panic!("Expected RegistrationError, got {:?}", other),
            Ok(_) => panic!("Expected RegistrationError, got a connection"),
        }
    }
}
