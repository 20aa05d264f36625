//! Error types for njordr

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using njordr's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for njordr operations
#[derive(Error, Debug)]
pub enum Error {
    /// The pending queue is at its configured limit
    #[error("pending queue is full ({capacity} items)")]
    CapacityExceeded { capacity: usize },

    /// A worker with this id is already registered
    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    /// No worker with this id is registered
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// No item with this id is known to the broker
    #[error("unknown item: {0}")]
    UnknownItem(String),

    /// The requested state change is not allowed from the item's status
    #[error("invalid transition for item {item_id}: {message}")]
    InvalidTransition { item_id: String, message: String },

    /// Worker could not register with the broker
    #[error("registration failed: {0}")]
    RegistrationError(String),

    /// Broker stopped hearing from a worker
    #[error("worker {0} timed out")]
    WorkerTimeout(String),

    /// Peer sent something that violates the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame exceeds the configured size limit
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Certificate loading or TLS setup failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error kind carried over the wire so clients can react to broker errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CapacityExceeded,
    DuplicateWorker,
    UnknownWorker,
    UnknownItem,
    InvalidTransition,
    Protocol,
    Internal,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::ConnectionClosed | Error::Io(_)
        )
    }

    /// Check if this error comes from a client misusing the protocol
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Error::DuplicateWorker(_) | Error::UnknownWorker(_) | Error::Protocol(_)
        )
    }

    /// Wire code reported to clients for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Error::DuplicateWorker(_) => ErrorCode::DuplicateWorker,
            Error::UnknownWorker(_) => ErrorCode::UnknownWorker,
            Error::UnknownItem(_) => ErrorCode::UnknownItem,
            Error::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Error::Protocol(_)
            | Error::FrameTooLarge { .. }
            | Error::Deserialization(_) => ErrorCode::Protocol,
            _ => ErrorCode::Internal,
        }
    }

    /// Machine-readable part of the error, sent next to its code
    pub fn detail(&self) -> String {
        match self {
            Error::CapacityExceeded { capacity } => capacity.to_string(),
            Error::DuplicateWorker(id)
            | Error::UnknownWorker(id)
            | Error::UnknownItem(id)
            | Error::Protocol(id) => id.clone(),
            Error::InvalidTransition { item_id, message } => format!("{}: {}", item_id, message),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from the broker
    pub fn from_wire(code: ErrorCode, detail: String) -> Self {
        match code {
            ErrorCode::CapacityExceeded => Error::CapacityExceeded {
                capacity: detail.parse().unwrap_or(0),
            },
            ErrorCode::DuplicateWorker => Error::DuplicateWorker(detail),
            ErrorCode::UnknownWorker => Error::UnknownWorker(detail),
            ErrorCode::UnknownItem => Error::UnknownItem(detail),
            ErrorCode::InvalidTransition => match detail.split_once(": ") {
                Some((item_id, message)) => Error::InvalidTransition {
                    item_id: item_id.to_string(),
                    message: message.to_string(),
                },
                None => Error::InvalidTransition {
                    item_id: String::new(),
                    message: detail,
                },
            },
            ErrorCode::Protocol => Error::Protocol(detail),
            ErrorCode::Internal => Error::Protocol(format!("broker internal error: {}", detail)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}
