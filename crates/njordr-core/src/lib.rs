//! njordr core - shared types for the njordr job broker
//!
//! This crate provides the pieces both the broker and the services use:
//! - Work item and worker definitions
//! - The broker/worker message protocol and its framing
//! - Configuration structures
//! - Error types
//! - Mutual TLS for the transport

pub mod config;
pub mod error;
pub mod frame;
pub mod item;
pub mod message;
pub mod tls;
pub mod worker;

pub use config::{BrokerConfig, LogFormat, LoggingConfig, NjordrConfig, ServiceConfig};
pub use error::{Error, ErrorCode, Result};
pub use frame::{read_frame, write_frame};
pub use item::{Assignment, ItemId, ItemStatus, Outcome, WorkItem};
pub use message::{BrokerMessage, ClientMessage, ReportDisposition, Serializer};
pub use tls::{BoxedTransport, TlsConfig};
pub use worker::{WorkerHealth, WorkerId};
