//! njordr service - the worker side of the job broker
//!
//! This crate provides:
//! - A framed client for the broker transport
//! - Job handlers and their execution
//! - The worker runtime: registration, heartbeats and reporting

pub mod client;
pub mod executor;
pub mod runtime;

pub use client::BrokerClient;
pub use executor::{HandlerRegistry, JobExecutor, JobHandler, JobOutcome};
pub use runtime::{start_identities, RuntimeStats, ServiceRuntime, ShutdownHandle};
