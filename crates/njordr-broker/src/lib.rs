//! njordr broker - coordinates work items and service processes
//!
//! - [`registry`]: the queue and worker state machine
//! - [`state`]: shared state, metrics and worker channels around the registry
//! - [`server`]: TCP transport, dispatch loop and liveness sweep
//! - [`api`]: admin HTTP API

pub mod api;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod state;

pub use registry::{Registry, RegistryConfig, RegistryStats, SweepReport, WorkerHandle, WorkerInfo};
pub use server::BrokerServer;
pub use state::BrokerState;
