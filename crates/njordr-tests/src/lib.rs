//! njordr end-to-end tests
//!
//! Every test runs a real broker on an ephemeral loopback port and talks
//! to it over TCP, so nothing external is needed.
//! Run with: `cargo test -p njordr-tests`

pub mod common;
