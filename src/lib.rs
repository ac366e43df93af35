//! Snapwire Server Library
//!
//! Authoritative server core for fast-paced multiplayer games over UDP:
//! a connection state machine, reliable commands layered on unreliable
//! datagrams, and per-client delta-compressed world snapshots paced to each
//! client's bandwidth.
//!
//! The core in [`server`] is sans-IO. [`net::transport`] drives it from a
//! tokio UDP socket and a fixed-rate tick loop.
//!
//! # Features
//!
//! - `metrics_http` - Prometheus/JSON metrics endpoint started by the binary (enabled by default)

pub mod config;
pub mod filter;
pub mod metrics;
pub mod net;
pub mod server;
pub mod snapshot;
pub mod util;
pub mod world;
