//! duo pairing server: anonymous one-to-one matchmaking with a WebRTC
//! handshake relay.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Report ledger, ban set and the threshold linking them.
pub mod abuse;
/// CLI argument parsing, server configuration and matching policy.
pub mod config;
mod connection;
/// Error types for transport operations.
pub mod error;
/// Serializes connections onto the engine and fans out its events.
pub mod hub;
/// The pairing engine.
pub mod matchmaker;
/// Prometheus metrics, health checks and read-only admin endpoints.
pub mod metrics;
/// Per-session action cooldowns.
pub mod ratelimit;
mod reaper;
/// Time-boxed memory of recent pairings.
pub mod recent;
/// Live sessions keyed by id.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
