//! hostpulse_agent: host-resident telemetry service.
//!
//! Samples machine health (cpu, memory, disk, network, sensors) and serves it
//! to local clients over a WebSocket RPC channel: snapshots, a configurable
//! push stream, TTL-bounded bursts, and retained history with time-bucketed
//! aggregation.

pub mod collectors;
pub mod config;
pub mod error;
pub mod history;
pub mod push;
pub mod rpc;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod types;
pub mod ws;

pub use config::Config;
pub use state::AppState;
