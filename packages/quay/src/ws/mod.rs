//! Multiplexed WebSocket layer.
//!
//! One logical session per (connection type, resumption token), carried by
//! at most one live transport at a time:
//! - `protocol` defines the upgrade parameters and wire envelopes
//! - `transport` owns the socket after the upgrade (writer task, framing)
//! - `handler` drives the connection lifecycle against the registry

pub mod handler;
pub mod protocol;
pub mod transport;

pub use handler::{handle_upgrade, SESSION_HEADER};
pub use protocol::{ConnectionType, UpgradeParams};
