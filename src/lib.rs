//! Peer connection lifecycle for a P2P node: handshakes, per-peer sessions,
//! connection locks, duplicate suppression and graceful disconnects over
//! pluggable transports.

pub mod config;
pub mod constants;
pub mod error;
pub mod network;
pub mod shutdown;
pub mod types;
