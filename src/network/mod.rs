pub mod channel;
pub mod connection_manager;
pub mod connectivity;
pub mod dedup_filter;
pub mod events;
pub mod handshake;
pub mod lock_rpc;
pub mod lock_table;
pub mod message;
pub mod offerer;
pub mod pending;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod wire;
