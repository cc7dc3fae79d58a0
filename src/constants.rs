//! Protocol constants for the connection layer
//!
//! Centralizes the magic numbers shared between peers. Anything in
//! `protocol` must match on both ends of a connection.

/// Wire-level protocol constants
pub mod protocol {
    /// Version advertised in handshakes ("major.minor")
    pub const LOCAL_PROTOCOL_VERSION: &str = "1.1";

    /// Service id carried by handshake envelopes
    pub const HANDSHAKE_SERVICE_ID: &str = "system/handshaker";

    /// Reserved service id for lock and disconnect control messages
    pub const CONNECTION_MANAGER_SERVICE_ID: &str = "system/connection-manager";

    /// Upper bound for a single encoded envelope (4 MiB)
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
}

/// Connection lifecycle limits
pub mod connection {
    use std::time::Duration;

    /// Number of message ids remembered for duplicate suppression
    pub const DUPLICATE_WINDOW_SIZE: usize = 10_000;

    /// A pending attempt closes itself after this long
    pub const PENDING_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

    /// How long a graceful disconnect waits for the peer to hang up
    pub const GRACEFUL_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);

    /// Dial timeout for outgoing websocket connections
    pub const WEBSOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// RPC timeouts, chosen by how the connection is expected to be opened
pub mod rpc {
    use std::time::Duration;

    /// Direct dial to the peer's websocket server
    pub const WEBSOCKET_CLIENT_TIMEOUT: Duration = Duration::from_millis(5_000);

    /// Peer has to dial us back first
    pub const WEBSOCKET_SERVER_TIMEOUT: Duration = Duration::from_millis(7_500);

    /// WebRTC needs signalling before the channel opens
    pub const WEBRTC_TIMEOUT: Duration = Duration::from_millis(10_000);

    /// Connection is already open
    pub const EXISTING_CONNECTION_TIMEOUT: Duration = Duration::from_millis(5_000);

    /// Default for the connection manager's RPC substrate
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}
