//! Raw byte channels produced by transports.
//!
//! A channel is owned by exactly one of a pending attempt or a session at a
//! time; ownership moves on handshake completion.

use crate::error::ConnectionError;
use crate::network::events::Listeners;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    WsServer,
    WsClient,
    WebRtc,
    SimulatorServer,
    SimulatorClient,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::WsServer => "websocket-server",
            ChannelKind::WsClient => "websocket-client",
            ChannelKind::WebRtc => "webrtc",
            ChannelKind::SimulatorServer => "simulator-server",
            ChannelKind::SimulatorClient => "simulator-client",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The underlying transport finished opening
    Connected,
    Data(Vec<u8>),
    /// Terminal; fires at most once per channel
    Disconnected {
        graceful: bool,
        code: Option<u16>,
        reason: Option<String>,
    },
    Error(String),
}

/// Duplex byte pipe to one peer over one transport attempt.
///
/// Implementations deliver inbound events from a single task, in the order
/// the transport produced them. `send` only enqueues and never runs listeners
/// on the caller's stack, so it may be called while holding a lock.
pub trait RawChannel: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    fn is_open(&self) -> bool;

    fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError>;

    /// Close and emit Disconnected (once)
    fn close(&self, graceful: bool);

    /// Drop all listeners, then close without emitting
    fn destroy(&self);

    fn events(&self) -> &Listeners<ChannelEvent>;
}

impl fmt::Debug for dyn RawChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChannel")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("open", &self.is_open())
            .finish()
    }
}
