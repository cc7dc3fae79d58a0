//! Transports produce raw channels and run handshakes on them. The
//! connection manager only sees pending attempts.

pub mod simulator;
pub mod websocket;

use crate::error::ConnectionError;
use crate::network::handshake::NewConnectionHandler;
use crate::network::pending::PendingAttempt;
use crate::types::{PeerAddress, PeerDescriptor};
use async_trait::async_trait;
use std::sync::Arc;

pub use simulator::{SimulatorNetwork, SimulatorTransport};
pub use websocket::WebSocketTransport;

pub type HasConnection = Arc<dyn Fn(&PeerAddress) -> bool + Send + Sync>;

/// Callbacks the connection manager hands to its transport on start
#[derive(Clone)]
pub struct TransportCallbacks {
    /// Gatekeeper for attempts created by remote peers
    pub on_new_connection: NewConnectionHandler,
    pub has_connection: HasConnection,
}

#[async_trait]
pub trait TransportFacade: Send + Sync {
    async fn start(&self, callbacks: TransportCallbacks) -> Result<(), ConnectionError>;

    /// Create an attempt to `peer` and offer it to `bind` before any I/O
    /// starts, so the attempt cannot complete unobserved. Dialing only begins
    /// if `bind` accepts. Fails with `SendFailed` when there is no route.
    fn create_connection(
        &self,
        peer: &PeerDescriptor,
        bind: &dyn Fn(Arc<PendingAttempt>) -> bool,
    ) -> Result<Arc<PendingAttempt>, ConnectionError>;

    fn local_peer_descriptor(&self) -> PeerDescriptor;

    /// Close ongoing attempts. No new attempts are offered afterwards.
    async fn stop(&self);
}
