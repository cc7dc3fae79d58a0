//! Connection manager: owns one session per peer address, routes outbound
//! envelopes, admits inbound attempts and runs the lock protocol.
//!
//! Lifecycle is `Idle -> Running -> Stopping -> Stopped`. The session table
//! sits behind a reentrant lock: admitting an attempt can close an old
//! channel whose events call back into the table on the same thread. RefCell
//! borrows of the table are kept short and never span a call into a session.

use crate::constants::connection::{
    DUPLICATE_WINDOW_SIZE, GRACEFUL_DISCONNECT_TIMEOUT,
};
use crate::constants::protocol::CONNECTION_MANAGER_SERVICE_ID;
use crate::error::ConnectionError;
use crate::network::connectivity::request_timeout;
use crate::network::dedup_filter::DuplicateMessageWindow;
use crate::network::events::Listeners;
use crate::network::lock_rpc::{LockRpcClient, LockRpcServer};
use crate::network::lock_table::{LockKind, LockTable};
use crate::network::message::{DisconnectMode, Message};
use crate::network::offerer::{offerer, Offerer};
use crate::network::pending::PendingAttempt;
use crate::network::rpc::{OutgoingSender, RpcCommunicator, SendOptions};
use crate::network::session::{Session, SessionEvent};
use crate::network::transport::{TransportCallbacks, TransportFacade};
use crate::network::wire;
use crate::types::{IdGenerator, PeerAddress, PeerDescriptor};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Application envelope from a connected peer
    Message(Message),
    Connected(PeerDescriptor),
    Disconnected {
        peer: PeerDescriptor,
        graceful: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub duplicate_window_size: usize,
    pub graceful_disconnect_timeout: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            duplicate_window_size: DUPLICATE_WINDOW_SIZE,
            graceful_disconnect_timeout: GRACEFUL_DISCONNECT_TIMEOUT,
        }
    }
}

type SessionTable = ReentrantMutex<RefCell<HashMap<PeerAddress, Arc<Session>>>>;

pub struct ConnectionManager {
    this: Weak<ConnectionManager>,
    config: ConnectionManagerConfig,
    state: Mutex<ManagerState>,
    transport: Arc<dyn TransportFacade>,
    sessions: SessionTable,
    locks: Arc<LockTable>,
    duplicates: DuplicateMessageWindow,
    rpc: RpcCommunicator,
    events: Listeners<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionManagerConfig,
        transport: Arc<dyn TransportFacade>,
        ids: Arc<IdGenerator>,
    ) -> Arc<Self> {
        let locks = Arc::new(LockTable::new());
        let local = transport.local_peer_descriptor().address();

        let manager = Arc::new_cyclic(|this: &Weak<ConnectionManager>| {
            let weak = this.clone();
            let outgoing: OutgoingSender = Arc::new(move |message: Message, options: SendOptions| {
                match weak.upgrade() {
                    Some(manager) => manager.send(message, options),
                    None => Err(ConnectionError::SendFailed("connection manager dropped".into())),
                }
            });

            Self {
                this: this.clone(),
                duplicates: DuplicateMessageWindow::new(config.duplicate_window_size),
                config,
                state: Mutex::new(ManagerState::Idle),
                transport,
                sessions: ReentrantMutex::new(RefCell::new(HashMap::new())),
                locks: locks.clone(),
                rpc: RpcCommunicator::new(CONNECTION_MANAGER_SERVICE_ID, ids, outgoing),
                events: Listeners::new(),
            }
        });

        let weak = Arc::downgrade(&manager);
        let server = Arc::new(LockRpcServer::new(
            local,
            locks,
            Arc::new(move |peer: &PeerDescriptor, graceful: bool| {
                if let Some(manager) = weak.upgrade() {
                    manager.close_connection(peer, graceful, "graceful disconnect notice");
                }
            }),
        ));
        server.register(&manager.rpc);

        manager
    }

    pub fn events(&self) -> &Listeners<ManagerEvent> {
        &self.events
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    fn is_stopping_or_stopped(&self) -> bool {
        matches!(self.state(), ManagerState::Stopping | ManagerState::Stopped)
    }

    pub async fn start(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock();
            if *state != ManagerState::Idle {
                return Err(ConnectionError::CouldNotStart(format!(
                    "connection manager is {:?}",
                    *state
                )));
            }
            *state = ManagerState::Running;
        }

        let on_new = self.this.clone();
        let has = self.this.clone();
        let callbacks = TransportCallbacks {
            on_new_connection: Arc::new(move |attempt: Arc<PendingAttempt>| {
                on_new
                    .upgrade()
                    .map(|manager| manager.accept_new_connection(attempt))
                    .unwrap_or(false)
            }),
            has_connection: Arc::new(move |peer: &PeerAddress| {
                has.upgrade()
                    .map(|manager| manager.has_connection(peer))
                    .unwrap_or(false)
            }),
        };

        if let Err(e) = self.transport.start(callbacks).await {
            *self.state.lock() = ManagerState::Stopped;
            return Err(ConnectionError::CouldNotStart(e.to_string()));
        }

        info!(
            "🔌 Connection manager started as {}",
            self.local_peer_descriptor().address()
        );
        Ok(())
    }

    pub fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.transport.local_peer_descriptor()
    }

    /// Same node id, or our own listening endpoint
    pub fn is_connection_to_self(&self, peer: &PeerDescriptor) -> bool {
        let local = self.local_peer_descriptor();
        local == *peer || local.shares_websocket_endpoint(peer)
    }

    fn session(&self, peer: &PeerAddress) -> Option<Arc<Session>> {
        self.sessions.lock().borrow().get(peer).cloned()
    }

    /// Route an envelope to its target, dialing if allowed
    pub fn send(&self, mut message: Message, options: SendOptions) -> Result<(), ConnectionError> {
        if self.is_stopping_or_stopped() && !options.send_if_stopped {
            return Err(ConnectionError::SendFailed(
                "connection manager is stopped".into(),
            ));
        }
        let target = message
            .target
            .clone()
            .ok_or_else(|| ConnectionError::SendFailed("message has no target".into()))?;
        if self.is_connection_to_self(&target) {
            return Err(ConnectionError::CannotConnectToSelf(format!(
                "{} is the local node",
                target.address()
            )));
        }
        let address = target.address();
        message.source = Some(self.local_peer_descriptor());

        let session = {
            let table = self.sessions.lock();
            let existing = table.borrow().get(&address).cloned();
            match existing {
                Some(session) => Some(session),
                None if options.connect => {
                    if let Err(e) = self
                        .transport
                        .create_connection(&target, &|attempt: Arc<PendingAttempt>| {
                            self.accept_new_connection(attempt)
                        })
                    {
                        debug!("Could not open connection to {}: {}", address, e);
                    }
                    table.borrow().get(&address).cloned()
                }
                None => None,
            }
        };

        let session = session.ok_or_else(|| {
            ConnectionError::SendFailed(format!("no connection to {}", address))
        })?;
        if !options.connect && !session.is_connected() {
            return Err(ConnectionError::SendFailed(format!(
                "{} is not connected",
                address
            )));
        }

        let bytes = wire::serialize_message(&message)
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
        trace!(
            "📤 Sending {} ({} bytes) to {}",
            message.service_id,
            bytes.len(),
            address
        );
        session.send(bytes)
    }

    /// Gatekeeper for new attempts. Resolves simultaneous connections with
    /// the deterministic offerer: the replacement is accepted only when the
    /// remote side is the offerer.
    pub fn accept_new_connection(&self, attempt: Arc<PendingAttempt>) -> bool {
        if self.state() != ManagerState::Running {
            debug!(
                "Refusing attempt from {}: manager is {:?}",
                attempt.peer().address(),
                self.state()
            );
            return false;
        }
        let address = attempt.peer().address();
        let local = self.local_peer_descriptor().address();

        let table = self.sessions.lock();
        let existing = table.borrow().get(&address).cloned();
        match existing {
            Some(session) => match offerer(&local, &address) {
                Offerer::Remote => {
                    debug!("🔀 Replacing connection to {} (remote offers)", address);
                    session.set_connecting(attempt)
                }
                Offerer::Local => {
                    debug!("🔀 Keeping existing connection to {} (local offers)", address);
                    false
                }
            },
            None => {
                let session = Session::new(attempt.peer().clone());
                self.bind_session(&session);
                table.borrow_mut().insert(address, session.clone());
                session.set_connecting(attempt)
            }
        }
    }

    fn bind_session(&self, session: &Arc<Session>) {
        let manager = self.this.clone();
        let weak_session = Arc::downgrade(session);
        session.events().on(move |event| {
            let (Some(manager), Some(session)) = (manager.upgrade(), weak_session.upgrade()) else {
                return;
            };
            match event {
                SessionEvent::Data(bytes) => manager.on_data(session.peer(), bytes),
                SessionEvent::Connected => {
                    info!("🔗 Connected to {}", session.peer().address());
                    manager
                        .events
                        .emit(&ManagerEvent::Connected(session.peer().clone()));
                }
                SessionEvent::Disconnected { graceful } => {
                    manager.on_session_disconnected(&session, *graceful)
                }
            }
        });
    }

    fn on_session_disconnected(&self, session: &Arc<Session>, graceful: bool) {
        let address = session.peer().address();
        let removed = {
            let table = self.sessions.lock();
            let mut map = table.borrow_mut();
            let is_current = map
                .get(&address)
                .map(|current| Arc::ptr_eq(current, session))
                .unwrap_or(false);
            if is_current {
                map.remove(&address)
            } else {
                None
            }
        };
        if removed.is_none() {
            return;
        }
        self.locks.clear_all_locks(&address);
        info!(
            "🔌 Disconnected from {} (graceful: {})",
            address, graceful
        );
        self.events.emit(&ManagerEvent::Disconnected {
            peer: session.peer().clone(),
            graceful,
        });
    }

    fn on_data(&self, peer: &PeerDescriptor, bytes: &[u8]) {
        match wire::parse_message(bytes) {
            Ok(mut message) => {
                message.source = Some(peer.clone());
                self.handle_message(message);
            }
            Err(e) => warn!("Dropping unparsable data from {}: {}", peer.address(), e),
        }
    }

    fn handle_message(&self, message: Message) {
        if message.rpc().is_none() {
            trace!(
                "Dropping {} without RPC payload from {:?}",
                message.message_type(),
                message.source.as_ref().map(|s| s.address())
            );
            return;
        }
        if self.duplicates.check_and_insert(&message.message_id) {
            trace!("Dropping duplicate message {}", message.message_id);
            return;
        }
        if message.service_id == CONNECTION_MANAGER_SERVICE_ID {
            self.rpc.handle_message_from_peer(&message);
        } else {
            self.events.emit(&ManagerEvent::Message(message));
        }
    }

    /// Drop locks and close the session to `peer`
    pub fn close_connection(&self, peer: &PeerDescriptor, graceful: bool, reason: &str) {
        if self.state() == ManagerState::Stopped {
            return;
        }
        let address = peer.address();
        debug!(
            "Closing connection to {} (graceful: {}): {}",
            address, graceful, reason
        );
        self.locks.clear_all_locks(&address);
        match self.session(&address) {
            Some(session) => session.close(graceful),
            None => {
                self.events.emit(&ManagerEvent::Disconnected {
                    peer: peer.clone(),
                    graceful: false,
                });
            }
        }
    }

    async fn gracefully_disconnect(&self, session: Arc<Session>, mode: DisconnectMode) {
        let address = session.peer().address();
        if !session.is_connected() {
            session.close(false);
            return;
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let listener = session.events().on(move |event| {
            if let SessionEvent::Disconnected { .. } = event {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        let client = LockRpcClient::new(&self.rpc, session.peer());
        let notified = client.graceful_disconnect(mode);
        let closed_by_peer = match notified {
            Ok(()) => matches!(
                tokio::time::timeout(self.config.graceful_disconnect_timeout, rx).await,
                Ok(Ok(()))
            ),
            Err(e) => {
                debug!("Disconnect notice to {} failed: {}", address, e);
                false
            }
        };
        session.events().off(listener);

        if !closed_by_peer {
            debug!("⏱️  {} did not hang up, forcing close", address);
            session.close(false);
        }
    }

    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ManagerState::Stopping | ManagerState::Stopped => return,
                ManagerState::Idle => {
                    *state = ManagerState::Stopped;
                    return;
                }
                ManagerState::Running => *state = ManagerState::Stopping,
            }
        }
        info!("🛑 Stopping connection manager");

        let sessions: Vec<Arc<Session>> = {
            let table = self.sessions.lock();
            let snapshot = table.borrow().values().cloned().collect();
            snapshot
        };
        for session in sessions {
            self.gracefully_disconnect(session, DisconnectMode::Leaving)
                .await;
        }

        self.transport.stop().await;

        let leftovers: Vec<Arc<Session>> = {
            let table = self.sessions.lock();
            let drained = table.borrow_mut().drain().map(|(_, s)| s).collect();
            drained
        };
        for session in leftovers {
            session.close(false);
        }

        self.duplicates.clear();
        self.locks.clear();
        self.rpc.cancel_pending();
        self.events.clear();
        *self.state.lock() = ManagerState::Stopped;
        info!("✅ Connection manager stopped");
    }

    // Locking

    /// Record a local lock and mirror it to the peer. Waits for the peer's
    /// answer; failures are logged only.
    pub async fn lock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        if self.is_stopping_or_stopped() || self.is_connection_to_self(peer) {
            return;
        }
        let address = peer.address();
        self.locks.add_local_locked(&address, lock_id);

        let timeout = request_timeout(
            &self.local_peer_descriptor(),
            peer,
            self.has_connection(&address),
        );
        match LockRpcClient::new(&self.rpc, peer).lock(lock_id, timeout).await {
            Ok(true) => debug!("🔒 {} accepted lock {}", address, lock_id),
            Ok(false) => debug!("🔒 {} refused lock {}", address, lock_id),
            Err(e) => error!("❌ Lock request {} to {} failed: {}", lock_id, address, e),
        }
    }

    pub fn unlock_connection(&self, peer: &PeerDescriptor, lock_id: &str) {
        if self.is_stopping_or_stopped() || self.is_connection_to_self(peer) {
            return;
        }
        let address = peer.address();
        self.locks.remove_local_locked(&address, lock_id);
        if self.session(&address).is_some() {
            if let Err(e) = LockRpcClient::new(&self.rpc, peer).unlock(lock_id) {
                debug!("Unlock notice {} to {} failed: {}", lock_id, address, e);
            }
        }
    }

    pub fn weak_lock_connection(&self, peer: &PeerAddress, lock_id: &str) {
        if self.is_stopping_or_stopped() || *peer == self.local_peer_descriptor().address() {
            return;
        }
        self.locks.add_weak_locked(peer, lock_id);
    }

    pub fn weak_unlock_connection(&self, peer: &PeerAddress, lock_id: &str) {
        if self.is_stopping_or_stopped() || *peer == self.local_peer_descriptor().address() {
            return;
        }
        self.locks.remove_weak_locked(peer, lock_id);
    }

    pub fn has_local_locked_connection(&self, peer: &PeerAddress, lock_id: Option<&str>) -> bool {
        self.locks.is_locked_by(LockKind::Local, peer, lock_id)
    }

    pub fn has_remote_locked_connection(&self, peer: &PeerAddress, lock_id: Option<&str>) -> bool {
        self.locks.is_locked_by(LockKind::Remote, peer, lock_id)
    }

    pub fn has_weak_locked_connection(&self, peer: &PeerAddress, lock_id: Option<&str>) -> bool {
        self.locks.is_locked_by(LockKind::Weak, peer, lock_id)
    }

    /// Locked of any kind
    pub fn is_locked(&self, peer: &PeerAddress) -> bool {
        self.locks.is_locked(peer)
    }

    pub fn get_local_locked_connection_count(&self) -> usize {
        self.locks.count(LockKind::Local)
    }

    pub fn get_remote_locked_connection_count(&self) -> usize {
        self.locks.count(LockKind::Remote)
    }

    pub fn get_weak_locked_connection_count(&self) -> usize {
        self.locks.count(LockKind::Weak)
    }

    // Connection queries; only sessions in Connected count

    pub fn get_connections(&self) -> Vec<PeerDescriptor> {
        let table = self.sessions.lock();
        let map = table.borrow();
        map.values()
            .filter(|s| s.is_connected())
            .map(|s| s.peer().clone())
            .collect()
    }

    pub fn get_connection_count(&self) -> usize {
        let table = self.sessions.lock();
        let map = table.borrow();
        map.values().filter(|s| s.is_connected()).count()
    }

    pub fn has_connection(&self, peer: &PeerAddress) -> bool {
        self.session(peer).map(|s| s.is_connected()).unwrap_or(false)
    }
}
