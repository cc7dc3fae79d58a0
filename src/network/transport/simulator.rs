//! In-memory transport for tests and local simulations.
//!
//! Nodes register with a shared `SimulatorNetwork`. A dial creates a linked
//! channel pair; each end has an inbox drained by one pump task so events
//! arrive in order, delayed by the network latency. A node that does not
//! accept inbound channels is reached by asking it to dial back: the dialer
//! parks its attempt until the reverse handshake claims it.

use crate::constants::connection::PENDING_ATTEMPT_TIMEOUT;
use crate::error::ConnectionError;
use crate::network::channel::{ChannelEvent, ChannelKind, RawChannel};
use crate::network::events::Listeners;
use crate::network::handshake::{
    AttemptLookup, HandshakeEvent, InboundHandshake, NewConnectionHandler, OutboundHandshake,
};
use crate::network::pending::PendingAttempt;
use crate::network::transport::{TransportCallbacks, TransportFacade};
use crate::types::{IdGenerator, PeerAddress, PeerDescriptor};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Registry of simulated nodes
pub struct SimulatorNetwork {
    nodes: DashMap<PeerAddress, Weak<SimulatorTransport>>,
    latency: Duration,
}

impl SimulatorNetwork {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            latency,
        })
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn register(&self, node: &Arc<SimulatorTransport>) {
        self.nodes
            .insert(node.local.address(), Arc::downgrade(node));
    }

    fn unregister(&self, address: &PeerAddress) {
        self.nodes.remove(address);
    }

    fn node(&self, address: &PeerAddress) -> Option<Arc<SimulatorTransport>> {
        self.nodes.get(address).and_then(|n| n.upgrade())
    }
}

enum Frame {
    Open,
    Data(Vec<u8>),
    Close { graceful: bool },
}

struct Timed {
    at: Instant,
    frame: Frame,
}

type Inbox = mpsc::UnboundedSender<Timed>;

pub struct SimulatorChannel {
    id: String,
    kind: ChannelKind,
    latency: Duration,
    open: AtomicBool,
    terminated: AtomicBool,
    inbox: Inbox,
    peer: Mutex<Option<Inbox>>,
    events: Listeners<ChannelEvent>,
}

impl SimulatorChannel {
    /// Linked (client, server) ends. The server end is open at once; the
    /// client end opens after `open()` plus the latency.
    pub fn pair(ids: &IdGenerator, latency: Duration) -> (Arc<Self>, Arc<Self>) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let pair_id = ids.next_id();

        let client = Arc::new(Self::new(
            format!("sim-{}-c", pair_id),
            ChannelKind::SimulatorClient,
            latency,
            client_tx.clone(),
            false,
        ));
        let server = Arc::new(Self::new(
            format!("sim-{}-s", pair_id),
            ChannelKind::SimulatorServer,
            latency,
            server_tx.clone(),
            true,
        ));
        *client.peer.lock() = Some(server_tx);
        *server.peer.lock() = Some(client_tx);

        tokio::spawn(Self::pump(Arc::downgrade(&client), client_rx));
        tokio::spawn(Self::pump(Arc::downgrade(&server), server_rx));
        (client, server)
    }

    fn new(id: String, kind: ChannelKind, latency: Duration, inbox: Inbox, open: bool) -> Self {
        Self {
            id,
            kind,
            latency,
            open: AtomicBool::new(open),
            terminated: AtomicBool::new(false),
            inbox,
            peer: Mutex::new(None),
            events: Listeners::new(),
        }
    }

    fn stamp(&self, frame: Frame) -> Timed {
        Timed {
            at: Instant::now() + self.latency,
            frame,
        }
    }

    /// Finish opening the client end
    pub fn open(&self) {
        let _ = self.inbox.send(self.stamp(Frame::Open));
    }

    async fn pump(channel: Weak<SimulatorChannel>, mut inbox: mpsc::UnboundedReceiver<Timed>) {
        while let Some(timed) = inbox.recv().await {
            tokio::time::sleep_until(timed.at).await;
            let Some(channel) = channel.upgrade() else {
                break;
            };
            if !channel.deliver(timed.frame) {
                break;
            }
        }
    }

    /// Returns false once the channel is finished
    fn deliver(&self, frame: Frame) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        match frame {
            Frame::Open => {
                self.open.store(true, Ordering::SeqCst);
                self.events.emit(&ChannelEvent::Connected);
                true
            }
            Frame::Data(data) => {
                self.events.emit(&ChannelEvent::Data(data));
                true
            }
            Frame::Close { graceful } => {
                if !self.terminated.swap(true, Ordering::SeqCst) {
                    self.open.store(false, Ordering::SeqCst);
                    self.peer.lock().take();
                    self.events.emit(&ChannelEvent::Disconnected {
                        graceful,
                        code: None,
                        reason: Some("closed by peer".to_string()),
                    });
                }
                false
            }
        }
    }
}

impl RawChannel for SimulatorChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::SendFailed(format!(
                "channel {} is not open",
                self.id
            )));
        }
        let peer = self.peer.lock();
        match peer.as_ref() {
            Some(peer) => peer
                .send(self.stamp(Frame::Data(data)))
                .map_err(|_| ConnectionError::SendFailed(format!("channel {} peer is gone", self.id))),
            None => Err(ConnectionError::SendFailed(format!(
                "channel {} is closed",
                self.id
            ))),
        }
    }

    fn close(&self, graceful: bool) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Some(peer) = self.peer.lock().take() {
            let _ = peer.send(self.stamp(Frame::Close { graceful }));
        }
        self.events.emit(&ChannelEvent::Disconnected {
            graceful,
            code: None,
            reason: None,
        });
    }

    fn destroy(&self) {
        self.events.clear();
        self.close(false);
    }

    fn events(&self) -> &Listeners<ChannelEvent> {
        &self.events
    }
}

/// One simulated node's transport
pub struct SimulatorTransport {
    this: Weak<SimulatorTransport>,
    network: Arc<SimulatorNetwork>,
    local: PeerDescriptor,
    accepts_inbound: bool,
    ids: Arc<IdGenerator>,
    callbacks: RwLock<Option<TransportCallbacks>>,
    stopped: AtomicBool,
    attempts: Mutex<Vec<Weak<PendingAttempt>>>,
    /// Attempts waiting for a peer to dial back, by that peer's address
    ongoing_requests: DashMap<PeerAddress, Arc<PendingAttempt>>,
}

impl SimulatorTransport {
    pub fn new(
        network: Arc<SimulatorNetwork>,
        local: PeerDescriptor,
        accepts_inbound: bool,
        ids: Arc<IdGenerator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            network,
            local,
            accepts_inbound,
            ids,
            callbacks: RwLock::new(None),
            stopped: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
            ongoing_requests: DashMap::new(),
        })
    }

    pub fn accepts_inbound(&self) -> bool {
        self.accepts_inbound
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn callbacks(&self) -> Option<TransportCallbacks> {
        if self.is_stopped() {
            return None;
        }
        self.callbacks.read().clone()
    }

    fn track(&self, attempt: &Arc<PendingAttempt>) {
        let mut attempts = self.attempts.lock();
        attempts.retain(|a| a.upgrade().map(|a| !a.is_stopped()).unwrap_or(false));
        attempts.push(Arc::downgrade(attempt));
    }

    fn dial(&self, target: &Arc<SimulatorTransport>, attempt: Arc<PendingAttempt>) {
        let (client, server) = SimulatorChannel::pair(&self.ids, self.network.latency);
        let remote = attempt.peer().clone();
        trace!("Dialing {} over {}", remote.address(), client.id());

        let handshake = OutboundHandshake::start(
            self.local.clone(),
            client.clone(),
            remote.clone(),
            attempt,
            self.ids.clone(),
        );
        handshake.events().on(move |event| {
            if let HandshakeEvent::Failed(error) = event {
                debug!("🤝 Handshake to {} failed: {:?}", remote.address(), error);
            }
        });

        target.accept_channel(server);
        client.open();
    }

    fn accept_channel(&self, channel: Arc<SimulatorChannel>) {
        let Some(callbacks) = self.callbacks() else {
            channel.destroy();
            return;
        };

        let weak = self.this.clone();
        let lookup: AttemptLookup = Arc::new(move |address: &PeerAddress| {
            let transport = weak.upgrade()?;
            let parked = transport
                .ongoing_requests
                .get(address)
                .map(|a| a.value().clone())?;
            if parked.is_stopped() {
                transport.ongoing_requests.remove(address);
                return None;
            }
            Some(parked)
        });

        let weak = self.this.clone();
        let on_new_connection = callbacks.on_new_connection;
        let gatekeeper: NewConnectionHandler = Arc::new(move |attempt: Arc<PendingAttempt>| {
            match weak.upgrade() {
                Some(transport) if !transport.is_stopped() => {
                    transport.track(&attempt);
                    on_new_connection(attempt)
                }
                _ => false,
            }
        });

        InboundHandshake::start(
            self.local.clone(),
            channel,
            lookup,
            gatekeeper,
            PENDING_ATTEMPT_TIMEOUT,
            self.ids.clone(),
        );
    }

    /// Park `attempt` and ask `target` to dial us
    fn request_reverse_dial(&self, target: &Arc<SimulatorTransport>, attempt: Arc<PendingAttempt>) {
        let address = attempt.peer().address();
        self.ongoing_requests.insert(address.clone(), attempt.clone());

        let weak = self.this.clone();
        let parked = Arc::downgrade(&attempt);
        attempt.events().once(move |_| {
            if let Some(transport) = weak.upgrade() {
                transport
                    .ongoing_requests
                    .remove_if(&address, |_, a| std::ptr::eq(Arc::as_ptr(a), parked.as_ptr()));
            }
        });

        let requester = self.local.clone();
        let target = target.clone();
        let latency = self.network.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            target.on_connection_request(requester);
        });
    }

    fn on_connection_request(&self, requester: PeerDescriptor) {
        let Some(callbacks) = self.callbacks() else {
            return;
        };
        let address = requester.address();
        if (callbacks.has_connection)(&address) {
            debug!("Already connected to {}, ignoring connection request", address);
            return;
        }
        let Some(requester_node) = self.network.node(&address) else {
            debug!("Connection request from unknown node {}", address);
            return;
        };

        let attempt = PendingAttempt::new(requester, PENDING_ATTEMPT_TIMEOUT);
        if !(callbacks.on_new_connection)(attempt.clone()) {
            attempt.destroy();
            return;
        }
        self.track(&attempt);
        self.dial(&requester_node, attempt);
    }
}

#[async_trait]
impl TransportFacade for SimulatorTransport {
    async fn start(&self, callbacks: TransportCallbacks) -> Result<(), ConnectionError> {
        if self.is_stopped() {
            return Err(ConnectionError::CouldNotStart(
                "simulator transport was stopped".into(),
            ));
        }
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| ConnectionError::CouldNotStart("transport dropped".into()))?;
        *self.callbacks.write() = Some(callbacks);
        self.network.register(&this);
        info!(
            "🧪 Simulator node {} online (accepts inbound: {})",
            self.local.address(),
            self.accepts_inbound
        );
        Ok(())
    }

    fn create_connection(
        &self,
        peer: &PeerDescriptor,
        bind: &dyn Fn(Arc<PendingAttempt>) -> bool,
    ) -> Result<Arc<PendingAttempt>, ConnectionError> {
        if self.is_stopped() {
            return Err(ConnectionError::SendFailed("transport is stopped".into()));
        }
        let address = peer.address();
        let target = self
            .network
            .node(&address)
            .ok_or_else(|| ConnectionError::SendFailed(format!("no simulated node {}", address)))?;
        if !target.accepts_inbound && !self.accepts_inbound {
            return Err(ConnectionError::SendFailed(format!(
                "neither this node nor {} accepts connections",
                address
            )));
        }

        let attempt = PendingAttempt::new(peer.clone(), PENDING_ATTEMPT_TIMEOUT);
        if !bind(attempt.clone()) {
            attempt.destroy();
            return Err(ConnectionError::SendFailed(format!(
                "attempt to {} was not accepted",
                address
            )));
        }
        self.track(&attempt);

        if target.accepts_inbound {
            self.dial(&target, attempt.clone());
        } else {
            self.request_reverse_dial(&target, attempt.clone());
        }
        Ok(attempt)
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.local.clone()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.unregister(&self.local.address());
        self.callbacks.write().take();
        self.ongoing_requests.clear();

        let attempts: Vec<Weak<PendingAttempt>> = self.attempts.lock().drain(..).collect();
        for attempt in attempts.iter().filter_map(|a| a.upgrade()) {
            attempt.close(false);
        }
        debug!("🧪 Simulator node {} offline", self.local.address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(channel: &SimulatorChannel) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        channel.events().on(move |event| {
            s.lock().push(match event {
                ChannelEvent::Connected => "connected".to_string(),
                ChannelEvent::Data(d) => format!("data:{}", d.len()),
                ChannelEvent::Disconnected { graceful, .. } => format!("closed:{}", graceful),
                ChannelEvent::Error(e) => format!("error:{}", e),
            });
        });
        seen
    }

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let ids = IdGenerator::new();
        let (client, server) = SimulatorChannel::pair(&ids, Duration::from_millis(5));
        let client_seen = recorder(&client);
        let server_seen = recorder(&server);

        assert!(client.send(vec![1]).is_err());
        client.open();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(client.is_open());

        client.send(vec![1]).unwrap();
        client.send(vec![1, 2]).unwrap();
        client.send(vec![1, 2, 3]).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(*client_seen.lock(), vec!["connected"]);
        assert_eq!(*server_seen.lock(), vec!["data:1", "data:2", "data:3"]);
    }

    #[tokio::test]
    async fn test_close_reaches_peer_once() {
        let ids = IdGenerator::new();
        let (client, server) = SimulatorChannel::pair(&ids, Duration::ZERO);
        let client_seen = recorder(&client);
        let server_seen = recorder(&server);

        server.close(true);
        server.close(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*server_seen.lock(), vec!["closed:true"]);
        assert_eq!(*client_seen.lock(), vec!["closed:true"]);
        assert!(server.send(vec![1]).is_err());
    }

    #[tokio::test]
    async fn test_destroy_is_silent_locally() {
        let ids = IdGenerator::new();
        let (client, server) = SimulatorChannel::pair(&ids, Duration::ZERO);
        let client_seen = recorder(&client);
        let server_seen = recorder(&server);

        server.destroy();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(server_seen.lock().is_empty());
        assert_eq!(*client_seen.lock(), vec!["closed:false"]);
    }

    fn callbacks(accepted: Arc<AtomicUsize>) -> TransportCallbacks {
        TransportCallbacks {
            on_new_connection: Arc::new(move |_: Arc<PendingAttempt>| {
                accepted.fetch_add(1, Ordering::SeqCst);
                true
            }),
            has_connection: Arc::new(|_: &PeerAddress| false),
        }
    }

    #[tokio::test]
    async fn test_unknown_node_has_no_route() {
        let network = SimulatorNetwork::new(Duration::ZERO);
        let ids = Arc::new(IdGenerator::new());
        let node = SimulatorTransport::new(network, PeerDescriptor::new(vec![1]), true, ids);
        node.start(callbacks(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();

        let result = node.create_connection(&PeerDescriptor::new(vec![9]), &|_: Arc<PendingAttempt>| true);
        assert!(matches!(result, Err(ConnectionError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_dial_completes_on_both_sides() {
        let network = SimulatorNetwork::new(Duration::from_millis(2));
        let ids = Arc::new(IdGenerator::new());
        let a = SimulatorTransport::new(network.clone(), PeerDescriptor::new(vec![1]), true, ids.clone());
        let b = SimulatorTransport::new(network.clone(), PeerDescriptor::new(vec![2]), true, ids);
        a.start(callbacks(Arc::new(AtomicUsize::new(0)))).await.unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        b.start(callbacks(accepted.clone())).await.unwrap();
        assert_eq!(network.node_count(), 2);

        let attempt = a
            .create_connection(&PeerDescriptor::new(vec![2]), &|_: Arc<PendingAttempt>| true)
            .unwrap();
        let connected = Arc::new(AtomicBool::new(false));
        let c = connected.clone();
        attempt.events().on(move |event| {
            if let crate::network::pending::AttemptEvent::Connected { .. } = event {
                c.store(true, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connected.load(Ordering::SeqCst));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        b.stop().await;
        assert_eq!(network.node_count(), 1);
    }
}
