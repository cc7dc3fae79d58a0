//! WebSocket transport over tokio-tungstenite.
//!
//! A node with a websocket endpoint in its descriptor listens on it; any node
//! can dial peers that advertise one. Each channel runs a reader task that
//! emits events in arrival order and a writer task fed by an unbounded queue,
//! so `send` and `close` never block. Close code 1001 (going away) marks a
//! graceful leave.

use crate::constants::connection::{PENDING_ATTEMPT_TIMEOUT, WEBSOCKET_CONNECT_TIMEOUT};
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
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

enum Outgoing {
    Data(Vec<u8>),
    Close { graceful: bool },
}

pub struct WebSocketChannel {
    id: String,
    kind: ChannelKind,
    open: AtomicBool,
    terminated: AtomicBool,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    reading: Mutex<Option<oneshot::Sender<()>>>,
    events: Listeners<ChannelEvent>,
}

impl WebSocketChannel {
    /// Take over an established websocket and start its I/O tasks.
    /// Incoming frames stay on the socket until `start_reading` is called,
    /// so the first frame cannot reach an empty listener set.
    pub fn spawn<S>(ws: WebSocketStream<S>, kind: ChannelKind, id: String) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = oneshot::channel();
        let channel = Arc::new(Self {
            id,
            kind,
            open: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            outgoing: tx,
            reading: Mutex::new(Some(start_tx)),
            events: Listeners::new(),
        });

        let (sink, stream) = ws.split();
        tokio::spawn(Self::write_loop(Arc::downgrade(&channel), sink, rx));
        tokio::spawn(Self::read_loop(Arc::downgrade(&channel), stream, start_rx));
        channel
    }

    /// Release the reader task once listeners are attached
    pub fn start_reading(&self) {
        if let Some(start) = self.reading.lock().take() {
            let _ = start.send(());
        }
    }

    async fn write_loop<S>(
        channel: Weak<WebSocketChannel>,
        mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(item) = rx.recv().await {
            match item {
                Outgoing::Data(data) => {
                    if let Err(e) = sink.send(WsMessage::Binary(data.into())).await {
                        if let Some(channel) = channel.upgrade() {
                            channel.events.emit(&ChannelEvent::Error(e.to_string()));
                            channel.terminate(false, None, Some(e.to_string()));
                        }
                        break;
                    }
                }
                Outgoing::Close { graceful } => {
                    let frame = CloseFrame {
                        code: if graceful {
                            CloseCode::Away
                        } else {
                            CloseCode::Normal
                        },
                        reason: "".into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }

    async fn read_loop<S>(
        channel: Weak<WebSocketChannel>,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
        start: oneshot::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if start.await.is_err() {
            return;
        }
        while let Some(next) = stream.next().await {
            let Some(channel) = channel.upgrade() else {
                return;
            };
            if channel.terminated.load(Ordering::SeqCst) {
                return;
            }
            match next {
                Ok(WsMessage::Binary(bytes)) => {
                    channel.events.emit(&ChannelEvent::Data(bytes.to_vec()));
                }
                Ok(WsMessage::Close(frame)) => {
                    let (graceful, code, reason) = match frame {
                        Some(frame) => (
                            frame.code == CloseCode::Away,
                            Some(u16::from(frame.code)),
                            Some(frame.reason.as_str().to_string()),
                        ),
                        None => (false, None, None),
                    };
                    channel.terminate(graceful, code, reason);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket {} read error: {}", channel.id, e);
                    channel.events.emit(&ChannelEvent::Error(e.to_string()));
                    channel.terminate(false, None, Some(e.to_string()));
                    return;
                }
            }
        }
        if let Some(channel) = channel.upgrade() {
            channel.terminate(false, None, Some("stream ended".to_string()));
        }
    }

    /// Remote side or I/O ended the channel
    fn terminate(&self, graceful: bool, code: Option<u16>, reason: Option<String>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outgoing.send(Outgoing::Close { graceful: false });
        self.events.emit(&ChannelEvent::Disconnected {
            graceful,
            code,
            reason,
        });
    }
}

impl RawChannel for WebSocketChannel {
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
                "websocket {} is closed",
                self.id
            )));
        }
        self.outgoing
            .send(Outgoing::Data(data))
            .map_err(|_| ConnectionError::SendFailed(format!("websocket {} writer stopped", self.id)))
    }

    fn close(&self, graceful: bool) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outgoing.send(Outgoing::Close { graceful });
        self.start_reading();
        let code = if graceful {
            CloseCode::Away
        } else {
            CloseCode::Normal
        };
        self.events.emit(&ChannelEvent::Disconnected {
            graceful,
            code: Some(u16::from(code)),
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

pub struct WebSocketTransport {
    this: Weak<WebSocketTransport>,
    local: RwLock<PeerDescriptor>,
    ids: Arc<IdGenerator>,
    callbacks: RwLock<Option<TransportCallbacks>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    attempts: Mutex<Vec<Weak<PendingAttempt>>>,
}

impl WebSocketTransport {
    /// Listens on `local.websocket` when present; otherwise client-only
    pub fn new(local: PeerDescriptor, ids: Arc<IdGenerator>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local: RwLock::new(local),
            ids,
            callbacks: RwLock::new(None),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
        })
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

    fn channel_id(&self, kind: ChannelKind) -> String {
        format!("{}-{}", kind, self.ids.next_id())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("📡 WebSocket connection from {}", addr);
                        let transport = self.clone();
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws) => {
                                    let id = transport.channel_id(ChannelKind::WsServer);
                                    let channel = WebSocketChannel::spawn(ws, ChannelKind::WsServer, id);
                                    transport.accept_channel(channel);
                                }
                                Err(e) => debug!("WebSocket upgrade from {} failed: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => error!("WebSocket accept error: {}", e),
                },
                _ = self.shutdown.cancelled() => {
                    info!("🛑 WebSocket server shutting down");
                    break;
                }
            }
        }
    }

    fn accept_channel(&self, channel: Arc<WebSocketChannel>) {
        let Some(callbacks) = self.callbacks() else {
            channel.destroy();
            return;
        };

        // Nothing is parked for reverse connections on this transport
        let lookup: AttemptLookup = Arc::new(|_: &PeerAddress| None);
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
            self.local_peer_descriptor(),
            channel.clone(),
            lookup,
            gatekeeper,
            PENDING_ATTEMPT_TIMEOUT,
            self.ids.clone(),
        );
        channel.start_reading();
    }

    async fn dial(self: Arc<Self>, url: String, attempt: Arc<PendingAttempt>) {
        let connect = tokio::time::timeout(
            WEBSOCKET_CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let result = tokio::select! {
            result = connect => result,
            _ = self.shutdown.cancelled() => return,
        };

        let ws = match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                debug!("WebSocket dial to {} failed: {}", url, e);
                attempt.on_error(ConnectionError::SendFailed(e.to_string()));
                attempt.close(false);
                return;
            }
            Err(_) => {
                debug!("⏱️  WebSocket dial to {} timed out", url);
                attempt.close(false);
                return;
            }
        };
        if attempt.is_stopped() {
            trace!("Attempt to {} ended while dialing", url);
            return;
        }

        let id = self.channel_id(ChannelKind::WsClient);
        let channel = WebSocketChannel::spawn(ws, ChannelKind::WsClient, id);
        let remote = attempt.peer().clone();
        let handshake = OutboundHandshake::start(
            self.local_peer_descriptor(),
            channel.clone(),
            remote.clone(),
            attempt,
            self.ids.clone(),
        );
        handshake.events().on(move |event| {
            if let HandshakeEvent::Failed(error) = event {
                warn!("🤝 Handshake to {} failed: {:?}", remote.address(), error);
            }
        });
        channel.start_reading();
    }
}

#[async_trait]
impl TransportFacade for WebSocketTransport {
    async fn start(&self, callbacks: TransportCallbacks) -> Result<(), ConnectionError> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| ConnectionError::CouldNotStart("transport dropped".into()))?;
        if self.is_stopped() {
            return Err(ConnectionError::CouldNotStart(
                "websocket transport was stopped".into(),
            ));
        }
        *self.callbacks.write() = Some(callbacks);

        let endpoint = self.local.read().websocket.clone();
        if let Some(endpoint) = endpoint {
            let bind_addr = format!("{}:{}", endpoint.host, endpoint.port);
            let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
                ConnectionError::CouldNotStart(format!("bind {} failed: {}", bind_addr, e))
            })?;
            let port = listener
                .local_addr()
                .map_err(|e| ConnectionError::CouldNotStart(e.to_string()))?
                .port();
            if let Some(ws) = self.local.write().websocket.as_mut() {
                ws.port = port;
            }
            info!("  ✅ WebSocket server listening on {}:{}", endpoint.host, port);
            tokio::spawn(this.accept_loop(listener));
        } else {
            info!("WebSocket transport running without a server");
        }
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
        let endpoint = peer.websocket.as_ref().ok_or_else(|| {
            ConnectionError::SendFailed(format!("{} has no websocket endpoint", peer.address()))
        })?;
        if endpoint.port == 0 {
            return Err(ConnectionError::SendFailed(format!(
                "{} advertises port 0",
                peer.address()
            )));
        }
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| ConnectionError::SendFailed("transport dropped".into()))?;

        let attempt = PendingAttempt::new(peer.clone(), PENDING_ATTEMPT_TIMEOUT);
        if !bind(attempt.clone()) {
            attempt.destroy();
            return Err(ConnectionError::SendFailed(format!(
                "attempt to {} was not accepted",
                peer.address()
            )));
        }
        self.track(&attempt);
        tokio::spawn(this.dial(endpoint.url(), attempt.clone()));
        Ok(attempt)
    }

    fn local_peer_descriptor(&self) -> PeerDescriptor {
        self.local.read().clone()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.callbacks.write().take();
        let attempts: Vec<Weak<PendingAttempt>> = self.attempts.lock().drain(..).collect();
        for attempt in attempts.iter().filter_map(|a| a.upgrade()) {
            attempt.close(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_requires_endpoint() {
        let transport = WebSocketTransport::new(
            PeerDescriptor::new(vec![1]),
            Arc::new(IdGenerator::new()),
        );
        let no_endpoint = PeerDescriptor::new(vec![2]);
        let port_zero = PeerDescriptor::new(vec![3]).with_websocket("127.0.0.1", 0, false);

        for peer in [no_endpoint, port_zero] {
            let result = transport.create_connection(&peer, &|_: Arc<PendingAttempt>| true);
            assert!(matches!(result, Err(ConnectionError::SendFailed(_))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_wait_for_start_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
                .await
                .unwrap();
            ws.send(WsMessage::Binary(vec![7u8, 7, 7].into())).await.unwrap();
            ws
        });

        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let channel = WebSocketChannel::spawn(ws, ChannelKind::WsServer, "ws-test".into());
        let _client_ws = client.await.unwrap();

        // The frame is already on the socket before anyone listens
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.events().on(move |event: &ChannelEvent| {
            if let ChannelEvent::Data(data) = event {
                let _ = tx.send(data.clone());
            }
        });
        channel.start_reading();

        let data = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("frame never delivered");
        assert_eq!(data, Some(vec![7u8, 7, 7]));
        channel.close(false);
    }

    #[tokio::test]
    async fn test_listener_reports_bound_port() {
        let transport = WebSocketTransport::new(
            PeerDescriptor::new(vec![1]).with_websocket("127.0.0.1", 0, false),
            Arc::new(IdGenerator::new()),
        );
        transport
            .start(TransportCallbacks {
                on_new_connection: Arc::new(|_: Arc<PendingAttempt>| true),
                has_connection: Arc::new(|_: &PeerAddress| false),
            })
            .await
            .unwrap();

        let port = transport.local_peer_descriptor().websocket.unwrap().port;
        assert_ne!(port, 0);
        transport.stop().await;
    }
}
