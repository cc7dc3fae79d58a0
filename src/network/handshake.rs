//! Handshake run once per raw channel before it is handed to a session.
//!
//! The outbound side dials, sends a request naming the peer it expects, and
//! completes its pending attempt on a positive response. The inbound side
//! validates the request, asks the connection manager's gatekeeper whether the
//! connection may be accepted and answers. Failures are resolved here by
//! closing the attempt or channel; nothing is propagated to callers.
//!
//! Cross-closing: while the handshake runs, a channel disconnect closes the
//! pending attempt and a closed attempt closes the channel.

use crate::constants::protocol::{HANDSHAKE_SERVICE_ID, LOCAL_PROTOCOL_VERSION};
use crate::error::ConnectionError;
use crate::network::channel::{ChannelEvent, RawChannel};
use crate::network::events::{ListenerId, Listeners};
use crate::network::message::{
    HandshakeError, HandshakeRequest, HandshakeResponse, Message, MessageBody,
};
use crate::network::pending::{AttemptEvent, PendingAttempt};
use crate::network::wire;
use crate::types::{IdGenerator, PeerAddress, PeerDescriptor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    Completed(PeerDescriptor),
    Failed(Option<HandshakeError>),
    Stopped,
}

/// Looks up an attempt this node already parked for the given peer
pub type AttemptLookup = Arc<dyn Fn(&PeerAddress) -> Option<Arc<PendingAttempt>> + Send + Sync>;

/// Gatekeeper deciding whether a fresh inbound attempt is accepted
pub type NewConnectionHandler = Arc<dyn Fn(Arc<PendingAttempt>) -> bool + Send + Sync>;

/// Parse "major.minor"
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// A remote version is accepted iff its major is at least ours
pub fn is_supported_version(remote: &str) -> bool {
    match (parse_version(LOCAL_PROTOCOL_VERSION), parse_version(remote)) {
        (Some((local_major, _)), Some((remote_major, _))) => remote_major >= local_major,
        _ => false,
    }
}

/// State shared by both roles
struct Handshaker {
    local: PeerDescriptor,
    channel: Arc<dyn RawChannel>,
    ids: Arc<IdGenerator>,
    channel_listeners: Mutex<Vec<ListenerId>>,
    attempt_listener: Mutex<Option<(Arc<PendingAttempt>, ListenerId)>>,
    stopped: AtomicBool,
    events: Listeners<HandshakeEvent>,
}

impl Handshaker {
    fn new(local: PeerDescriptor, channel: Arc<dyn RawChannel>, ids: Arc<IdGenerator>) -> Self {
        Self {
            local,
            channel,
            ids,
            channel_listeners: Mutex::new(Vec::new()),
            attempt_listener: Mutex::new(None),
            stopped: AtomicBool::new(false),
            events: Listeners::new(),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn track_channel_listener(&self, id: ListenerId) {
        self.channel_listeners.lock().push(id);
    }

    fn track_attempt_listener(&self, attempt: Arc<PendingAttempt>, id: ListenerId) {
        *self.attempt_listener.lock() = Some((attempt, id));
    }

    fn send(&self, body: MessageBody) {
        let message = Message {
            service_id: HANDSHAKE_SERVICE_ID.to_string(),
            message_id: self.ids.next_id(),
            source: None,
            target: None,
            body,
        };
        let kind = message.message_type();
        match wire::serialize_message(&message) {
            Ok(bytes) => {
                if let Err(e) = self.channel.send(bytes) {
                    warn!("Failed to send {} on channel {}: {}", kind, self.channel.id(), e);
                } else {
                    trace!("{} sent on channel {}", kind, self.channel.id());
                }
            }
            Err(e) => error!("Failed to encode {}: {}", kind, e),
        }
    }

    fn send_request(&self, target: &PeerDescriptor) {
        self.send(MessageBody::HandshakeRequest(HandshakeRequest {
            source: self.local.clone(),
            target: Some(target.clone()),
            version: LOCAL_PROTOCOL_VERSION.to_string(),
        }));
    }

    fn send_response(&self, error: Option<HandshakeError>) {
        self.send(MessageBody::HandshakeResponse(HandshakeResponse {
            source: self.local.clone(),
            version: LOCAL_PROTOCOL_VERSION.to_string(),
            error,
        }));
    }

    fn decode(&self, data: &[u8]) -> Option<MessageBody> {
        match wire::parse_message(data) {
            Ok(message) => Some(message.body),
            Err(e) => {
                warn!("Dropping unparsable handshake data on {}: {}", self.channel.id(), e);
                None
            }
        }
    }

    /// Detach from the channel and attempt. Returns false if already stopped.
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for id in self.channel_listeners.lock().drain(..) {
            self.channel.events().off(id);
        }
        if let Some((attempt, id)) = self.attempt_listener.lock().take() {
            attempt.events().off(id);
        }
        self.events.emit(&HandshakeEvent::Stopped);
        self.events.clear();
        true
    }
}

/// Dialing side
pub struct OutboundHandshake {
    core: Handshaker,
    target: PeerDescriptor,
    attempt: Arc<PendingAttempt>,
    request_sent: AtomicBool,
}

impl OutboundHandshake {
    pub fn start(
        local: PeerDescriptor,
        channel: Arc<dyn RawChannel>,
        target: PeerDescriptor,
        attempt: Arc<PendingAttempt>,
        ids: Arc<IdGenerator>,
    ) -> Arc<Self> {
        let handshake = Arc::new(Self {
            core: Handshaker::new(local, channel, ids),
            target,
            attempt,
            request_sent: AtomicBool::new(false),
        });
        handshake.attach();
        handshake
    }

    pub fn events(&self) -> &Listeners<HandshakeEvent> {
        &self.core.events
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    fn attach(self: &Arc<Self>) {
        let channel = self.core.channel.clone();

        let me = self.clone();
        let id = channel.events().on(move |event| match event {
            ChannelEvent::Connected => me.send_request_once(),
            ChannelEvent::Data(data) => me.on_data(data),
            ChannelEvent::Disconnected { graceful, .. } => {
                debug!(
                    "Channel to {} closed during handshake",
                    me.target.address()
                );
                me.attempt.close(*graceful);
                me.core.stop();
            }
            ChannelEvent::Error(e) => {
                error!("Outbound handshake to {} got error: {}", me.target.address(), e);
                me.attempt
                    .on_error(ConnectionError::SendFailed(format!("channel error: {}", e)));
            }
        });
        self.core.track_channel_listener(id);

        let me = self.clone();
        let id = self.attempt.events().on(move |event| {
            if let AttemptEvent::Disconnected { .. } = event {
                me.core.channel.close(false);
                me.core.stop();
            }
        });
        self.core.track_attempt_listener(self.attempt.clone(), id);

        // Channels handed over already open never emit Connected
        if channel.is_open() {
            self.send_request_once();
        }
    }

    fn send_request_once(&self) {
        if !self.request_sent.swap(true, Ordering::SeqCst) {
            self.core.send_request(&self.target);
            trace!("Handshake request sent to {}", self.target.address());
        }
    }

    fn on_data(&self, data: &[u8]) {
        if self.core.is_stopped() {
            return;
        }
        match self.core.decode(data) {
            Some(MessageBody::HandshakeResponse(response)) => self.on_response(response),
            Some(MessageBody::HandshakeRequest(_)) => {
                error!("Outbound handshake received a handshake request, stopping");
                self.core.stop();
            }
            Some(MessageBody::Rpc(_)) => {
                trace!("Ignoring non-handshake message during outbound handshake");
            }
            None => {}
        }
    }

    fn on_response(&self, response: HandshakeResponse) {
        if let Some(error) = response.error {
            self.handle_failure(error);
        } else if !is_supported_version(&response.version) {
            self.handle_failure(HandshakeError::UnsupportedVersion);
        } else {
            self.core
                .events
                .emit(&HandshakeEvent::Completed(response.source.clone()));
            trace!(
                "Handshake completed for outgoing connection to {}",
                response.source.address()
            );
            self.attempt.complete(self.core.channel.clone());
            self.core.stop();
        }
    }

    /// Any rejection ends the attempt. A superseded attempt stays silent.
    fn handle_failure(&self, error: HandshakeError) {
        debug!(
            "Handshake to {} failed ({:?}), closing attempt",
            self.target.address(),
            error
        );
        self.core.events.emit(&HandshakeEvent::Failed(Some(error)));
        self.attempt.close(false);
        self.core.stop();
    }
}

/// Accepting side. Has no pending attempt until a valid request arrives.
pub struct InboundHandshake {
    core: Handshaker,
    lookup: AttemptLookup,
    on_new_connection: NewConnectionHandler,
    pending_timeout: Duration,
    attempt: Mutex<Option<Arc<PendingAttempt>>>,
}

impl InboundHandshake {
    pub fn start(
        local: PeerDescriptor,
        channel: Arc<dyn RawChannel>,
        lookup: AttemptLookup,
        on_new_connection: NewConnectionHandler,
        pending_timeout: Duration,
        ids: Arc<IdGenerator>,
    ) -> Arc<Self> {
        let handshake = Arc::new(Self {
            core: Handshaker::new(local, channel, ids),
            lookup,
            on_new_connection,
            pending_timeout,
            attempt: Mutex::new(None),
        });
        handshake.attach();
        handshake
    }

    pub fn events(&self) -> &Listeners<HandshakeEvent> {
        &self.core.events
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn pending_attempt(&self) -> Option<Arc<PendingAttempt>> {
        self.attempt.lock().clone()
    }

    fn attach(self: &Arc<Self>) {
        let me = self.clone();
        let id = self.core.channel.events().on(move |event| match event {
            ChannelEvent::Data(data) => me.on_data(data),
            ChannelEvent::Disconnected { graceful, .. } => {
                if let Some(attempt) = me.pending_attempt() {
                    attempt.close(*graceful);
                }
                me.core.stop();
            }
            ChannelEvent::Connected | ChannelEvent::Error(_) => {}
        });
        self.core.track_channel_listener(id);
    }

    fn on_data(self: &Arc<Self>, data: &[u8]) {
        if self.core.is_stopped() {
            return;
        }
        match self.core.decode(data) {
            Some(MessageBody::HandshakeRequest(request)) => self.on_request(request),
            Some(MessageBody::HandshakeResponse(_)) => {
                error!("Inbound handshake received a handshake response, stopping");
                self.core.stop();
            }
            Some(MessageBody::Rpc(_)) => {
                trace!("Ignoring non-handshake message during inbound handshake");
            }
            None => {}
        }
    }

    fn on_request(self: &Arc<Self>, request: HandshakeRequest) {
        if !is_supported_version(&request.version) {
            self.handle_failure(HandshakeError::UnsupportedVersion, None);
            return;
        }
        if let Some(target) = &request.target {
            if *target != self.core.local {
                self.handle_failure(HandshakeError::InvalidTargetPeerDescriptor, None);
                return;
            }
        }

        let source = request.source;
        let attempt = match (self.lookup)(&source.address()) {
            Some(parked) => {
                debug!("Reusing parked attempt for {}", source.address());
                parked
            }
            None => {
                let attempt = PendingAttempt::new(source.clone(), self.pending_timeout);
                if !(self.on_new_connection)(attempt.clone()) {
                    self.handle_failure(HandshakeError::DuplicateConnection, Some(attempt));
                    return;
                }
                attempt
            }
        };

        *self.attempt.lock() = Some(attempt.clone());
        let me = self.clone();
        let id = attempt.events().on(move |event| {
            if let AttemptEvent::Disconnected { .. } = event {
                me.core.channel.close(false);
                me.core.stop();
            }
        });
        self.core.track_attempt_listener(attempt.clone(), id);

        self.handle_success(source, attempt);
    }

    fn handle_success(&self, source: PeerDescriptor, attempt: Arc<PendingAttempt>) {
        self.core.send_response(None);
        attempt.complete(self.core.channel.clone());
        trace!("Handshake completed for incoming connection from {}", source.address());
        self.core.events.emit(&HandshakeEvent::Completed(source));
        self.core.stop();
    }

    fn handle_failure(&self, error: HandshakeError, attempt: Option<Arc<PendingAttempt>>) {
        debug!("Rejecting inbound handshake on {}: {:?}", self.core.channel.id(), error);
        self.core.send_response(Some(error));
        if let Some(attempt) = attempt {
            attempt.destroy();
        }
        self.core.events.emit(&HandshakeEvent::Failed(Some(error)));
        self.core.channel.destroy();
        self.core.stop();
    }
}
