//! Per-peer session state machine.
//!
//! A session hides whether the peer is reached through a pending attempt or a
//! live channel. Phases:
//!
//! ```text
//! Initial -> Connecting -> Connected
//! Connected -> Connecting      (replacement attempt accepted)
//! any -> Disconnected          (terminal)
//! ```
//!
//! The phase lives behind a per-session lock. Listeners on attempts and
//! channels hold a `Weak` handle back to the session and check that the
//! source is still the current one before acting, so late events from a
//! replaced attempt or channel are ignored. No lock is held while session
//! events are emitted.

use crate::error::ConnectionError;
use crate::network::channel::{ChannelEvent, RawChannel};
use crate::network::events::{ListenerId, Listeners};
use crate::network::pending::{AttemptEvent, PendingAttempt};
use crate::types::PeerDescriptor;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Data(Vec<u8>),
    Connected,
    Disconnected { graceful: bool },
}

/// Public view of the session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initial,
    Connecting,
    Connected,
    Disconnected,
}

impl SessionPhase {
    /// Transition table
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Initial, Connecting)
                | (Initial, Connected)
                | (Connecting, Connecting)
                | (Connecting, Connected)
                | (Connected, Connecting)
                | (Initial, Disconnected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

enum Phase {
    Initial,
    Connecting {
        attempt: Arc<PendingAttempt>,
        listener: ListenerId,
        buffer: Vec<Vec<u8>>,
    },
    Connected {
        channel: Arc<dyn RawChannel>,
        listener: ListenerId,
    },
    Disconnected,
}

impl Phase {
    fn kind(&self) -> SessionPhase {
        match self {
            Phase::Initial => SessionPhase::Initial,
            Phase::Connecting { .. } => SessionPhase::Connecting,
            Phase::Connected { .. } => SessionPhase::Connected,
            Phase::Disconnected => SessionPhase::Disconnected,
        }
    }
}

/// Resource released by a transition, cleaned up after the lock is dropped
enum Released {
    Attempt(Arc<PendingAttempt>, ListenerId),
    Channel(Arc<dyn RawChannel>, ListenerId),
    Nothing,
}

impl Released {
    fn from_phase(phase: Phase) -> Self {
        match phase {
            Phase::Connecting {
                attempt, listener, ..
            } => Released::Attempt(attempt, listener),
            Phase::Connected { channel, listener } => Released::Channel(channel, listener),
            Phase::Initial | Phase::Disconnected => Released::Nothing,
        }
    }

    fn detach(&self) {
        match self {
            Released::Attempt(attempt, listener) => {
                attempt.events().off(*listener);
            }
            Released::Channel(channel, listener) => {
                channel.events().off(*listener);
            }
            Released::Nothing => {}
        }
    }
}

pub struct Session {
    peer: PeerDescriptor,
    phase: Mutex<Phase>,
    events: Listeners<SessionEvent>,
}

impl Session {
    pub fn new(peer: PeerDescriptor) -> Arc<Self> {
        Arc::new(Self {
            peer,
            phase: Mutex::new(Phase::Initial),
            events: Listeners::new(),
        })
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn events(&self) -> &Listeners<SessionEvent> {
        &self.events
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.lock().kind()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == SessionPhase::Connected
    }

    /// Bind a new attempt. From Connected the current channel is closed
    /// gracefully; a replaced pending attempt is marked superseded. Returns
    /// false if the session already reached Disconnected.
    pub fn set_connecting(self: &Arc<Self>, attempt: Arc<PendingAttempt>) -> bool {
        let weak_session = Arc::downgrade(self);
        let weak_attempt = Arc::downgrade(&attempt);
        let listener = attempt.events().on(move |event| {
            if let Some(session) = weak_session.upgrade() {
                session.on_attempt_event(&weak_attempt, event);
            }
        });

        let released = {
            let mut phase = self.phase.lock();
            let current = phase.kind();
            if !current.can_transition_to(SessionPhase::Connecting) {
                drop(phase);
                attempt.events().off(listener);
                warn!(
                    "❌ Invalid session transition for {}: {:?} -> Connecting",
                    self.peer.address(),
                    current
                );
                return false;
            }

            let buffer = match &mut *phase {
                Phase::Connecting { buffer, .. } => std::mem::take(buffer),
                _ => Vec::new(),
            };
            let old = std::mem::replace(
                &mut *phase,
                Phase::Connecting {
                    attempt,
                    listener,
                    buffer,
                },
            );
            debug!(
                "✅ Session transition for {}: {:?} -> Connecting",
                self.peer.address(),
                current
            );
            Released::from_phase(old)
        };

        released.detach();
        match released {
            Released::Attempt(old_attempt, _) => old_attempt.mark_superseded(),
            Released::Channel(old_channel, _) => old_channel.close(true),
            Released::Nothing => {}
        }
        true
    }

    /// Send bytes: buffered while connecting, forwarded once connected
    pub fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Initial => Err(ConnectionError::SendFailed(format!(
                "no connection attempt to {} yet",
                self.peer.address()
            ))),
            Phase::Connecting { buffer, .. } => {
                trace!("Buffering {} bytes for {}", data.len(), self.peer.address());
                buffer.push(data);
                Ok(())
            }
            Phase::Connected { channel, .. } => channel.send(data),
            Phase::Disconnected => Err(ConnectionError::SendFailed(format!(
                "session to {} is disconnected",
                self.peer.address()
            ))),
        }
    }

    /// Close whatever currently represents the peer and move to Disconnected
    pub fn close(&self, graceful: bool) {
        let released = {
            let mut phase = self.phase.lock();
            match phase.kind() {
                SessionPhase::Initial | SessionPhase::Disconnected => return,
                _ => Released::from_phase(std::mem::replace(&mut *phase, Phase::Disconnected)),
            }
        };

        debug!(
            "Closing session to {} (graceful: {})",
            self.peer.address(),
            graceful
        );
        released.detach();
        match &released {
            Released::Attempt(attempt, _) => attempt.close(graceful),
            Released::Channel(channel, _) => channel.close(graceful),
            Released::Nothing => {}
        }
        self.events.emit(&SessionEvent::Disconnected { graceful });
    }

    fn on_attempt_event(self: &Arc<Self>, source: &Weak<PendingAttempt>, event: &AttemptEvent) {
        match event {
            AttemptEvent::Connected { channel, .. } => self.on_attempt_connected(source, channel),
            AttemptEvent::Disconnected { graceful } => {
                self.disconnect_if_current(|phase| match phase {
                    Phase::Connecting { attempt, .. } => {
                        std::ptr::eq(Arc::as_ptr(attempt), source.as_ptr())
                    }
                    _ => false,
                }, *graceful);
            }
        }
    }

    fn on_attempt_connected(self: &Arc<Self>, source: &Weak<PendingAttempt>, channel: &Arc<dyn RawChannel>) {
        let weak_session = Arc::downgrade(self);
        let weak_channel = Arc::downgrade(channel);
        let listener = channel.events().on(move |event| {
            if let Some(session) = weak_session.upgrade() {
                session.on_channel_event(&weak_channel, event);
            }
        });

        let released = {
            let mut phase = self.phase.lock();
            let is_current = match &*phase {
                Phase::Connecting { attempt, .. } => {
                    std::ptr::eq(Arc::as_ptr(attempt), source.as_ptr())
                }
                _ => false,
            };
            if !is_current {
                drop(phase);
                channel.events().off(listener);
                debug!(
                    "Ignoring completed attempt to {} that no longer owns the session",
                    self.peer.address()
                );
                return;
            }

            let mut old = std::mem::replace(
                &mut *phase,
                Phase::Connected {
                    channel: channel.clone(),
                    listener,
                },
            );
            // Flush while still holding the lock so later sends queue behind
            if let Phase::Connecting { buffer, .. } = &mut old {
                for data in buffer.drain(..) {
                    if let Err(e) = channel.send(data) {
                        warn!("Failed to flush buffered data to {}: {}", self.peer.address(), e);
                    }
                }
            }
            Released::from_phase(old)
        };

        released.detach();
        debug!(
            "✅ Session transition for {}: Connecting -> Connected ({})",
            self.peer.address(),
            channel.kind()
        );
        self.events.emit(&SessionEvent::Connected);
    }

    fn on_channel_event(&self, source: &Weak<dyn RawChannel>, event: &ChannelEvent) {
        let is_current = |phase: &Phase| match phase {
            Phase::Connected { channel, .. } => {
                Arc::as_ptr(channel).cast::<()>() == source.as_ptr().cast::<()>()
            }
            _ => false,
        };

        match event {
            ChannelEvent::Data(data) => {
                if is_current(&*self.phase.lock()) {
                    self.events.emit(&SessionEvent::Data(data.clone()));
                }
            }
            ChannelEvent::Disconnected { graceful, .. } => {
                self.disconnect_if_current(is_current, *graceful);
            }
            ChannelEvent::Error(e) => {
                debug!("Channel error on session to {}: {}", self.peer.address(), e);
            }
            ChannelEvent::Connected => {}
        }
    }

    fn disconnect_if_current<F>(&self, is_current: F, graceful: bool)
    where
        F: Fn(&Phase) -> bool,
    {
        let released = {
            let mut phase = self.phase.lock();
            if !is_current(&*phase) {
                return;
            }
            Released::from_phase(std::mem::replace(&mut *phase, Phase::Disconnected))
        };

        released.detach();
        debug!(
            "✅ Session transition for {}: -> Disconnected (graceful: {})",
            self.peer.address(),
            graceful
        );
        self.events.emit(&SessionEvent::Disconnected { graceful });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::ChannelKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RecordingChannel {
        sent: Mutex<Vec<Vec<u8>>>,
        closed: Mutex<Option<bool>>,
        events: Listeners<ChannelEvent>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                closed: Mutex::new(None),
                events: Listeners::new(),
            })
        }
    }

    impl RawChannel for RecordingChannel {
        fn id(&self) -> &str {
            "recording"
        }
        fn kind(&self) -> ChannelKind {
            ChannelKind::SimulatorClient
        }
        fn is_open(&self) -> bool {
            self.closed.lock().is_none()
        }
        fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
            self.sent.lock().push(data);
            Ok(())
        }
        fn close(&self, graceful: bool) {
            let first = self.closed.lock().replace(graceful).is_none();
            if first {
                self.events.emit(&ChannelEvent::Disconnected {
                    graceful,
                    code: None,
                    reason: None,
                });
            }
        }
        fn destroy(&self) {
            self.events.clear();
            *self.closed.lock() = Some(false);
        }
        fn events(&self) -> &Listeners<ChannelEvent> {
            &self.events
        }
    }

    fn peer() -> PeerDescriptor {
        PeerDescriptor::new(vec![0xBE, 0xEF])
    }

    fn attempt() -> Arc<PendingAttempt> {
        PendingAttempt::new(peer(), Duration::from_secs(15))
    }

    fn count_disconnects(session: &Session) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        session.events().on(move |e| {
            if matches!(e, SessionEvent::Disconnected { .. }) {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[test]
    fn test_transition_table() {
        use SessionPhase::*;
        assert!(Initial.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Initial));
    }

    #[tokio::test]
    async fn test_initial_send_fails_and_close_is_noop() {
        let session = Session::new(peer());
        let disconnects = count_disconnects(&session);

        assert!(matches!(
            session.send(vec![1]),
            Err(ConnectionError::SendFailed(_))
        ));
        session.close(true);

        assert_eq!(session.phase(), SessionPhase::Initial);
        assert!(!session.is_connected());
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_buffered_bytes_flush_before_later_sends() {
        let session = Session::new(peer());
        let pending = attempt();
        assert!(session.set_connecting(pending.clone()));
        assert_eq!(session.phase(), SessionPhase::Connecting);
        assert!(!session.is_connected());

        session.send(vec![1]).unwrap();
        session.send(vec![2]).unwrap();

        let channel = RecordingChannel::new();
        pending.complete(channel.clone());
        session.send(vec![3]).unwrap();

        assert!(session.is_connected());
        assert_eq!(*channel.sent.lock(), vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn test_channel_data_is_delivered() {
        let session = Session::new(peer());
        let pending = attempt();
        session.set_connecting(pending.clone());
        let channel = RecordingChannel::new();
        pending.complete(channel.clone());

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        session.events().on(move |e| {
            if let SessionEvent::Data(d) = e {
                r.lock().push(d.clone());
            }
        });

        channel.events().emit(&ChannelEvent::Data(vec![9, 9]));
        assert_eq!(*received.lock(), vec![vec![9, 9]]);
    }

    #[tokio::test]
    async fn test_attempt_failure_disconnects_once() {
        let session = Session::new(peer());
        let disconnects = count_disconnects(&session);
        let pending = attempt();
        session.set_connecting(pending.clone());

        pending.close(false);
        session.close(false);

        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(session.send(vec![1]).is_err());
    }

    #[tokio::test]
    async fn test_channel_disconnect_is_terminal() {
        let session = Session::new(peer());
        let disconnects = count_disconnects(&session);
        let pending = attempt();
        session.set_connecting(pending.clone());
        let channel = RecordingChannel::new();
        pending.complete(channel.clone());

        channel.close(true);

        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!session.set_connecting(attempt()));
    }

    #[tokio::test]
    async fn test_replacement_closes_old_channel_gracefully() {
        let session = Session::new(peer());
        let disconnects = count_disconnects(&session);
        let first = attempt();
        session.set_connecting(first.clone());
        let old_channel = RecordingChannel::new();
        first.complete(old_channel.clone());

        let second = attempt();
        assert!(session.set_connecting(second.clone()));
        assert_eq!(*old_channel.closed.lock(), Some(true));
        assert_eq!(session.phase(), SessionPhase::Connecting);

        let new_channel = RecordingChannel::new();
        second.complete(new_channel.clone());
        assert!(session.is_connected());
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);

        // Late events from the replaced channel are ignored
        old_channel
            .events()
            .emit(&ChannelEvent::Data(vec![1]));
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_replaced_attempt_is_superseded() {
        let session = Session::new(peer());
        let disconnects = count_disconnects(&session);
        let first = attempt();
        session.set_connecting(first.clone());
        session.send(vec![5]).unwrap();

        let second = attempt();
        session.set_connecting(second.clone());
        assert!(first.is_superseded());
        first.close(false);
        assert_eq!(session.phase(), SessionPhase::Connecting);

        let channel = RecordingChannel::new();
        second.complete(channel.clone());
        assert_eq!(*channel.sent.lock(), vec![vec![5]]);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_while_connected_passes_graceful_flag() {
        let session = Session::new(peer());
        let pending = attempt();
        session.set_connecting(pending.clone());
        let channel = RecordingChannel::new();
        pending.complete(channel.clone());

        let graceful_seen = Arc::new(Mutex::new(None));
        let g = graceful_seen.clone();
        session.events().on(move |e| {
            if let SessionEvent::Disconnected { graceful } = e {
                *g.lock() = Some(*graceful);
            }
        });

        session.close(true);
        assert_eq!(*channel.closed.lock(), Some(true));
        assert_eq!(*graceful_seen.lock(), Some(true));
    }
}
