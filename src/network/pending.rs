//! In-flight connection attempt.
//!
//! Wraps one dial or accept until the handshake hands over a live channel.
//! Emits at most one of Connected or Disconnected over its lifetime, and
//! nothing at all once it has been superseded or destroyed.

use crate::error::ConnectionError;
use crate::network::channel::RawChannel;
use crate::network::events::Listeners;
use crate::types::PeerDescriptor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub enum AttemptEvent {
    Connected {
        peer: PeerDescriptor,
        channel: Arc<dyn RawChannel>,
    },
    Disconnected {
        graceful: bool,
    },
}

type ErrorCallback = Box<dyn FnOnce(ConnectionError) + Send>;

struct AttemptState {
    stopped: bool,
    superseded: bool,
    on_error: Option<ErrorCallback>,
}

pub struct PendingAttempt {
    peer: PeerDescriptor,
    state: Mutex<AttemptState>,
    events: Listeners<AttemptEvent>,
    timer: CancellationToken,
}

impl PendingAttempt {
    /// Start an attempt that closes itself after `timeout`.
    /// Must be called from within a tokio runtime.
    pub fn new(peer: PeerDescriptor, timeout: Duration) -> Arc<Self> {
        Self::build(peer, timeout, None)
    }

    pub fn with_error_callback<F>(peer: PeerDescriptor, timeout: Duration, on_error: F) -> Arc<Self>
    where
        F: FnOnce(ConnectionError) + Send + 'static,
    {
        Self::build(peer, timeout, Some(Box::new(on_error)))
    }

    fn build(peer: PeerDescriptor, timeout: Duration, on_error: Option<ErrorCallback>) -> Arc<Self> {
        let attempt = Arc::new(Self {
            peer,
            state: Mutex::new(AttemptState {
                stopped: false,
                superseded: false,
                on_error,
            }),
            events: Listeners::new(),
            timer: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&attempt);
        let token = attempt.timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(attempt) = weak.upgrade() {
                        debug!(
                            "⏱️  Pending attempt to {} timed out after {:?}",
                            attempt.peer.address(),
                            timeout
                        );
                        attempt.close(false);
                    }
                }
            }
        });

        attempt
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn events(&self) -> &Listeners<AttemptEvent> {
        &self.events
    }

    /// Another attempt already represents this peer; stay silent from now on
    pub fn mark_superseded(&self) {
        self.state.lock().superseded = true;
    }

    pub fn is_superseded(&self) -> bool {
        self.state.lock().superseded
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Hand over the handshaked channel
    pub fn complete(&self, channel: Arc<dyn RawChannel>) {
        let superseded = {
            let mut state = self.state.lock();
            if state.stopped {
                debug!(
                    "Pending attempt to {} completed after it was stopped",
                    self.peer.address()
                );
                return;
            }
            state.stopped = true;
            state.on_error = None;
            state.superseded
        };
        self.timer.cancel();

        if !superseded {
            self.events.emit(&AttemptEvent::Connected {
                peer: self.peer.clone(),
                channel,
            });
        }
    }

    pub fn close(&self, graceful: bool) {
        let (superseded, on_error) = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            (state.superseded, state.on_error.take())
        };
        self.timer.cancel();

        if let Some(callback) = on_error {
            callback(ConnectionError::ClosedWhileConnecting(format!(
                "attempt to {} closed",
                self.peer.address()
            )));
        }
        if !superseded {
            self.events.emit(&AttemptEvent::Disconnected { graceful });
        }
    }

    /// Tear down without emitting anything
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.on_error = None;
        }
        self.timer.cancel();
        self.events.clear();
    }

    /// Forward a transport error to the registered callback, at most once
    pub fn on_error(&self, error: ConnectionError) {
        let callback = self.state.lock().on_error.take();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::{ChannelEvent, ChannelKind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullChannel {
        events: Listeners<ChannelEvent>,
    }

    impl RawChannel for NullChannel {
        fn id(&self) -> &str {
            "null"
        }
        fn kind(&self) -> ChannelKind {
            ChannelKind::SimulatorClient
        }
        fn is_open(&self) -> bool {
            true
        }
        fn send(&self, _data: Vec<u8>) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn close(&self, _graceful: bool) {}
        fn destroy(&self) {}
        fn events(&self) -> &Listeners<ChannelEvent> {
            &self.events
        }
    }

    fn null_channel() -> Arc<dyn RawChannel> {
        Arc::new(NullChannel {
            events: Listeners::new(),
        })
    }

    fn counters(attempt: &PendingAttempt) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let (c, d) = (connected.clone(), disconnected.clone());
        attempt.events().on(move |event| match event {
            AttemptEvent::Connected { .. } => {
                c.fetch_add(1, Ordering::SeqCst);
            }
            AttemptEvent::Disconnected { .. } => {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });
        (connected, disconnected)
    }

    fn peer() -> PeerDescriptor {
        PeerDescriptor::new(vec![7, 7])
    }

    #[tokio::test]
    async fn test_close_twice_emits_once() {
        let attempt = PendingAttempt::new(peer(), Duration::from_secs(15));
        let (connected, disconnected) = counters(&attempt);

        attempt.close(true);
        attempt.close(false);

        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(connected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_complete_then_close_emits_only_connected() {
        let attempt = PendingAttempt::new(peer(), Duration::from_secs(15));
        let (connected, disconnected) = counters(&attempt);

        attempt.complete(null_channel());
        attempt.close(false);

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_superseded_attempt_is_silent() {
        let attempt = PendingAttempt::new(peer(), Duration::from_secs(15));
        let (connected, disconnected) = counters(&attempt);

        attempt.mark_superseded();
        attempt.close(true);
        attempt.complete(null_channel());

        assert!(attempt.is_superseded());
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_emits_disconnected() {
        let attempt = PendingAttempt::new(peer(), Duration::from_millis(30));
        let (_, disconnected) = counters(&attempt);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(attempt.is_stopped());
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_superseded_attempt_times_out_silently() {
        let attempt = PendingAttempt::new(peer(), Duration::from_millis(30));
        let (_, disconnected) = counters(&attempt);
        attempt.mark_superseded();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(attempt.is_stopped());
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_prevents_emission() {
        let attempt = PendingAttempt::new(peer(), Duration::from_millis(30));
        let (connected, disconnected) = counters(&attempt);

        attempt.destroy();
        tokio::time::sleep(Duration::from_millis(100)).await;
        attempt.close(false);
        attempt.complete(null_channel());

        assert_eq!(connected.load(Ordering::SeqCst), 0);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_invokes_error_callback_once() {
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let attempt = PendingAttempt::with_error_callback(peer(), Duration::from_secs(15), move |e| {
            assert!(matches!(e, ConnectionError::ClosedWhileConnecting(_)));
            c.fetch_add(1, Ordering::SeqCst);
        });

        attempt.close(false);
        attempt.on_error(ConnectionError::SendFailed("late".into()));

        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_error_forwards_once() {
        let seen = Arc::new(AtomicBool::new(false));
        let s = seen.clone();
        let attempt = PendingAttempt::with_error_callback(peer(), Duration::from_secs(15), move |e| {
            assert_eq!(e, ConnectionError::SendFailed("boom".into()));
            s.store(true, Ordering::SeqCst);
        });

        attempt.on_error(ConnectionError::SendFailed("boom".into()));
        attempt.on_error(ConnectionError::SendFailed("again".into()));
        attempt.close(false);

        assert!(seen.load(Ordering::SeqCst));
    }
}
