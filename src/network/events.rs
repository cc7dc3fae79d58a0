//! Listener registry shared by channels, attempts, sessions and the manager.
//!
//! Emission works on a snapshot: handlers registered while an event is being
//! dispatched only see later events, and `once` handlers are unregistered as
//! part of taking the snapshot so they run exactly once. The registry lock is
//! never held while a handler runs, so handlers may freely register, remove or
//! emit on the same registry.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<E> {
    id: u64,
    once: bool,
    handler: Handler<E>,
}

pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<E>>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(false, Arc::new(handler))
    }

    pub fn once<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(true, Arc::new(handler))
    }

    fn register(&self, once: bool, handler: Handler<E>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry { id, once, handler });
        ListenerId(id)
    }

    /// Returns false if the listener was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id.0);
        entries.len() != before
    }

    /// Dispatch to every listener registered at the time of the call.
    /// Returns how many handlers ran.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Handler<E>> = {
            let mut entries = self.entries.lock();
            let handlers = entries.iter().map(|e| e.handler.clone()).collect();
            entries.retain(|e| !e.once);
            handlers
        };

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_once_fires_exactly_once() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        listeners.once(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&1);
        listeners.emit(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_off_removes_listener() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = listeners.on(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(listeners.off(id));
        assert!(!listeners.off(id));
        assert_eq!(listeners.emit(&1), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_added_during_emit_misses_that_event() {
        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::new());
        let late_hits = Arc::new(AtomicUsize::new(0));

        let registry = listeners.clone();
        let late = late_hits.clone();
        listeners.once(move |_| {
            let late = late.clone();
            registry.on(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        listeners.emit(&1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        listeners.emit(&2);
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }
}
