//! Message deduplication with a bounded FIFO window.
//!
//! Remembers the last `capacity` message ids. Once full, each insertion
//! evicts the oldest id, so memory stays bounded and a very old id can be
//! accepted again. Lookups use `contains`, which never promotes an entry,
//! so the LRU order stays the insertion order.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub struct DuplicateMessageWindow {
    seen: Mutex<LruCache<String, ()>>,
    capacity: usize,
}

impl DuplicateMessageWindow {
    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
        }
    }

    /// Check if an id was seen within the window
    pub fn is_duplicate(&self, id: &str) -> bool {
        self.seen.lock().contains(id)
    }

    pub fn add(&self, id: &str) {
        let mut seen = self.seen.lock();
        if !seen.contains(id) {
            seen.put(id.to_string(), ());
        }
    }

    /// Check and insert in one step.
    /// Returns true if the id was already seen.
    pub fn check_and_insert(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(id) {
            return true;
        }
        seen.put(id.to_string(), ());
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_window() {
        let window = DuplicateMessageWindow::new(10);

        // First insert should return false
        assert!(!window.check_and_insert("m1"));

        // Second insert should return true (already seen)
        assert!(window.check_and_insert("m1"));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_oldest_is_evicted() {
        let capacity = 5;
        let window = DuplicateMessageWindow::new(capacity);
        for i in 0..=capacity {
            window.add(&format!("m{}", i));
        }

        assert!(!window.is_duplicate("m0"));
        for i in 1..=capacity {
            assert!(window.is_duplicate(&format!("m{}", i)));
        }
        assert_eq!(window.len(), capacity);
    }

    #[test]
    fn test_readding_does_not_consume_capacity() {
        let window = DuplicateMessageWindow::new(2);
        window.add("a");
        window.add("a");
        window.add("b");
        assert!(window.is_duplicate("a"));
        assert!(window.is_duplicate("b"));
    }

    #[test]
    fn test_lookup_does_not_refresh_age() {
        let window = DuplicateMessageWindow::new(2);
        window.add("a");
        window.add("b");
        // Seeing "a" again must not move it behind "b"
        assert!(window.check_and_insert("a"));
        window.add("a");
        window.add("c");
        assert!(!window.is_duplicate("a"));
        assert!(window.is_duplicate("b"));
        assert!(window.is_duplicate("c"));
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let window = DuplicateMessageWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.add("a");
        window.add("b");
        assert!(!window.is_duplicate("a"));
        assert!(window.is_duplicate("b"));
    }

    #[test]
    fn test_clear() {
        let window = DuplicateMessageWindow::new(3);
        window.add("x");
        window.clear();
        assert!(window.is_empty());
        assert!(!window.is_duplicate("x"));
    }
}
