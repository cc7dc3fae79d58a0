//! Keep-alive reservations per peer.
//!
//! Locks exist independently of connections: a peer can be locked before a
//! session to it is open. Three kinds are tracked:
//! - local: this node wants the connection, mirrored to the peer over RPC
//! - remote: the peer asked us to keep it
//! - weak: local-only hint, never mirrored
//!
//! A kind is locked for a peer iff its id set is non-empty; empty sets are
//! never kept.

use crate::types::{LockId, PeerAddress};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Local,
    Remote,
    Weak,
}

type LockMap = HashMap<PeerAddress, BTreeSet<LockId>>;

#[derive(Default)]
struct Tables {
    local: LockMap,
    remote: LockMap,
    weak: LockMap,
}

impl Tables {
    fn map(&self, kind: LockKind) -> &LockMap {
        match kind {
            LockKind::Local => &self.local,
            LockKind::Remote => &self.remote,
            LockKind::Weak => &self.weak,
        }
    }

    fn map_mut(&mut self, kind: LockKind) -> &mut LockMap {
        match kind {
            LockKind::Local => &mut self.local,
            LockKind::Remote => &mut self.remote,
            LockKind::Weak => &mut self.weak,
        }
    }
}

#[derive(Default)]
pub struct LockTable {
    tables: Mutex<Tables>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: LockKind, peer: &PeerAddress, lock_id: &str) {
        self.tables
            .lock()
            .map_mut(kind)
            .entry(peer.clone())
            .or_default()
            .insert(lock_id.to_string());
    }

    pub fn remove(&self, kind: LockKind, peer: &PeerAddress, lock_id: &str) {
        let mut tables = self.tables.lock();
        let map = tables.map_mut(kind);
        if let Some(ids) = map.get_mut(peer) {
            ids.remove(lock_id);
            if ids.is_empty() {
                map.remove(peer);
            }
        }
    }

    pub fn is_locked_by(&self, kind: LockKind, peer: &PeerAddress, lock_id: Option<&str>) -> bool {
        let tables = self.tables.lock();
        match (tables.map(kind).get(peer), lock_id) {
            (Some(_), None) => true,
            (Some(ids), Some(id)) => ids.contains(id),
            (None, _) => false,
        }
    }

    /// Number of peers holding at least one lock of this kind
    pub fn count(&self, kind: LockKind) -> usize {
        self.tables.lock().map(kind).len()
    }

    pub fn add_local_locked(&self, peer: &PeerAddress, lock_id: &str) {
        self.add(LockKind::Local, peer, lock_id);
    }

    pub fn add_remote_locked(&self, peer: &PeerAddress, lock_id: &str) {
        self.add(LockKind::Remote, peer, lock_id);
    }

    pub fn add_weak_locked(&self, peer: &PeerAddress, lock_id: &str) {
        self.add(LockKind::Weak, peer, lock_id);
    }

    pub fn remove_local_locked(&self, peer: &PeerAddress, lock_id: &str) {
        self.remove(LockKind::Local, peer, lock_id);
    }

    pub fn remove_remote_locked(&self, peer: &PeerAddress, lock_id: &str) {
        self.remove(LockKind::Remote, peer, lock_id);
    }

    pub fn remove_weak_locked(&self, peer: &PeerAddress, lock_id: &str) {
        self.remove(LockKind::Weak, peer, lock_id);
    }

    pub fn is_local_locked(&self, peer: &PeerAddress) -> bool {
        self.is_locked_by(LockKind::Local, peer, None)
    }

    pub fn is_remote_locked(&self, peer: &PeerAddress) -> bool {
        self.is_locked_by(LockKind::Remote, peer, None)
    }

    pub fn is_weak_locked(&self, peer: &PeerAddress) -> bool {
        self.is_locked_by(LockKind::Weak, peer, None)
    }

    /// Locked by any kind
    pub fn is_locked(&self, peer: &PeerAddress) -> bool {
        let tables = self.tables.lock();
        tables.local.contains_key(peer)
            || tables.remote.contains_key(peer)
            || tables.weak.contains_key(peer)
    }

    pub fn clear_all_locks(&self, peer: &PeerAddress) {
        let mut tables = self.tables.lock();
        tables.local.remove(peer);
        tables.remote.remove(peer);
        tables.weak.remove(peer);
    }

    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.local.clear();
        tables.remote.clear();
        tables.weak.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerAddress {
        PeerAddress::from_node_id(&[b])
    }

    #[test]
    fn test_add_then_remove_unlocks() {
        let table = LockTable::new();
        table.add_local_locked(&peer(1), "L1");
        assert!(table.is_local_locked(&peer(1)));
        table.remove_local_locked(&peer(1), "L1");
        assert!(!table.is_local_locked(&peer(1)));
        assert_eq!(table.count(LockKind::Local), 0);
    }

    #[test]
    fn test_two_lock_ids_keep_peer_locked() {
        let table = LockTable::new();
        table.add_local_locked(&peer(1), "L1");
        table.add_local_locked(&peer(1), "L2");
        table.remove_local_locked(&peer(1), "L1");
        assert!(table.is_local_locked(&peer(1)));
        assert!(table.is_locked_by(LockKind::Local, &peer(1), Some("L2")));
        assert!(!table.is_locked_by(LockKind::Local, &peer(1), Some("L1")));
    }

    #[test]
    fn test_kinds_are_independent() {
        let table = LockTable::new();
        table.add_remote_locked(&peer(2), "R");
        table.add_weak_locked(&peer(3), "W");
        assert!(!table.is_local_locked(&peer(2)));
        assert!(table.is_remote_locked(&peer(2)));
        assert!(table.is_weak_locked(&peer(3)));
        assert!(table.is_locked(&peer(3)));
        assert_eq!(table.count(LockKind::Remote), 1);
        assert_eq!(table.count(LockKind::Weak), 1);
    }

    #[test]
    fn test_removing_unknown_lock_is_noop() {
        let table = LockTable::new();
        table.remove_remote_locked(&peer(9), "nope");
        assert_eq!(table.count(LockKind::Remote), 0);
    }

    #[test]
    fn test_clear_all_locks_for_peer() {
        let table = LockTable::new();
        table.add_local_locked(&peer(1), "a");
        table.add_remote_locked(&peer(1), "b");
        table.add_weak_locked(&peer(1), "c");
        table.add_local_locked(&peer(2), "a");
        table.clear_all_locks(&peer(1));
        assert!(!table.is_locked(&peer(1)));
        assert!(table.is_locked(&peer(2)));
        table.clear();
        assert!(!table.is_locked(&peer(2)));
    }
}
