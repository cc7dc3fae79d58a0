use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier naming the subsystem or purpose that holds a connection lock
pub type LockId = String;

/// Canonical hex form of a node id, used as the key of every per-peer table
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn from_node_id(node_id: &[u8]) -> Self {
        Self(hex::encode(node_id))
    }

    /// Parse a hex address, normalizing it to lowercase
    pub fn parse(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        Ok(Self::from_node_id(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_node_id(&self) -> Vec<u8> {
        // Constructed only from bytes or validated hex
        hex::decode(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsocketEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl WebsocketEndpoint {
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    #[default]
    Node,
    Browser,
}

/// Reachability record of a peer. Two descriptors are the same peer iff
/// their node ids match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: Vec<u8>,
    #[serde(default)]
    pub kind: NodeKind,
    pub websocket: Option<WebsocketEndpoint>,
}

impl PeerDescriptor {
    pub fn new(node_id: impl Into<Vec<u8>>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: NodeKind::Node,
            websocket: None,
        }
    }

    pub fn with_websocket(mut self, host: impl Into<String>, port: u16, tls: bool) -> Self {
        self.websocket = Some(WebsocketEndpoint {
            host: host.into(),
            port,
            tls,
        });
        self
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::from_node_id(&self.node_id)
    }

    /// True when both descriptors advertise the same websocket host and port
    pub fn shares_websocket_endpoint(&self, other: &PeerDescriptor) -> bool {
        match (&self.websocket, &other.websocket) {
            (Some(a), Some(b)) => a.host == b.host && a.port == b.port,
            _ => false,
        }
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

/// Message and request id source, shared by everything that stamps ids on
/// outgoing envelopes. Ids are unique per process and unlikely to collide
/// across processes thanks to the random prefix.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: u64,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::with_prefix(rand::random())
    }

    pub fn with_prefix(prefix: u64) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{}", self.prefix, n)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_lowercase_hex() {
        let addr = PeerAddress::from_node_id(&[0xAB, 0x01]);
        assert_eq!(addr.as_str(), "ab01");
        assert_eq!(PeerAddress::parse("AB01").unwrap(), addr);
        assert_eq!(addr.to_node_id(), vec![0xAB, 0x01]);
    }

    #[test]
    fn test_descriptor_equality_ignores_reachability() {
        let a = PeerDescriptor::new(vec![1, 2, 3]).with_websocket("127.0.0.1", 9000, false);
        let b = PeerDescriptor::new(vec![1, 2, 3]);
        let c = PeerDescriptor::new(vec![4]).with_websocket("127.0.0.1", 9000, false);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.shares_websocket_endpoint(&c));
        assert!(!a.shares_websocket_endpoint(&b));
    }

    #[test]
    fn test_websocket_url() {
        let ws = WebsocketEndpoint {
            host: "example.org".to_string(),
            port: 443,
            tls: true,
        };
        assert_eq!(ws.url(), "wss://example.org:443");
    }

    #[test]
    fn test_id_generator_is_unique() {
        let ids = IdGenerator::with_prefix(7);
        let first = ids.next_id();
        let second = ids.next_id();
        assert_ne!(first, second);
        assert!(first.starts_with("0000000000000007-"));
    }
}
