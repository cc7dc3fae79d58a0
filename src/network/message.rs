use crate::types::PeerDescriptor;
use serde::{Deserialize, Serialize};

/// Outer envelope exchanged between peers
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message {
    pub service_id: String,
    pub message_id: String,
    pub source: Option<PeerDescriptor>,
    pub target: Option<PeerDescriptor>,
    pub body: MessageBody,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum MessageBody {
    Rpc(RpcMessage),
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
}

impl Message {
    pub fn rpc(&self) -> Option<&RpcMessage> {
        match &self.body {
            MessageBody::Rpc(rpc) => Some(rpc),
            _ => None,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match &self.body {
            MessageBody::Rpc(_) => "Rpc",
            MessageBody::HandshakeRequest(_) => "HandshakeRequest",
            MessageBody::HandshakeResponse(_) => "HandshakeResponse",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Request,
    Response,
    Notification,
}

/// Failure carried back in an RPC response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RpcFailure {
    UnknownMethod,
    Server(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcMessage {
    pub request_id: String,
    pub method: String,
    pub kind: RpcKind,
    pub payload: Vec<u8>,
    pub error: Option<RpcFailure>,
}

// Handshake

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    UnsupportedVersion,
    InvalidTargetPeerDescriptor,
    DuplicateConnection,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandshakeRequest {
    pub source: PeerDescriptor,
    pub target: Option<PeerDescriptor>,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandshakeResponse {
    pub source: PeerDescriptor,
    pub version: String,
    pub error: Option<HandshakeError>,
}

// Connection locking

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockRequest {
    pub lock_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockResponse {
    pub accepted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UnlockRequest {
    pub lock_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    Normal,
    Leaving,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DisconnectNotice {
    pub mode: DisconnectMode,
}
