//! Connection lock and graceful disconnect messages exchanged between
//! connection managers over the reserved internal service.

use crate::error::RpcError;
use crate::network::lock_table::LockTable;
use crate::network::message::{
    DisconnectMode, DisconnectNotice, LockRequest, LockResponse, RpcFailure, UnlockRequest,
};
use crate::network::rpc::{CallContext, RpcCommunicator, SendOptions};
use crate::types::{PeerAddress, PeerDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub const LOCK_REQUEST: &str = "lockRequest";
pub const UNLOCK_REQUEST: &str = "unlockRequest";
pub const GRACEFUL_DISCONNECT: &str = "gracefulDisconnect";

/// Client side, bound to one remote peer
pub struct LockRpcClient<'a> {
    rpc: &'a RpcCommunicator,
    target: &'a PeerDescriptor,
}

impl<'a> LockRpcClient<'a> {
    pub fn new(rpc: &'a RpcCommunicator, target: &'a PeerDescriptor) -> Self {
        Self { rpc, target }
    }

    /// Ask the peer to record a remote lock. Dials if needed.
    pub async fn lock(&self, lock_id: &str, timeout: Duration) -> Result<bool, RpcError> {
        let response: LockResponse = self
            .rpc
            .request(
                LOCK_REQUEST,
                &LockRequest {
                    lock_id: lock_id.to_string(),
                },
                self.target,
                SendOptions::default(),
                timeout,
            )
            .await?;
        Ok(response.accepted)
    }

    /// Only sent over an existing session
    pub fn unlock(&self, lock_id: &str) -> Result<(), RpcError> {
        self.rpc.notify(
            UNLOCK_REQUEST,
            &UnlockRequest {
                lock_id: lock_id.to_string(),
            },
            self.target,
            SendOptions::existing_connection(),
        )
    }

    /// Sent while the local manager may already be stopping
    pub fn graceful_disconnect(&self, mode: DisconnectMode) -> Result<(), RpcError> {
        self.rpc.notify(
            GRACEFUL_DISCONNECT,
            &DisconnectNotice { mode },
            self.target,
            SendOptions {
                connect: false,
                send_if_stopped: true,
            },
        )
    }
}

pub type DisconnectHandler = Arc<dyn Fn(&PeerDescriptor, bool) + Send + Sync>;

/// Server side handlers
pub struct LockRpcServer {
    local: PeerAddress,
    locks: Arc<LockTable>,
    on_disconnect: DisconnectHandler,
}

impl LockRpcServer {
    pub fn new(local: PeerAddress, locks: Arc<LockTable>, on_disconnect: DisconnectHandler) -> Self {
        Self {
            local,
            locks,
            on_disconnect,
        }
    }

    pub fn lock_request(&self, request: &LockRequest, source: &PeerDescriptor) -> LockResponse {
        let sender = source.address();
        if sender == self.local {
            debug!("🔒 Rejecting lock {} requested by ourselves", request.lock_id);
            return LockResponse { accepted: false };
        }
        self.locks.add_remote_locked(&sender, &request.lock_id);
        trace!("🔒 Remote lock {} recorded for {}", request.lock_id, sender);
        LockResponse { accepted: true }
    }

    pub fn unlock_request(&self, request: &UnlockRequest, source: &PeerDescriptor) {
        let sender = source.address();
        self.locks.remove_remote_locked(&sender, &request.lock_id);
        trace!("🔓 Remote lock {} released by {}", request.lock_id, sender);
    }

    pub fn graceful_disconnect(&self, notice: &DisconnectNotice, source: &PeerDescriptor) {
        let graceful = notice.mode == DisconnectMode::Leaving;
        debug!(
            "👋 {} announced disconnect ({:?})",
            source.address(),
            notice.mode
        );
        (self.on_disconnect)(source, graceful);
    }

    pub fn register(self: Arc<Self>, rpc: &RpcCommunicator) {
        let server = self.clone();
        rpc.register_method(
            LOCK_REQUEST,
            move |request: LockRequest, ctx: &CallContext| -> Result<LockResponse, RpcFailure> {
                Ok(server.lock_request(&request, &ctx.source))
            },
        );
        let server = self.clone();
        rpc.register_notification(UNLOCK_REQUEST, move |request: UnlockRequest, ctx: &CallContext| {
            server.unlock_request(&request, &ctx.source)
        });
        let server = self;
        rpc.register_notification(
            GRACEFUL_DISCONNECT,
            move |notice: DisconnectNotice, ctx: &CallContext| {
                server.graceful_disconnect(&notice, &ctx.source)
            },
        );
    }
}
