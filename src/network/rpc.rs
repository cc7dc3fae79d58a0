//! Request/response and notification calls carried in message envelopes.
//!
//! One communicator serves one service id. Outgoing envelopes are handed to
//! an injected sender (the connection manager), incoming ones arrive through
//! `handle_message_from_peer`. Pending requests wait on a oneshot channel
//! under a timeout.

use crate::error::{ConnectionError, RpcError};
use crate::network::message::{Message, MessageBody, RpcFailure, RpcKind, RpcMessage};
use crate::types::{IdGenerator, PeerDescriptor};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// How an outgoing envelope may be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Open a connection if none exists
    pub connect: bool,
    /// Allow sending while the manager is shutting down
    pub send_if_stopped: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            connect: true,
            send_if_stopped: false,
        }
    }
}

impl SendOptions {
    pub fn existing_connection() -> Self {
        Self {
            connect: false,
            send_if_stopped: false,
        }
    }
}

/// Caller information passed to handlers
#[derive(Debug, Clone)]
pub struct CallContext {
    pub source: PeerDescriptor,
}

pub type OutgoingSender =
    Arc<dyn Fn(Message, SendOptions) -> Result<(), ConnectionError> + Send + Sync>;

type MethodHandler =
    Arc<dyn Fn(&[u8], &CallContext) -> Result<Vec<u8>, RpcFailure> + Send + Sync>;
type NotificationHandler = Arc<dyn Fn(&[u8], &CallContext) + Send + Sync>;
type PendingReply = oneshot::Sender<Result<Vec<u8>, RpcFailure>>;

pub struct RpcCommunicator {
    service_id: String,
    ids: Arc<IdGenerator>,
    outgoing: OutgoingSender,
    methods: DashMap<String, MethodHandler>,
    notifications: DashMap<String, NotificationHandler>,
    pending: DashMap<String, PendingReply>,
}

impl RpcCommunicator {
    pub fn new(service_id: impl Into<String>, ids: Arc<IdGenerator>, outgoing: OutgoingSender) -> Self {
        Self {
            service_id: service_id.into(),
            ids,
            outgoing,
            methods: DashMap::new(),
            notifications: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn register_method<Req, Resp, F>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req, &CallContext) -> Result<Resp, RpcFailure> + Send + Sync + 'static,
    {
        let name = method.to_string();
        let erased: MethodHandler = Arc::new(move |payload: &[u8], ctx: &CallContext| {
            let request: Req = bincode::deserialize(payload)
                .map_err(|e| RpcFailure::Server(format!("bad {} request: {}", name, e)))?;
            let response = handler(request, ctx)?;
            bincode::serialize(&response)
                .map_err(|e| RpcFailure::Server(format!("bad {} response: {}", name, e)))
        });
        self.methods.insert(method.to_string(), erased);
    }

    pub fn register_notification<Req, F>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned,
        F: Fn(Req, &CallContext) + Send + Sync + 'static,
    {
        let name = method.to_string();
        let erased: NotificationHandler = Arc::new(move |payload: &[u8], ctx: &CallContext| {
            match bincode::deserialize::<Req>(payload) {
                Ok(request) => handler(request, ctx),
                Err(e) => warn!("Dropping malformed {} notification: {}", name, e),
            }
        });
        self.notifications.insert(method.to_string(), erased);
    }

    fn envelope(&self, target: &PeerDescriptor, rpc: RpcMessage) -> Message {
        Message {
            service_id: self.service_id.clone(),
            message_id: self.ids.next_id(),
            source: None,
            target: Some(target.clone()),
            body: MessageBody::Rpc(rpc),
        }
    }

    /// Call `method` on `target` and wait for its response
    pub async fn request<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        target: &PeerDescriptor,
        options: SendOptions,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = bincode::serialize(request).map_err(|e| RpcError::Client(e.to_string()))?;
        let request_id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let message = self.envelope(
            target,
            RpcMessage {
                request_id: request_id.clone(),
                method: method.to_string(),
                kind: RpcKind::Request,
                payload,
                error: None,
            },
        );
        if let Err(e) = (self.outgoing)(message, options) {
            self.pending.remove(&request_id);
            return Err(e.into());
        }
        trace!("📤 RPC {} ({}) sent to {}", method, request_id, target.address());

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.remove(&request_id);
        match result {
            Ok(Ok(Ok(bytes))) => {
                bincode::deserialize(&bytes).map_err(|e| RpcError::Client(e.to_string()))
            }
            Ok(Ok(Err(RpcFailure::UnknownMethod))) => Err(RpcError::UnknownMethod(method.to_string())),
            Ok(Ok(Err(RpcFailure::Server(reason)))) => Err(RpcError::Server(reason)),
            Ok(Err(_)) => Err(RpcError::Client(format!("{} request cancelled", method))),
            Err(_) => Err(RpcError::Timeout(timeout)),
        }
    }

    /// Fire a notification. Completes once the envelope is handed to the session.
    pub fn notify<Req>(
        &self,
        method: &str,
        notification: &Req,
        target: &PeerDescriptor,
        options: SendOptions,
    ) -> Result<(), RpcError>
    where
        Req: Serialize,
    {
        let payload =
            bincode::serialize(notification).map_err(|e| RpcError::Client(e.to_string()))?;
        let message = self.envelope(
            target,
            RpcMessage {
                request_id: self.ids.next_id(),
                method: method.to_string(),
                kind: RpcKind::Notification,
                payload,
                error: None,
            },
        );
        (self.outgoing)(message, options)?;
        trace!("📤 RPC notification {} sent to {}", method, target.address());
        Ok(())
    }

    pub fn handle_message_from_peer(&self, message: &Message) {
        let Some(rpc) = message.rpc() else {
            return;
        };
        let Some(source) = message.source.clone() else {
            warn!("Dropping RPC {} without a source", rpc.method);
            return;
        };
        let ctx = CallContext { source };

        match rpc.kind {
            RpcKind::Request => self.handle_request(rpc, &ctx),
            RpcKind::Response => {
                match self.pending.remove(&rpc.request_id) {
                    Some((_, tx)) => {
                        let outcome = match &rpc.error {
                            Some(failure) => Err(failure.clone()),
                            None => Ok(rpc.payload.clone()),
                        };
                        // Receiver may have timed out already
                        let _ = tx.send(outcome);
                    }
                    None => debug!(
                        "Response for unknown or expired request {} ({})",
                        rpc.request_id, rpc.method
                    ),
                }
            }
            RpcKind::Notification => {
                let handler = self.notifications.get(&rpc.method).map(|h| h.clone());
                match handler {
                    Some(handler) => handler(&rpc.payload, &ctx),
                    None => debug!("No handler for notification {}", rpc.method),
                }
            }
        }
    }

    fn handle_request(&self, rpc: &RpcMessage, ctx: &CallContext) {
        let handler = self.methods.get(&rpc.method).map(|h| h.clone());
        let outcome = match handler {
            Some(handler) => handler(&rpc.payload, ctx),
            None => {
                debug!("Unknown RPC method {} from {}", rpc.method, ctx.source.address());
                Err(RpcFailure::UnknownMethod)
            }
        };
        let (payload, error) = match outcome {
            Ok(bytes) => (bytes, None),
            Err(failure) => (Vec::new(), Some(failure)),
        };
        let response = self.envelope(
            &ctx.source,
            RpcMessage {
                request_id: rpc.request_id.clone(),
                method: rpc.method.clone(),
                kind: RpcKind::Response,
                payload,
                error,
            },
        );
        if let Err(e) = (self.outgoing)(response, SendOptions::existing_connection()) {
            warn!("Failed to answer {} from {}: {}", rpc.method, ctx.source.address(), e);
        }
    }

    /// Fail every request still waiting for a response
    pub fn cancel_pending(&self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Pong {
        n: u32,
    }

    fn peer(id: u8) -> PeerDescriptor {
        PeerDescriptor::new(vec![id])
    }

    /// Two communicators wired back to back through a task hop
    fn pair() -> (Arc<RpcCommunicator>, Arc<RpcCommunicator>) {
        let ids = Arc::new(IdGenerator::new());
        let a_slot: Arc<Mutex<Option<Arc<RpcCommunicator>>>> = Arc::new(Mutex::new(None));
        let b_slot: Arc<Mutex<Option<Arc<RpcCommunicator>>>> = Arc::new(Mutex::new(None));

        let route = |to: Arc<Mutex<Option<Arc<RpcCommunicator>>>>, from: PeerDescriptor| -> OutgoingSender {
            Arc::new(move |mut message: Message, _opts: SendOptions| {
                message.source = Some(from.clone());
                let to = to.lock().clone();
                if let Some(to) = to {
                    tokio::spawn(async move { to.handle_message_from_peer(&message) });
                    Ok(())
                } else {
                    Err(ConnectionError::SendFailed("no route".into()))
                }
            })
        };

        let a = Arc::new(RpcCommunicator::new("svc", ids.clone(), route(b_slot.clone(), peer(1))));
        let b = Arc::new(RpcCommunicator::new("svc", ids, route(a_slot.clone(), peer(2))));
        *a_slot.lock() = Some(a.clone());
        *b_slot.lock() = Some(b.clone());
        (a, b)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (a, b) = pair();
        b.register_method("ping", |req: Ping, ctx: &CallContext| {
            assert_eq!(ctx.source, peer(1));
            Ok(Pong { n: req.n + 1 })
        });

        let pong: Pong = a
            .request("ping", &Ping { n: 41 }, &peer(2), SendOptions::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pong, Pong { n: 42 });
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (a, _b) = pair();
        let result: Result<Pong, _> = a
            .request("nope", &Ping { n: 1 }, &peer(2), SendOptions::default(), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(RpcError::UnknownMethod("nope".into())));
    }

    #[tokio::test]
    async fn test_server_error_is_returned() {
        let (a, b) = pair();
        b.register_method("fail", |_: Ping, _: &CallContext| -> Result<Pong, RpcFailure> {
            Err(RpcFailure::Server("broken".into()))
        });
        let result: Result<Pong, _> = a
            .request("fail", &Ping { n: 1 }, &peer(2), SendOptions::default(), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(RpcError::Server("broken".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let ids = Arc::new(IdGenerator::new());
        let blackhole: OutgoingSender = Arc::new(|_: Message, _: SendOptions| Ok(()));
        let rpc = RpcCommunicator::new("svc", ids, blackhole);

        let result: Result<Pong, _> = rpc
            .request("ping", &Ping { n: 1 }, &peer(2), SendOptions::default(), Duration::from_secs(5))
            .await;
        assert_eq!(result, Err(RpcError::Timeout(Duration::from_secs(5))));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_is_client_error() {
        let ids = Arc::new(IdGenerator::new());
        let failing: OutgoingSender =
            Arc::new(|_: Message, _: SendOptions| {
            Err(ConnectionError::SendFailed("unreachable".into()))
        });
        let rpc = RpcCommunicator::new("svc", ids, failing);

        let result: Result<Pong, _> = rpc
            .request("ping", &Ping { n: 1 }, &peer(2), SendOptions::default(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RpcError::Client(_))));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        let (a, b) = pair();
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        b.register_notification("tick", move |req: Ping, _: &CallContext| g.lock().push(req.n));

        a.notify("tick", &Ping { n: 7 }, &peer(2), SendOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*got.lock(), vec![7]);
    }
}
