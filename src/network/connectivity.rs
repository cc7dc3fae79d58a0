//! Reachability rules and the timeouts derived from them.

use crate::constants::rpc;
use crate::network::channel::ChannelKind;
use crate::types::{NodeKind, PeerDescriptor, WebsocketEndpoint};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Whether a browser node could open a connection to this server
pub fn can_open_connection_from_browser(ws: &WebsocketEndpoint) -> bool {
    ws.tls || ws.host == "localhost" || is_private_ipv4(&ws.host)
}

pub fn is_private_ipv4(host: &str) -> bool {
    host.parse::<Ipv4Addr>()
        .map(|ip| ip.is_private() || ip.is_loopback())
        .unwrap_or(false)
}

/// How a connection between these two peers would be opened
pub fn expected_connection_type(local: &PeerDescriptor, remote: &PeerDescriptor) -> ChannelKind {
    if let Some(ws) = &remote.websocket {
        if local.kind != NodeKind::Browser || can_open_connection_from_browser(ws) {
            return ChannelKind::WsClient;
        }
    }
    if let Some(ws) = &local.websocket {
        if remote.kind != NodeKind::Browser || can_open_connection_from_browser(ws) {
            return ChannelKind::WsServer;
        }
    }
    ChannelKind::WebRtc
}

pub fn rpc_timeout(kind: ChannelKind) -> Duration {
    match kind {
        ChannelKind::WsClient => rpc::WEBSOCKET_CLIENT_TIMEOUT,
        ChannelKind::WsServer => rpc::WEBSOCKET_SERVER_TIMEOUT,
        ChannelKind::WebRtc => rpc::WEBRTC_TIMEOUT,
        ChannelKind::SimulatorClient | ChannelKind::SimulatorServer => {
            rpc::EXISTING_CONNECTION_TIMEOUT
        }
    }
}

/// Timeout for an RPC to `remote`, shorter when a session is already up
pub fn request_timeout(local: &PeerDescriptor, remote: &PeerDescriptor, connected: bool) -> Duration {
    if connected {
        rpc::EXISTING_CONNECTION_TIMEOUT
    } else {
        rpc_timeout(expected_connection_type(local, remote))
    }
}
