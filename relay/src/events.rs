//! Lifecycle notifications emitted by the relay.

use lighttunnel_shared::{RemoteConnection, TunnelRequest};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    TcpTunnelConnected {
        tunnel_id: u64,
        remote_port: u16,
        request: TunnelRequest,
    },
    TcpTunnelDisconnect {
        tunnel_id: u64,
        remote_port: u16,
    },
    HttpTunnelConnected {
        tunnel_id: u64,
        vhost: String,
        https: bool,
        request: TunnelRequest,
    },
    HttpTunnelDisconnect {
        tunnel_id: u64,
        vhost: String,
        https: bool,
    },
    RemoteConnected {
        tunnel_id: u64,
        session_id: u64,
        remote: RemoteConnection,
    },
    RemoteDisconnect {
        tunnel_id: u64,
        session_id: u64,
        remote: RemoteConnection,
    },
}

/// Where events go. Without a subscriber they are dropped.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<ServerEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ServerEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
