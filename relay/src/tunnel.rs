//! Session pool for one bound tunnel.
//!
//! One pool per accepted tunnel request: it owns the control handle, the final request and
//! every live session opened through the tunnel's public port or vhost.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use lighttunnel_shared::channel::OnClose;
use lighttunnel_shared::stats::TrafficStats;
use lighttunnel_shared::{
    ControlHandle, DataChannel, ProtoMsg, RemoteConnection, SessionTag, Side, TunnelRequest,
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::debug;

use crate::events::{EventSink, ServerEvent};

pub struct SessionPool {
    tunnel_id: u64,
    request: TunnelRequest,
    control: ControlHandle,
    next_session_id: AtomicU64,
    sessions: RwLock<HashMap<u64, DataChannel>>,
    stats: Arc<TrafficStats>,
    force_off_ack: Notify,
}

impl SessionPool {
    pub fn new(tunnel_id: u64, request: TunnelRequest, control: ControlHandle) -> Self {
        Self {
            tunnel_id,
            request,
            control,
            next_session_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            stats: Arc::new(TrafficStats::new()),
            force_off_ack: Notify::new(),
        }
    }

    pub fn tunnel_id(&self) -> u64 {
        self.tunnel_id
    }

    /// The final request, as confirmed to the client.
    pub fn request(&self) -> &TunnelRequest {
        &self.request
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    /// Starts at 1; never repeats for this pool.
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate an id, build the session's channel for it and store it.
    ///
    /// `make` runs under the map's write lock so nobody can observe the id before its
    /// channel is in place. It must not block.
    pub fn put_session<F>(&self, make: F) -> u64
    where
        F: FnOnce(u64) -> DataChannel,
    {
        let mut sessions = self.sessions.write();
        let session_id = self.next_session_id();
        sessions.insert(session_id, make(session_id));
        session_id
    }

    pub fn get_session(&self, session_id: u64) -> Option<DataChannel> {
        self.sessions.read().get(&session_id).cloned()
    }

    /// Remove and return the session. The caller decides how to close it.
    pub fn remove_session(&self, session_id: u64) -> Option<DataChannel> {
        self.sessions.write().remove(&session_id)
    }

    /// Flush and close every session, then forget them.
    pub fn close_all(&self) {
        let sessions: Vec<DataChannel> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    /// Open a session for an external peer that connected to this tunnel.
    ///
    /// The client hears `RemoteConnected` first, then `first` (bytes the relay already read,
    /// such as a rewritten HTTP head), then whatever the peer sends next. The session removes
    /// itself from the pool when the peer goes away.
    pub fn accept_remote<S>(
        self: &Arc<Self>,
        stream: S,
        peer: SocketAddr,
        first: Option<Bytes>,
        events: &EventSink,
    ) -> u64
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let tunnel_id = self.tunnel_id;
        let remote = RemoteConnection::new(peer);
        let pool = Arc::downgrade(self);

        self.put_session(|session_id| {
            let mut opening = vec![ProtoMsg::RemoteConnected {
                tunnel_id,
                session_id,
                data: remote.to_bytes(),
            }];
            if let Some(first) = first.filter(|b| !b.is_empty()) {
                self.stats.add_inbound(first.len());
                opening.push(ProtoMsg::Transfer {
                    tunnel_id,
                    session_id,
                    data: first,
                });
            }

            events.emit(ServerEvent::RemoteConnected {
                tunnel_id,
                session_id,
                remote: remote.clone(),
            });
            debug!(tunnel_id, session_id, peer = %peer, "Remote connected");

            let events = events.clone();
            let closing = remote.clone();
            let on_close: OnClose = Box::new(move || {
                if let Some(pool) = pool.upgrade() {
                    pool.remove_session(session_id);
                }
                events.emit(ServerEvent::RemoteDisconnect {
                    tunnel_id,
                    session_id,
                    remote: closing,
                });
            });

            let tag = SessionTag {
                tunnel_id,
                session_id,
                control: self.control.clone(),
                side: Side::Remote(remote),
                stats: Some(self.stats.clone()),
            };
            DataChannel::spawn(stream, tag, opening, Some(on_close))
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub(crate) fn ack_force_off(&self) {
        self.force_off_ack.notify_one();
    }

    pub(crate) async fn force_off_acked(&self) {
        self.force_off_ack.notified().await
    }

    pub fn descriptor(&self) -> TunnelDescriptor {
        TunnelDescriptor {
            tunnel_id: self.tunnel_id,
            request: self.request.redacted(),
            connections: self.session_count(),
            inbound_bytes: self.stats.inbound_bytes(),
            outbound_bytes: self.stats.outbound_bytes(),
            created_at: timestamp(self.stats.created_at_ms()),
            updated_at: timestamp(self.stats.updated_at_ms()),
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("tunnel_id", &self.tunnel_id)
            .field("request", &self.request.to_string())
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Read-only view of a tunnel for the admin snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDescriptor {
    pub tunnel_id: u64,
    pub request: TunnelRequest,
    pub connections: usize,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
