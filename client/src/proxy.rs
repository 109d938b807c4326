//! Local connector: one connection to the local service per remote session.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lighttunnel_shared::channel::OnClose;
use lighttunnel_shared::{ControlHandle, DataChannel, SessionTag, Side};
use tracing::debug;

/// How long a dial to the local service may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type SessionKey = (u64, u64);

/// Cache of local channels keyed by `(tunnel_id, session_id)`.
///
/// Channels dial lazily: the entry is inserted at once and bytes written before the dial
/// completes are queued. A channel whose local socket closes, or whose dial fails, reports
/// `LocalDisconnect` itself and drops out of the cache.
#[derive(Debug)]
pub struct LocalConnector {
    channels: Arc<DashMap<SessionKey, DataChannel>>,
    connect_timeout: Duration,
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            connect_timeout,
        }
    }

    /// The live channel for this session, or a new one dialing `local_addr:local_port`.
    pub fn acquire_local_channel(
        &self,
        local_addr: &str,
        local_port: u16,
        tunnel_id: u64,
        session_id: u64,
        control: &ControlHandle,
    ) -> DataChannel {
        let key = (tunnel_id, session_id);
        let dial = || {
            debug!(tunnel_id, session_id, addr = %local_addr, port = local_port, "Dialing local service");
            DataChannel::dial(
                local_addr.to_string(),
                local_port,
                self.connect_timeout,
                SessionTag {
                    tunnel_id,
                    session_id,
                    control: control.clone(),
                    side: Side::Local,
                    stats: None,
                },
                Some(self.evict_on_close(key)),
            )
        };

        match self.channels.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_closed() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let channel = dial();
                entry.insert(channel.clone());
                channel
            }
            Entry::Vacant(entry) => entry.insert(dial()).clone(),
        }
    }

    fn evict_on_close(&self, key: SessionKey) -> OnClose {
        let channels = Arc::downgrade(&self.channels);
        Box::new(move || {
            if let Some(channels) = channels.upgrade() {
                // A replacement channel may already sit under this key.
                channels.remove_if(&key, |_, channel| channel.is_closed());
            }
        })
    }

    pub fn get_local_channel(&self, tunnel_id: u64, session_id: u64) -> Option<DataChannel> {
        self.channels
            .get(&(tunnel_id, session_id))
            .map(|entry| entry.value().clone())
    }

    /// Evict the session. The caller closes the returned channel.
    pub fn remove_local_channel(&self, tunnel_id: u64, session_id: u64) -> Option<DataChannel> {
        self.channels
            .remove(&(tunnel_id, session_id))
            .map(|(_, channel)| channel)
    }

    /// Close every session of one tunnel.
    pub fn remove_tunnel(&self, tunnel_id: u64) {
        let keys: Vec<SessionKey> = self
            .channels
            .iter()
            .filter(|entry| entry.key().0 == tunnel_id)
            .map(|entry| *entry.key())
            .collect();
        for (tid, sid) in keys {
            if let Some(channel) = self.remove_local_channel(tid, sid) {
                channel.close();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
