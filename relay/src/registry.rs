//! Tunnel registries: which session pool owns which public port or vhost.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use lighttunnel_shared::{Error, ProtoMsg, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::tunnel::{SessionPool, TunnelDescriptor};

/// How long `force_off` waits for the client's `ForceOffReply`.
pub const FORCE_OFF_TIMEOUT: Duration = Duration::from_secs(5);

struct Entry {
    pool: Arc<SessionPool>,
    /// Accept loop of a TCP tunnel; aborting it releases the port.
    listener: Option<AbortHandle>,
}

/// Key → session pool, one owner per key.
pub struct Registry<K> {
    entries: Mutex<HashMap<K, Entry>>,
    force_off_timeout: Duration,
}

impl<K> Registry<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self::with_force_off_timeout(FORCE_OFF_TIMEOUT)
    }

    pub fn with_force_off_timeout(force_off_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            force_off_timeout,
        }
    }

    pub fn is_registered(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn insert_with<F>(&self, key: K, make: F) -> Result<()>
    where
        F: FnOnce() -> Result<Entry>,
    {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(Error::AlreadyInUse(key.to_string()));
        }
        let entry = make()?;
        debug!(key = %key, tunnel_id = entry.pool.tunnel_id(), "Registered tunnel");
        entries.insert(key, entry);
        Ok(())
    }

    pub fn get(&self, key: &K) -> Option<Arc<SessionPool>> {
        self.entries.lock().get(key).map(|e| e.pool.clone())
    }

    /// Remove the entry, close all of its sessions and release the key.
    pub fn unregister(&self, key: &K) -> Option<Arc<SessionPool>> {
        let entry = self.entries.lock().remove(key)?;
        Some(teardown(key, entry))
    }

    /// Like [`Registry::unregister`], but only if `key` still belongs to `tunnel_id`.
    pub fn unregister_owned(&self, key: &K, tunnel_id: u64) -> Option<Arc<SessionPool>> {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.pool.tunnel_id() == tunnel_id => entries.remove(key)?,
                _ => return None,
            }
        };
        Some(teardown(key, entry))
    }

    /// Evict the tunnel on `key`: ask the client to go away, wait for its acknowledgement (or
    /// the timeout), then unregister and close the control connection.
    pub async fn force_off(&self, key: &K) -> Option<Arc<SessionPool>> {
        let pool = self.get(key)?;
        info!(key = %key, tunnel_id = pool.tunnel_id(), "Forcing tunnel off");

        if pool.control().send(ProtoMsg::ForceOff).is_ok()
            && tokio::time::timeout(self.force_off_timeout, pool.force_off_acked())
                .await
                .is_err()
        {
            warn!(key = %key, tunnel_id = pool.tunnel_id(), "No force-off reply, closing anyway");
        }

        let removed = self.unregister_owned(key, pool.tunnel_id());
        pool.control().close();
        removed.or(Some(pool))
    }

    pub fn snapshot(&self) -> Vec<TunnelDescriptor> {
        let pools: Vec<Arc<SessionPool>> =
            self.entries.lock().values().map(|e| e.pool.clone()).collect();
        let mut descriptors: Vec<_> = pools.iter().map(|p| p.descriptor()).collect();
        descriptors.sort_by_key(|d| d.tunnel_id);
        descriptors
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for Registry<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

fn teardown<K: Display>(key: &K, entry: Entry) -> Arc<SessionPool> {
    if let Some(listener) = entry.listener {
        listener.abort();
    }
    entry.pool.close_all();
    debug!(key = %key, tunnel_id = entry.pool.tunnel_id(), "Unregistered tunnel");
    entry.pool
}

/// Tunnels on public TCP ports.
pub struct TcpRegistry {
    core: Registry<u16>,
    bind_addr: IpAddr,
}

impl TcpRegistry {
    pub fn new(bind_addr: IpAddr) -> Self {
        Self {
            core: Registry::new(),
            bind_addr,
        }
    }

    pub fn with_force_off_timeout(bind_addr: IpAddr, timeout: Duration) -> Self {
        Self {
            core: Registry::with_force_off_timeout(timeout),
            bind_addr,
        }
    }

    pub fn bind_addr(&self) -> IpAddr {
        self.bind_addr
    }

    /// Claim `port` for `pool`.
    ///
    /// Besides the registry check the port must actually be bindable: the listener bound here
    /// is handed to `serve`, which spawns the accept loop and returns its abort handle.
    pub fn register<F>(&self, port: u16, pool: Arc<SessionPool>, serve: F) -> Result<()>
    where
        F: FnOnce(TcpListener, Arc<SessionPool>) -> AbortHandle,
    {
        self.core.insert_with(port, || {
            let listener = std::net::TcpListener::bind((self.bind_addr, port))
                .map_err(|e| Error::AlreadyInUse(format!("port {port}: {e}")))?;
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            let abort = serve(listener, pool.clone());
            Ok(Entry {
                pool,
                listener: Some(abort),
            })
        })
    }
}

impl Deref for TcpRegistry {
    type Target = Registry<u16>;

    fn deref(&self) -> &Registry<u16> {
        &self.core
    }
}

/// Tunnels routed by `Host` header. Keys match exactly and case-sensitively.
pub struct HttpRegistry {
    core: Registry<String>,
}

impl HttpRegistry {
    pub fn new() -> Self {
        Self {
            core: Registry::new(),
        }
    }

    pub fn with_force_off_timeout(timeout: Duration) -> Self {
        Self {
            core: Registry::with_force_off_timeout(timeout),
        }
    }

    pub fn register(&self, vhost: &str, pool: Arc<SessionPool>) -> Result<()> {
        self.core
            .insert_with(vhost.to_string(), || Ok(Entry { pool, listener: None }))
    }
}

impl Default for HttpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for HttpRegistry {
    type Target = Registry<String>;

    fn deref(&self) -> &Registry<String> {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::probe_port;
    use crate::tunnel::tests::{channel_for, test_pool};
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn idle_accept(listener: TcpListener, _pool: Arc<SessionPool>) -> AbortHandle {
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        })
        .abort_handle()
    }

    fn free_port() -> u16 {
        crate::policy::ephemeral_port(LOCALHOST).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_vhost_rejected() {
        let registry = HttpRegistry::new();
        let (first, _rx1) = test_pool(1);
        let (second, _rx2) = test_pool(2);

        registry.register("a.example.com", first).unwrap();
        let err = registry.register("a.example.com", second).unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse(_)));
        assert_eq!(registry.get(&"a.example.com".to_string()).unwrap().tunnel_id(), 1);

        // Case-sensitive exact match
        let (third, _rx3) = test_pool(3);
        registry.register("A.example.com", third).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_register_single_winner() {
        let registry = Arc::new(HttpRegistry::new());
        let handles: Vec<_> = (0..16u64)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let (pool, _rx) = test_pool(i + 1);
                    registry.register("race.example.com", pool).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_cascades() {
        let registry = HttpRegistry::new();
        let (pool, _rx) = test_pool(1);
        let mut peers = Vec::new();
        let ids: Vec<u64> = (0..3)
            .map(|_| {
                pool.put_session(|id| {
                    let (channel, peer) = channel_for(&pool, id);
                    peers.push(peer);
                    channel
                })
            })
            .collect();
        registry.register("a.example.com", pool.clone()).unwrap();

        let removed = registry.unregister(&"a.example.com".to_string()).unwrap();
        for id in ids {
            assert!(removed.get_session(id).is_none());
        }
        for mut peer in peers {
            let mut buf = Vec::new();
            assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
        }

        let (again, _rx2) = test_pool(2);
        registry.register("a.example.com", again).unwrap();
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_unregister() {
        let registry = HttpRegistry::new();
        let (pool, _rx) = test_pool(7);
        registry.register("a.example.com", pool).unwrap();
        let key = "a.example.com".to_string();
        assert!(registry.unregister_owned(&key, 6).is_none());
        assert!(registry.is_registered(&key));
        assert!(registry.unregister_owned(&key, 7).is_some());
        assert!(!registry.is_registered(&key));
    }

    #[tokio::test]
    async fn test_tcp_register_binds_and_releases() {
        let registry = TcpRegistry::new(LOCALHOST);
        let port = free_port();
        let (pool, _rx) = test_pool(1);
        registry.register(port, pool, idle_accept).unwrap();
        assert!(registry.is_registered(&port));
        assert!(!probe_port(LOCALHOST, port));

        let (other, _rx2) = test_pool(2);
        assert!(matches!(
            registry.register(port, other, idle_accept),
            Err(Error::AlreadyInUse(_))
        ));

        registry.unregister(&port).unwrap();
        // Give the aborted accept loop a chance to drop its listener
        for _ in 0..50 {
            if probe_port(LOCALHOST, port) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(probe_port(LOCALHOST, port));

        let (third, _rx3) = test_pool(3);
        registry.register(port, third, idle_accept).unwrap();
    }

    #[tokio::test]
    async fn test_tcp_register_port_taken_elsewhere() {
        let holder = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let registry = TcpRegistry::new(LOCALHOST);
        let (pool, _rx) = test_pool(1);
        assert!(registry.register(port, pool, idle_accept).is_err());
        assert!(!registry.is_registered(&port));
    }

    #[tokio::test]
    async fn test_force_off_waits_for_reply() {
        let registry = HttpRegistry::with_force_off_timeout(Duration::from_secs(5));
        let (pool, mut rx) = test_pool(1);
        registry.register("a.example.com", pool.clone()).unwrap();

        let client = tokio::spawn(async move {
            assert_eq!(rx.recv().await, Some(ProtoMsg::ForceOff));
            pool.ack_force_off();
        });

        let evicted = registry.force_off(&"a.example.com".to_string()).await.unwrap();
        client.await.unwrap();
        assert_eq!(evicted.tunnel_id(), 1);
        assert!(evicted.control().is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_off_times_out() {
        let registry = HttpRegistry::new();
        let (pool, _rx) = test_pool(1);
        registry.register("a.example.com", pool).unwrap();
        let started = tokio::time::Instant::now();
        assert!(registry.force_off(&"a.example.com".to_string()).await.is_some());
        assert!(started.elapsed() >= FORCE_OFF_TIMEOUT);
        assert!(registry.is_empty());
        assert!(registry.force_off(&"a.example.com".to_string()).await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_sorted() {
        let registry = HttpRegistry::new();
        for (id, host) in [(3, "c"), (1, "a"), (2, "b")] {
            let (pool, _rx) = test_pool(id);
            registry.register(host, pool).unwrap();
        }
        let ids: Vec<u64> = registry.snapshot().iter().map(|d| d.tunnel_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
