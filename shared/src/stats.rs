//! Per-tunnel traffic counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes moved through a tunnel's sessions. "Inbound" is what external peers sent towards the
/// local service, "outbound" is what came back.
#[derive(Debug)]
pub struct TrafficStats {
    inbound_bytes: AtomicU64,
    outbound_bytes: AtomicU64,
    created_at_ms: i64,
    updated_at_ms: AtomicI64,
}

impl TrafficStats {
    pub fn new() -> Self {
        let now = now_ms();
        Self {
            inbound_bytes: AtomicU64::new(0),
            outbound_bytes: AtomicU64::new(0),
            created_at_ms: now,
            updated_at_ms: AtomicI64::new(now),
        }
    }

    pub fn add_inbound(&self, n: usize) {
        self.inbound_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_outbound(&self, n: usize) {
        self.outbound_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.updated_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn inbound_bytes(&self) -> u64 {
        self.inbound_bytes.load(Ordering::Relaxed)
    }

    pub fn outbound_bytes(&self) -> u64 {
        self.outbound_bytes.load(Ordering::Relaxed)
    }

    /// Milliseconds since the Unix epoch.
    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn updated_at_ms(&self) -> i64 {
        self.updated_at_ms.load(Ordering::Relaxed)
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
