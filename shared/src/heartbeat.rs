//! Idle-state watchdog for control connections.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default interval without outbound traffic before a `Ping` is sent.
pub const DEFAULT_WRITE_IDLE: Duration = Duration::from_secs(30);

/// Default interval without inbound traffic before the connection is dropped.
pub const DEFAULT_READ_IDLE: Duration = Duration::from_secs(90);

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub write_idle: Duration,
    pub read_idle: Duration,
    /// How often the watchdog is polled.
    pub tick: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_idle: DEFAULT_WRITE_IDLE,
            read_idle: DEFAULT_READ_IDLE,
            tick: DEFAULT_TICK,
        }
    }
}

impl HeartbeatConfig {
    pub fn from_secs(write_idle_secs: u64, read_idle_secs: u64) -> Self {
        Self {
            write_idle: Duration::from_secs(write_idle_secs),
            read_idle: Duration::from_secs(read_idle_secs),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Active,
    /// Nothing written for `write_idle`: send a ping.
    WriteIdle,
    /// Nothing read for `read_idle`: the peer is gone.
    ReadIdle,
}

#[derive(Debug)]
struct Clocks {
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

/// Tracks the last read and write on one connection. Cloned into the writer task.
#[derive(Debug, Clone)]
pub struct IdleWatchdog {
    config: HeartbeatConfig,
    clocks: Arc<Clocks>,
}

impl IdleWatchdog {
    pub fn new(config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            clocks: Arc::new(Clocks {
                last_read: Mutex::new(now),
                last_write: Mutex::new(now),
            }),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn touch_read(&self) {
        *self.clocks.last_read.lock() = Instant::now();
    }

    pub fn touch_write(&self) {
        *self.clocks.last_write.lock() = Instant::now();
    }

    /// Read idleness wins over write idleness.
    pub fn check(&self) -> IdleState {
        let now = Instant::now();
        if now.duration_since(*self.clocks.last_read.lock()) >= self.config.read_idle {
            IdleState::ReadIdle
        } else if now.duration_since(*self.clocks.last_write.lock()) >= self.config.write_idle {
            IdleState::WriteIdle
        } else {
            IdleState::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig::from_secs(30, 90)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_watchdog_is_active() {
        let dog = IdleWatchdog::new(config());
        assert_eq!(dog.check(), IdleState::Active);
        advance(Duration::from_secs(29)).await;
        assert_eq!(dog.check(), IdleState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_idle_then_reset() {
        let dog = IdleWatchdog::new(config());
        advance(Duration::from_secs(30)).await;
        dog.touch_read();
        assert_eq!(dog.check(), IdleState::WriteIdle);
        dog.touch_write();
        assert_eq!(dog.check(), IdleState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_idle_dominates() {
        let dog = IdleWatchdog::new(config());
        for _ in 0..9 {
            advance(Duration::from_secs(10)).await;
            dog.touch_write();
        }
        assert_eq!(dog.check(), IdleState::ReadIdle);
        dog.touch_read();
        assert_eq!(dog.check(), IdleState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_clocks() {
        let dog = IdleWatchdog::new(config());
        let writer = dog.clone();
        advance(Duration::from_secs(45)).await;
        dog.touch_read();
        writer.touch_write();
        assert_eq!(dog.check(), IdleState::Active);
    }
}
