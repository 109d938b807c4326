//! Bridges one session's socket to the control connection.
//!
//! A [`DataChannel`] is a cheap handle onto a driver task that owns the socket. Bytes written
//! through the handle reach the socket in order; bytes read from the socket are forwarded as
//! `Transfer` messages tagged with the session's tunnel and session ids. When the socket goes
//! away on its own, the channel tells the other end with `RemoteDisconnect` (relay side) or
//! `LocalDisconnect` (client side).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::link::ControlHandle;
use crate::protocol::{ProtoMsg, RemoteConnection};
use crate::stats::TrafficStats;

const READ_CHUNK: usize = 16 * 1024;

/// Which end of the tunnel a channel's socket sits on.
#[derive(Debug, Clone)]
pub enum Side {
    /// Relay side: an external peer connected to a public port or vhost.
    Remote(RemoteConnection),
    /// Client side: a connection to the local service.
    Local,
}

/// Identity of a session and where its events go.
#[derive(Debug, Clone)]
pub struct SessionTag {
    pub tunnel_id: u64,
    pub session_id: u64,
    pub control: ControlHandle,
    pub side: Side,
    pub stats: Option<Arc<TrafficStats>>,
}

impl SessionTag {
    fn transfer(&self, data: Bytes) -> ProtoMsg {
        ProtoMsg::Transfer {
            tunnel_id: self.tunnel_id,
            session_id: self.session_id,
            data,
        }
    }

    fn disconnect(&self) -> ProtoMsg {
        match &self.side {
            Side::Remote(remote) => ProtoMsg::RemoteDisconnect {
                tunnel_id: self.tunnel_id,
                session_id: self.session_id,
                data: remote.to_bytes(),
            },
            Side::Local => ProtoMsg::LocalDisconnect {
                tunnel_id: self.tunnel_id,
                session_id: self.session_id,
            },
        }
    }

    fn count_read(&self, n: usize) {
        if let Some(stats) = &self.stats {
            match self.side {
                Side::Remote(_) => stats.add_inbound(n),
                Side::Local => stats.add_outbound(n),
            }
        }
    }

    fn count_written(&self, n: usize) {
        if let Some(stats) = &self.stats {
            match self.side {
                Side::Remote(_) => stats.add_outbound(n),
                Side::Local => stats.add_inbound(n),
            }
        }
    }
}

/// Runs once when the channel's driver finishes, however it finished.
pub type OnClose = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Data(Bytes),
    /// Closed by us; the other end already knows.
    Close,
    /// The socket's read side ended.
    PeerGone,
}

enum End {
    Closed,
    PeerGone,
    Broken,
}

#[derive(Debug, Clone)]
pub struct DataChannel {
    tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Data(data) => write!(f, "Data({} bytes)", data.len()),
            Command::Close => f.write_str("Close"),
            Command::PeerGone => f.write_str("PeerGone"),
        }
    }
}

impl DataChannel {
    /// Bridge an already-connected socket. `opening` is sent on the control connection before
    /// any `Transfer` read from the socket.
    pub fn spawn<S>(stream: S, tag: SessionTag, opening: Vec<ProtoMsg>, on_close: Option<OnClose>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(drive(stream, tag, opening, tx.clone(), rx, closed.clone(), on_close));
        Self { tx, closed }
    }

    /// Dial `host:port` in the background. Data written before the dial completes is queued.
    ///
    /// On success `LocalConnected` is sent; on failure `LocalDisconnect`.
    pub fn dial(
        host: String,
        port: u16,
        connect_timeout: Duration,
        tag: SessionTag,
        on_close: Option<OnClose>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let channel = Self {
            tx: tx.clone(),
            closed: closed.clone(),
        };

        tokio::spawn(async move {
            let addr = format!("{host}:{port}");
            let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(addr = %addr, session_id = tag.session_id, error = %e, "Local dial failed");
                    return fail(tag, &mut rx, &closed, on_close);
                }
                Err(_) => {
                    debug!(addr = %addr, session_id = tag.session_id, "Local dial timed out");
                    return fail(tag, &mut rx, &closed, on_close);
                }
            };
            let _ = stream.set_nodelay(true);
            let opening = vec![ProtoMsg::LocalConnected {
                tunnel_id: tag.tunnel_id,
                session_id: tag.session_id,
            }];
            drive(stream, tag, opening, tx, rx, closed, on_close).await;
        });

        channel
    }

    /// Queue bytes for the socket. Returns false once the channel is closed.
    pub fn write(&self, data: Bytes) -> bool {
        !self.closed.load(Ordering::Acquire) && self.tx.send(Command::Data(data)).is_ok()
    }

    /// Flush queued bytes, then close the socket. No disconnect message is sent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

fn fail(
    tag: SessionTag,
    rx: &mut mpsc::UnboundedReceiver<Command>,
    closed: &AtomicBool,
    on_close: Option<OnClose>,
) {
    rx.close();
    if !closed.swap(true, Ordering::AcqRel) {
        let _ = tag.control.send(tag.disconnect());
    }
    if let Some(on_close) = on_close {
        on_close();
    }
}

async fn drive<S>(
    stream: S,
    tag: SessionTag,
    opening: Vec<ProtoMsg>,
    tx: mpsc::UnboundedSender<Command>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    closed: Arc<AtomicBool>,
    on_close: Option<OnClose>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    for msg in opening {
        let _ = tag.control.send(msg);
    }

    let (reader, mut writer) = tokio::io::split(stream);
    let pump = tokio::spawn(pump(reader, tag.clone(), tx));

    let end = loop {
        match rx.recv().await {
            Some(Command::Data(data)) => {
                let n = data.len();
                if let Err(e) = writer.write_all(&data).await {
                    trace!(session_id = tag.session_id, error = %e, "Session write failed");
                    break End::Broken;
                }
                tag.count_written(n);
            }
            Some(Command::Close) | None => break End::Closed,
            Some(Command::PeerGone) => break End::PeerGone,
        }
    };

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    pump.abort();
    rx.close();

    let by_us = closed.swap(true, Ordering::AcqRel);
    if !by_us && !matches!(end, End::Closed) {
        let _ = tag.control.send(tag.disconnect());
    }
    debug!(
        tunnel_id = tag.tunnel_id,
        session_id = tag.session_id,
        "Session closed"
    );
    if let Some(on_close) = on_close {
        on_close();
    }
}

async fn pump<R>(mut reader: R, tag: SessionTag, tx: mpsc::UnboundedSender<Command>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tag.count_read(n);
                if tag.control.send(tag.transfer(buf.split().freeze())).is_err() {
                    break;
                }
            }
            Err(e) => {
                trace!(session_id = tag.session_id, error = %e, "Session read failed");
                break;
            }
        }
    }
    let _ = tx.send(Command::PeerGone);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn remote_tag(control: ControlHandle) -> SessionTag {
        SessionTag {
            tunnel_id: 1,
            session_id: 1,
            control,
            side: Side::Remote(RemoteConnection::new(peer())),
            stats: Some(Arc::new(TrafficStats::new())),
        }
    }

    #[tokio::test]
    async fn test_opening_precedes_transfer() {
        let (control, mut rx) = ControlHandle::detached(peer());
        let (mut outside, inside) = duplex(1024);
        outside.write_all(b"hello").await.unwrap();

        let opening = vec![ProtoMsg::RemoteConnected {
            tunnel_id: 1,
            session_id: 1,
            data: RemoteConnection::new(peer()).to_bytes(),
        }];
        let _channel = DataChannel::spawn(inside, remote_tag(control), opening, None);

        assert!(matches!(rx.recv().await, Some(ProtoMsg::RemoteConnected { .. })));
        match rx.recv().await {
            Some(ProtoMsg::Transfer { data, .. }) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writes_in_order_then_flush_on_close() {
        let (control, _rx) = ControlHandle::detached(peer());
        let (mut outside, inside) = duplex(64);
        let channel = DataChannel::spawn(inside, remote_tag(control), Vec::new(), None);

        for i in 0..100u8 {
            assert!(channel.write(Bytes::from(vec![i; 10])));
        }
        channel.close();
        assert!(!channel.write(Bytes::from_static(b"late")));

        let mut received = Vec::new();
        outside.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 1000);
        for (i, chunk) in received.chunks(10).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect() {
        let (control, mut rx) = ControlHandle::detached(peer());
        let (outside, inside) = duplex(64);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let channel = DataChannel::spawn(
            inside,
            remote_tag(control),
            Vec::new(),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        drop(outside);
        match rx.recv().await {
            Some(ProtoMsg::RemoteDisconnect { session_id, data, .. }) => {
                assert_eq!(session_id, 1);
                assert_eq!(RemoteConnection::from_bytes(&data), Some(RemoteConnection::new(peer())));
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(channel.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_close_is_silent() {
        let (control, mut rx) = ControlHandle::detached(peer());
        let (_outside, inside) = duplex(64);
        let channel = DataChannel::spawn(inside, remote_tag(control), Vec::new(), None);
        channel.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dial_sends_local_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (control, mut rx) = ControlHandle::detached(peer());
        let tag = SessionTag {
            tunnel_id: 4,
            session_id: 9,
            control,
            side: Side::Local,
            stats: None,
        };

        let channel = DataChannel::dial("127.0.0.1".into(), port, Duration::from_secs(2), tag, None);
        assert!(channel.write(Bytes::from_static(b"queued before connect")));

        let (mut local, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 21];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"queued before connect");

        assert_eq!(
            rx.recv().await,
            Some(ProtoMsg::LocalConnected {
                tunnel_id: 4,
                session_id: 9
            })
        );

        local.write_all(b"reply").await.unwrap();
        match rx.recv().await {
            Some(ProtoMsg::Transfer { data, .. }) => assert_eq!(&data[..], b"reply"),
            other => panic!("unexpected {other:?}"),
        }

        drop(local);
        assert_eq!(
            rx.recv().await,
            Some(ProtoMsg::LocalDisconnect {
                tunnel_id: 4,
                session_id: 9
            })
        );
    }

    #[tokio::test]
    async fn test_dial_failure_sends_local_disconnect() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (control, mut rx) = ControlHandle::detached(peer());
        let tag = SessionTag {
            tunnel_id: 1,
            session_id: 2,
            control,
            side: Side::Local,
            stats: None,
        };
        let channel = DataChannel::dial("127.0.0.1".into(), port, Duration::from_secs(2), tag, None);

        assert_eq!(
            rx.recv().await,
            Some(ProtoMsg::LocalDisconnect {
                tunnel_id: 1,
                session_id: 2
            })
        );
        assert!(channel.is_closed());
    }
}
