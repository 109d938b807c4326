//! Framed, heartbeat-supervised control connection shared by the relay and the client.
//!
//! A [`ControlLink`] owns the read half. The write half lives in a dedicated task that drains
//! an ordered queue, so every clone of [`ControlHandle`] may send without blocking and the peer
//! sees messages in exactly the order they were queued.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::WireCodec;
use crate::crypto::{CipherKey, PayloadCrypto};
use crate::heartbeat::{HeartbeatConfig, IdleState, IdleWatchdog};
use crate::protocol::ProtoMsg;
use crate::{Error, Result};

/// Something read off the control connection.
#[derive(Debug)]
pub enum Inbound {
    Msg(ProtoMsg),
    /// A complete frame that could not be decoded or opened. The connection is still usable.
    Discarded { msg_type: Option<u8>, error: Error },
}

/// Cloneable sending side of a control connection.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ProtoMsg>,
    peer: SocketAddr,
    shutdown: CancellationToken,
}

impl ControlHandle {
    /// Queue a message. Fails only when the connection is already gone.
    pub fn send(&self, msg: ProtoMsg) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        self.tx.send(msg).map_err(|_| Error::Closed)
    }

    /// Flush what is queued, then close the connection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// A handle whose messages land in the returned receiver. Used by unit tests of the
    /// components that talk to a control connection.
    pub fn detached(peer: SocketAddr) -> (Self, mpsc::UnboundedReceiver<ProtoMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                peer,
                shutdown: CancellationToken::new(),
            },
            rx,
        )
    }
}

pub struct ControlLink<R> {
    reader: FramedRead<R, WireCodec>,
    handle: ControlHandle,
    crypto: Arc<PayloadCrypto>,
    watchdog: IdleWatchdog,
    writer: JoinHandle<()>,
}

impl<S> ControlLink<ReadHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap `stream`. Cancelling `shutdown` (or calling [`ControlHandle::close`]) ends the link.
    pub fn new(
        stream: S,
        peer: SocketAddr,
        heartbeat: HeartbeatConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let crypto = Arc::new(PayloadCrypto::new());
        let watchdog = IdleWatchdog::new(heartbeat);

        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, WireCodec::new()),
            rx,
            crypto.clone(),
            watchdog.clone(),
            shutdown.clone(),
            peer,
        ));

        Self {
            reader: FramedRead::new(read_half, WireCodec::new()),
            handle: ControlHandle { tx, peer, shutdown },
            crypto,
            watchdog,
            writer,
        }
    }
}

impl<R> ControlLink<R>
where
    R: AsyncRead + Unpin,
{
    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn peer(&self) -> SocketAddr {
        self.handle.peer
    }

    pub fn install_key(&self, key: CipherKey) {
        self.crypto.install_key(key);
    }

    pub fn has_key(&self) -> bool {
        self.crypto.has_key()
    }

    pub fn set_encrypt(&self, enabled: bool) {
        self.crypto.set_encrypt(enabled);
    }

    pub fn send(&self, msg: ProtoMsg) -> Result<()> {
        self.handle.send(msg)
    }

    /// Next message for the state machine.
    ///
    /// `Ok(None)` means the connection ended without a protocol error: EOF, read-idle timeout,
    /// or a local close. Pings are answered here and pongs only refresh the read clock; neither
    /// is returned.
    pub async fn next(&mut self) -> Result<Option<Inbound>> {
        let shutdown = self.handle.shutdown.clone();
        let mut ticker = interval(self.watchdog.config().tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = ticker.tick() => match self.watchdog.check() {
                    IdleState::ReadIdle => {
                        warn!(peer = %self.handle.peer, "Control connection read idle, closing");
                        return Ok(None);
                    }
                    IdleState::WriteIdle => {
                        trace!(peer = %self.handle.peer, "Write idle, sending ping");
                        self.watchdog.touch_write();
                        self.handle.send(ProtoMsg::Ping)?;
                    }
                    IdleState::Active => {}
                },
                item = self.reader.next() => {
                    let Some(item) = item else {
                        debug!(peer = %self.handle.peer, "Control connection closed by peer");
                        return Ok(None);
                    };
                    let frame = match item? {
                        Ok(frame) => frame,
                        Err(error) => {
                            self.watchdog.touch_read();
                            return Ok(Some(Inbound::Discarded { msg_type: None, error }));
                        }
                    };
                    self.watchdog.touch_read();

                    let msg_type = frame.msg.msg_type();
                    match self.crypto.open(frame) {
                        Ok(ProtoMsg::Ping) => self.handle.send(ProtoMsg::Pong)?,
                        Ok(ProtoMsg::Pong) => {}
                        Ok(msg) => return Ok(Some(Inbound::Msg(msg))),
                        Err(error) => {
                            return Ok(Some(Inbound::Discarded {
                                msg_type: Some(msg_type),
                                error,
                            }))
                        }
                    }
                }
            }
        }
    }

    /// Close and wait until everything queued before this call has been written.
    pub async fn shutdown(mut self) {
        self.handle.close();
        let _ = (&mut self.writer).await;
    }
}

impl<R> Drop for ControlLink<R> {
    fn drop(&mut self) {
        self.handle.shutdown.cancel();
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, WireCodec>,
    mut rx: mpsc::UnboundedReceiver<ProtoMsg>,
    crypto: Arc<PayloadCrypto>,
    watchdog: IdleWatchdog,
    shutdown: CancellationToken,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = shutdown.cancelled() => break,
        };
        let Some(msg) = msg else { break };
        if let Err(e) = write_one(&mut sink, &crypto, msg).await {
            debug!(peer = %peer, error = %e, "Control write failed");
            shutdown.cancel();
            return;
        }
        watchdog.touch_write();
    }

    // Best effort: anything queued before the close still goes out.
    while let Ok(msg) = rx.try_recv() {
        if write_one(&mut sink, &crypto, msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
    shutdown.cancel();
}

async fn write_one<W>(
    sink: &mut FramedWrite<W, WireCodec>,
    crypto: &PayloadCrypto,
    msg: ProtoMsg,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let name = msg.name();
    let frame = match crypto.seal(msg) {
        Ok(frame) => frame,
        Err(e) => {
            // One bad payload must not take the connection down
            warn!(msg = name, error = %e, "Dropping message that could not be sealed");
            return Ok(());
        }
    };
    sink.send(frame).await
}
