//! Client side of one tunnel: connect, exchange keys, request, then bridge sessions until the
//! control connection ends. Reconnects according to [`RetryPolicy`].

use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use lighttunnel_shared::crypto::RsaKeyPair;
use lighttunnel_shared::protocol::msg_type::RESPONSE;
use lighttunnel_shared::{ControlLink, HeartbeatConfig, Inbound, ProtoMsg, TunnelRequest};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proxy::LocalConnector;

/// Pause between a lost connection and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Time allowed for the TCP connect (and TLS handshake) to the relay.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which disconnects trigger a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy(u8);

impl RetryPolicy {
    pub const NEVER: RetryPolicy = RetryPolicy(0);
    /// The connection ended without an error (EOF, idle timeout).
    pub const RETRY_ON_LOSE: RetryPolicy = RetryPolicy(0b01);
    /// The connection failed (connect error, I/O error, bad frame).
    pub const RETRY_ON_ERROR: RetryPolicy = RetryPolicy(0b10);
    pub const ALWAYS: RetryPolicy = RetryPolicy(0b11);

    pub const fn contains(self, other: RetryPolicy) -> bool {
        self.0 & other.0 == other.0
    }

    fn retries(self, failed: bool) -> bool {
        if failed {
            self.contains(Self::RETRY_ON_ERROR)
        } else {
            self.contains(Self::RETRY_ON_LOSE)
        }
    }
}

impl BitOr for RetryPolicy {
    type Output = RetryPolicy;

    fn bitor(self, rhs: Self) -> Self {
        RetryPolicy(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Handshaking,
    AwaitingResponse,
    Active { tunnel_id: u64 },
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connecting,
    /// `request` is the relay's final version, e.g. with the assigned port.
    Connected { tunnel_id: u64, request: TunnelRequest },
    Disconnected { error: Option<String> },
    Rejected { reason: String },
    ForcedOff,
    Closed,
}

#[derive(Clone)]
pub struct TlsOptions {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

#[derive(Clone)]
pub struct ClientOptions {
    /// `host:port` of the relay's control listener
    pub server: String,
    pub tls: Option<TlsOptions>,
    /// Exchange a key and encrypt payloads
    pub encrypt: bool,
    pub retry: RetryPolicy,
    pub reconnect_delay: Duration,
    pub heartbeat: HeartbeatConfig,
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tls: None,
            encrypt: false,
            retry: RetryPolicy::ALWAYS,
            reconnect_delay: RECONNECT_DELAY,
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Spawns tunnels against one relay. All tunnels share one [`LocalConnector`].
pub struct TunnelClient {
    options: ClientOptions,
    connector: Arc<LocalConnector>,
}

impl TunnelClient {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_connector(options, Arc::new(LocalConnector::new()))
    }

    pub fn with_connector(options: ClientOptions, connector: Arc<LocalConnector>) -> Self {
        Self { options, connector }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn connector(&self) -> &Arc<LocalConnector> {
        &self.connector
    }

    /// Start a tunnel in the background.
    pub fn spawn(&self, request: TunnelRequest) -> TunnelHandle {
        let (state_tx, state_rx) = watch::channel(TunnelState::Connecting);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let closer = CancellationToken::new();

        let worker = Worker {
            options: self.options.clone(),
            connector: self.connector.clone(),
            request,
            state: state_tx,
            events: event_tx,
            closer: closer.clone(),
        };
        let task = tokio::spawn(worker.run());

        TunnelHandle {
            state: state_rx,
            events: Some(event_rx),
            closer,
            task,
        }
    }
}

/// A running tunnel.
pub struct TunnelHandle {
    state: watch::Receiver<TunnelState>,
    events: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    closer: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// The event stream. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.take()
    }

    /// Close the tunnel for good. It is never reconnected afterwards.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// A token that closes the tunnel when cancelled.
    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    pub fn is_actively_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Wait for the tunnel to stop, whether closed or given up.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// How one connection attempt ended.
#[derive(Debug)]
enum Outcome {
    /// Closed through the handle.
    Closed,
    Lost,
    Failed(String),
    Rejected(String),
    ForcedOff,
}

struct Worker {
    options: ClientOptions,
    connector: Arc<LocalConnector>,
    request: TunnelRequest,
    state: watch::Sender<TunnelState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    closer: CancellationToken,
}

impl Worker {
    fn set_state(&self, state: TunnelState) {
        let _ = self.state.send(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run(self) {
        let mut attempt = 0u32;
        loop {
            self.set_state(TunnelState::Connecting);
            self.emit(ClientEvent::Connecting);

            // Runs to completion even when closed: drive() releases the local sessions.
            let outcome = self.connect().await;
            debug!(request = %self.request, ?outcome, "Tunnel connection ended");

            let failed = match outcome {
                Outcome::Closed => break,
                Outcome::Rejected(reason) => {
                    warn!(request = %self.request, reason = %reason, "Tunnel rejected");
                    self.emit(ClientEvent::Rejected { reason });
                    break;
                }
                Outcome::ForcedOff => {
                    info!(request = %self.request, "Tunnel forced off by relay");
                    self.emit(ClientEvent::ForcedOff);
                    break;
                }
                Outcome::Lost => {
                    self.emit(ClientEvent::Disconnected { error: None });
                    false
                }
                Outcome::Failed(error) => {
                    warn!(request = %self.request, error = %error, "Tunnel connection failed");
                    self.emit(ClientEvent::Disconnected { error: Some(error) });
                    true
                }
            };

            if self.closer.is_cancelled() || !self.options.retry.retries(failed) {
                break;
            }
            attempt += 1;
            self.set_state(TunnelState::Reconnecting { attempt });
            info!(
                request = %self.request,
                attempt,
                "Reconnecting in {}s",
                self.options.reconnect_delay.as_secs()
            );
            tokio::select! {
                _ = self.closer.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }
        }

        self.set_state(TunnelState::Closed);
        self.emit(ClientEvent::Closed);
    }

    async fn connect(&self) -> Outcome {
        let server = &self.options.server;
        let dial = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(server.as_str()),
        );
        let stream = tokio::select! {
            _ = self.closer.cancelled() => return Outcome::Closed,
            dialed = dial => match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Outcome::Failed(format!("connect to {server}: {e}")),
                Err(_) => return Outcome::Failed(format!("connect to {server}: timed out")),
            },
        };
        let _ = stream.set_nodelay(true);
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        match &self.options.tls {
            Some(tls) => {
                let handshake = tokio::time::timeout(
                    self.options.connect_timeout,
                    tls.connector.connect(tls.server_name.clone(), stream),
                );
                let stream = tokio::select! {
                    _ = self.closer.cancelled() => return Outcome::Closed,
                    accepted = handshake => match accepted {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => return Outcome::Failed(format!("TLS handshake with {server}: {e}")),
                        Err(_) => return Outcome::Failed(format!("TLS handshake with {server}: timed out")),
                    },
                };
                self.drive(stream, peer).await
            }
            None => self.drive(stream, peer).await,
        }
    }

    async fn drive<S>(&self, stream: S, peer: SocketAddr) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut link = ControlLink::new(stream, peer, self.options.heartbeat, self.closer.child_token());

        if self.options.encrypt {
            self.set_state(TunnelState::Handshaking);
            if let Err(outcome) = self.handshake(&mut link).await {
                link.shutdown().await;
                return outcome;
            }
        }

        self.set_state(TunnelState::AwaitingResponse);
        if link
            .send(ProtoMsg::Request {
                data: self.request.to_bytes(),
            })
            .is_err()
        {
            return self.lost();
        }

        let control = link.handle();
        let local_addr = self.request.local_addr();
        let local_port = self.request.local_port();
        let mut bound: Option<u64> = None;

        let outcome = loop {
            let inbound = match link.next().await {
                Ok(Some(inbound)) => inbound,
                Ok(None) => break self.lost(),
                Err(e) => break Outcome::Failed(e.to_string()),
            };
            let msg = match inbound {
                Inbound::Msg(msg) => msg,
                Inbound::Discarded {
                    msg_type: Some(RESPONSE),
                    error,
                } if bound.is_none() => break Outcome::Failed(format!("unreadable response: {error}")),
                Inbound::Discarded { msg_type, error } => {
                    warn!(peer = %peer, ?msg_type, error = %error, "Discarded message");
                    continue;
                }
            };

            match msg {
                ProtoMsg::Response {
                    ok: true,
                    tunnel_id,
                    data,
                } if bound.is_none() => {
                    let granted = TunnelRequest::from_bytes(&data).unwrap_or_else(|e| {
                        warn!(error = %e, "Unreadable final request, keeping ours");
                        self.request.clone()
                    });
                    info!(tunnel_id, request = %granted, "Tunnel connected");
                    bound = Some(tunnel_id);
                    self.set_state(TunnelState::Active { tunnel_id });
                    self.emit(ClientEvent::Connected {
                        tunnel_id,
                        request: granted,
                    });
                }
                ProtoMsg::Response { ok: false, data, .. } if bound.is_none() => {
                    break Outcome::Rejected(String::from_utf8_lossy(&data).into_owned());
                }
                ProtoMsg::RemoteConnected {
                    tunnel_id,
                    session_id,
                    ..
                } if bound == Some(tunnel_id) => {
                    self.connector.acquire_local_channel(
                        local_addr, local_port, tunnel_id, session_id, &control,
                    );
                }
                ProtoMsg::Transfer {
                    tunnel_id,
                    session_id,
                    data,
                } if bound == Some(tunnel_id) => {
                    self.connector
                        .acquire_local_channel(local_addr, local_port, tunnel_id, session_id, &control)
                        .write(data);
                }
                ProtoMsg::RemoteDisconnect {
                    tunnel_id,
                    session_id,
                    ..
                } if bound == Some(tunnel_id) => {
                    if let Some(channel) = self.connector.remove_local_channel(tunnel_id, session_id) {
                        channel.close();
                    }
                }
                ProtoMsg::ForceOff => {
                    let _ = link.send(ProtoMsg::ForceOffReply);
                    break Outcome::ForcedOff;
                }
                other => debug!(peer = %peer, msg = other.name(), "Ignored message"),
            }
        };

        if let Some(tunnel_id) = bound {
            self.connector.remove_tunnel(tunnel_id);
        }
        link.shutdown().await;
        outcome
    }

    async fn handshake<R>(&self, link: &mut ControlLink<R>) -> Result<(), Outcome>
    where
        R: AsyncRead + Unpin,
    {
        let keys = match tokio::task::spawn_blocking(RsaKeyPair::generate).await {
            Ok(Ok(keys)) => keys,
            Ok(Err(e)) => return Err(Outcome::Failed(e.to_string())),
            Err(e) => return Err(Outcome::Failed(format!("key generation: {e}"))),
        };
        link.send(ProtoMsg::Handshake {
            data: keys.public_der(),
        })
        .map_err(|_| self.lost())?;

        loop {
            match link.next().await {
                Ok(Some(Inbound::Msg(ProtoMsg::Handshake { data }))) => {
                    let key = keys
                        .open_cipher_key(&data)
                        .map_err(|e| Outcome::Failed(format!("handshake: {e}")))?;
                    link.install_key(key);
                    debug!("Payload key installed");
                    return Ok(());
                }
                Ok(Some(Inbound::Msg(ProtoMsg::Response { ok: false, data, .. }))) => {
                    return Err(Outcome::Rejected(String::from_utf8_lossy(&data).into_owned()));
                }
                Ok(Some(other)) => debug!(?other, "Ignored during handshake"),
                Ok(None) => return Err(self.lost()),
                Err(e) => return Err(Outcome::Failed(e.to_string())),
            }
        }
    }

    fn lost(&self) -> Outcome {
        if self.closer.is_cancelled() {
            Outcome::Closed
        } else {
            Outcome::Lost
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(RetryPolicy::ALWAYS.retries(true));
        assert!(RetryPolicy::ALWAYS.retries(false));
        assert!(!RetryPolicy::NEVER.retries(true));
        assert!(RetryPolicy::RETRY_ON_LOSE.retries(false));
        assert!(!RetryPolicy::RETRY_ON_LOSE.retries(true));
        assert!(RetryPolicy::RETRY_ON_ERROR.retries(true));
        assert!(!RetryPolicy::RETRY_ON_ERROR.retries(false));
        assert_eq!(
            RetryPolicy::RETRY_ON_LOSE | RetryPolicy::RETRY_ON_ERROR,
            RetryPolicy::ALWAYS
        );
    }

    #[tokio::test]
    async fn test_connect_failure_without_retry() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut options = ClientOptions::new(format!("127.0.0.1:{port}"));
        options.retry = RetryPolicy::RETRY_ON_LOSE;
        let client = TunnelClient::new(options);

        let mut handle = client.spawn(TunnelRequest::for_tcp("127.0.0.1", 22, 0));
        let mut events = handle.take_events().unwrap();
        assert_eq!(events.recv().await, Some(ClientEvent::Connecting));
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Disconnected { error: Some(_) })
        ));
        assert_eq!(events.recv().await, Some(ClientEvent::Closed));
        handle.join().await;
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let client = TunnelClient::new(ClientOptions::new(format!("127.0.0.1:{port}")));
        let mut handle = client.spawn(TunnelRequest::for_tcp("127.0.0.1", 22, 0));
        let mut state = handle.watch_state();

        state
            .wait_for(|s| matches!(s, TunnelState::Reconnecting { .. }))
            .await
            .unwrap();
        handle.close();
        assert!(handle.is_actively_closed());
        state.wait_for(|s| *s == TunnelState::Closed).await.unwrap();

        let mut events = handle.take_events().unwrap();
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.last(), Some(&ClientEvent::Closed));
        handle.join().await;
    }
}
