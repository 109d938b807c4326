//! Relay daemon: control listeners and the per-connection tunnel state machine.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lighttunnel_shared::crypto::{seal_cipher_key, CipherKey};
use lighttunnel_shared::protocol::msg_type::REQUEST;
use lighttunnel_shared::request::TunnelKind;
use lighttunnel_shared::{
    ControlLink, Error, HeartbeatConfig, Inbound, ProtoMsg, Result, TunnelRequest,
};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::events::{EventSink, ServerEvent};
use crate::policy::{Rejection, RequestInterceptor, MAX_PORT_ATTEMPTS};
use crate::registry::{HttpRegistry, TcpRegistry, FORCE_OFF_TIMEOUT};
use crate::router::VhostRouter;
use crate::tunnel::{SessionPool, TunnelDescriptor};

/// Time allowed for a TLS handshake on the control and HTTPS ports.
pub(crate) const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A listener that terminates TLS.
#[derive(Clone)]
pub struct TlsListener {
    pub port: u16,
    pub acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener").field("port", &self.port).finish()
    }
}

/// Resolved listener and timing settings. Port 0 lets the OS choose.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: IpAddr,
    pub control_port: u16,
    pub tls_control: Option<TlsListener>,
    pub http_port: Option<u16>,
    pub https: Option<TlsListener>,
    pub heartbeat: HeartbeatConfig,
    pub force_off_timeout: Duration,
}

impl ServerOptions {
    pub fn new(bind_addr: IpAddr, control_port: u16) -> Self {
        Self {
            bind_addr,
            control_port,
            tls_control: None,
            http_port: None,
            https: None,
            heartbeat: HeartbeatConfig::default(),
            force_off_timeout: FORCE_OFF_TIMEOUT,
        }
    }
}

/// The three tunnel registries of one relay.
#[derive(Clone)]
pub struct Registries {
    pub tcp: Arc<TcpRegistry>,
    pub http: Arc<HttpRegistry>,
    pub https: Arc<HttpRegistry>,
}

/// Every active tunnel, grouped by kind.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub tcp: Vec<TunnelDescriptor>,
    pub http: Vec<TunnelDescriptor>,
    pub https: Vec<TunnelDescriptor>,
}

impl Registries {
    fn new(bind_addr: IpAddr, force_off_timeout: Duration) -> Self {
        Self {
            tcp: Arc::new(TcpRegistry::with_force_off_timeout(bind_addr, force_off_timeout)),
            http: Arc::new(HttpRegistry::with_force_off_timeout(force_off_timeout)),
            https: Arc::new(HttpRegistry::with_force_off_timeout(force_off_timeout)),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tcp: self.tcp.snapshot(),
            http: self.http.snapshot(),
            https: self.https.snapshot(),
        }
    }
}

pub struct TunnelServer {
    options: ServerOptions,
    interceptor: Arc<dyn RequestInterceptor>,
    events: EventSink,
}

impl TunnelServer {
    pub fn new(options: ServerOptions, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        Self {
            options,
            interceptor,
            events: EventSink::default(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Bind every configured listener, then start serving. Fails if any bind fails.
    pub async fn start(self) -> Result<ServerHandle> {
        let TunnelServer {
            options,
            interceptor,
            events,
        } = self;
        let shutdown = CancellationToken::new();
        let registries = Registries::new(options.bind_addr, options.force_off_timeout);

        let shared = Arc::new(Shared {
            registries: registries.clone(),
            interceptor,
            events: events.clone(),
            heartbeat: options.heartbeat,
            http_enabled: options.http_port.is_some(),
            https_enabled: options.https.is_some(),
            next_tunnel_id: AtomicU64::new(1),
            shutdown: shutdown.clone(),
        });

        let control = bind(options.bind_addr, options.control_port, "control").await?;
        let tls_control = match &options.tls_control {
            Some(tls) => Some((
                bind(options.bind_addr, tls.port, "TLS control").await?,
                tls.acceptor.clone(),
            )),
            None => None,
        };
        let http = match options.http_port {
            Some(port) => Some(bind(options.bind_addr, port, "HTTP").await?),
            None => None,
        };
        let https = match &options.https {
            Some(tls) => Some((
                bind(options.bind_addr, tls.port, "HTTPS").await?,
                tls.acceptor.clone(),
            )),
            None => None,
        };

        let control_addr = control.local_addr()?;
        let mut tasks = vec![tokio::spawn(accept_control(shared.clone(), control, None))];

        let mut tls_control_addr = None;
        if let Some((listener, acceptor)) = tls_control {
            tls_control_addr = Some(listener.local_addr()?);
            tasks.push(tokio::spawn(accept_control(
                shared.clone(),
                listener,
                Some(acceptor),
            )));
        }

        let mut http_addr = None;
        if let Some(listener) = http {
            http_addr = Some(listener.local_addr()?);
            let router = Arc::new(VhostRouter::new(
                registries.http.clone(),
                false,
                None,
                events.clone(),
            ));
            tasks.push(tokio::spawn(router.serve(listener, shutdown.clone())));
        }

        let mut https_addr = None;
        if let Some((listener, acceptor)) = https {
            https_addr = Some(listener.local_addr()?);
            let router = Arc::new(VhostRouter::new(
                registries.https.clone(),
                true,
                Some(acceptor),
                events.clone(),
            ));
            tasks.push(tokio::spawn(router.serve(listener, shutdown.clone())));
        }

        info!(
            control = %control_addr,
            tls_control = ?tls_control_addr,
            http = ?http_addr,
            https = ?https_addr,
            "Relay started"
        );

        Ok(ServerHandle {
            control_addr,
            tls_control_addr,
            http_addr,
            https_addr,
            registries,
            shutdown,
            tasks,
        })
    }
}

async fn bind(addr: IpAddr, port: u16, what: &str) -> Result<TcpListener> {
    TcpListener::bind((addr, port))
        .await
        .map_err(|e| Error::Connection(format!("cannot bind {what} listener on {addr}:{port}: {e}")))
}

/// A running relay.
pub struct ServerHandle {
    control_addr: SocketAddr,
    tls_control_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
    registries: Registries,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn tls_control_addr(&self) -> Option<SocketAddr> {
        self.tls_control_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn tcp_registry(&self) -> &Arc<TcpRegistry> {
        &self.registries.tcp
    }

    pub fn http_registry(&self) -> &Arc<HttpRegistry> {
        &self.registries.http
    }

    pub fn https_registry(&self) -> &Arc<HttpRegistry> {
        &self.registries.https
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registries.snapshot()
    }

    /// Resolves once [`ServerHandle::shutdown`] has been requested.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Stop accepting, close every control connection and wait for the listeners to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Relay stopped");
    }
}

struct Shared {
    registries: Registries,
    interceptor: Arc<dyn RequestInterceptor>,
    events: EventSink,
    heartbeat: HeartbeatConfig,
    http_enabled: bool,
    https_enabled: bool,
    next_tunnel_id: AtomicU64,
    shutdown: CancellationToken,
}

async fn accept_control(shared: Arc<Shared>, listener: TcpListener, tls: Option<TlsAcceptor>) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Control accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        debug!(peer = %peer, tls = tls.is_some(), "Control connection accepted");

        let shared = shared.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => {
                    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(stream)) => serve_control(shared, stream, peer).await,
                        Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                        Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
                    }
                }
                None => serve_control(shared, stream, peer).await,
            }
        });
    }
}

/// Public key a tunnel is bound to.
#[derive(Debug, Clone)]
enum Binding {
    Tcp(u16),
    Http(String),
    Https(String),
}

struct Bound {
    pool: Arc<SessionPool>,
    binding: Binding,
    /// Starts the TCP accept loop.
    ready: Option<oneshot::Sender<()>>,
}

enum ConnState {
    AwaitingRequest,
    Bound(Bound),
    Closing,
}

async fn serve_control<S>(shared: Arc<Shared>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut link = ControlLink::new(stream, peer, shared.heartbeat, shared.shutdown.child_token());
    let mut state = ConnState::AwaitingRequest;

    loop {
        let inbound = match link.next().await {
            Ok(Some(inbound)) => inbound,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Control connection failed");
                break;
            }
        };

        state = match state {
            ConnState::AwaitingRequest => shared.on_awaiting(&link, inbound).await,
            ConnState::Bound(bound) => shared.on_bound(bound, inbound),
            ConnState::Closing => ConnState::Closing,
        };
        if matches!(state, ConnState::Closing) {
            break;
        }
    }

    if let ConnState::Bound(bound) = &state {
        shared.teardown(bound);
    }
    link.shutdown().await;
    debug!(peer = %peer, "Control connection closed");
}

impl Shared {
    async fn on_awaiting<R>(&self, link: &ControlLink<R>, inbound: Inbound) -> ConnState
    where
        R: AsyncRead + Unpin,
    {
        let peer = link.peer();
        let msg = match inbound {
            Inbound::Msg(msg) => msg,
            Inbound::Discarded {
                msg_type: Some(REQUEST),
                error,
            } => {
                warn!(peer = %peer, error = %error, "Unreadable tunnel request");
                let _ = link.send(ProtoMsg::response_err("malformed tunnel request"));
                return ConnState::Closing;
            }
            Inbound::Discarded { msg_type, error } => {
                warn!(peer = %peer, ?msg_type, error = %error, "Discarded message");
                return ConnState::AwaitingRequest;
            }
        };

        match msg {
            ProtoMsg::Handshake { data } => {
                if link.has_key() {
                    warn!(peer = %peer, "Repeated handshake ignored");
                    return ConnState::AwaitingRequest;
                }
                let key = CipherKey::generate();
                match seal_cipher_key(&data, &key) {
                    Ok(sealed) => {
                        let _ = link.send(ProtoMsg::Handshake {
                            data: sealed.into(),
                        });
                        link.install_key(key);
                        debug!(peer = %peer, "Payload key installed");
                        ConnState::AwaitingRequest
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Handshake failed");
                        let _ = link.send(ProtoMsg::response_err("handshake failed"));
                        ConnState::Closing
                    }
                }
            }
            ProtoMsg::Request { data } => match TunnelRequest::from_bytes(&data) {
                Ok(request) => self.on_request(link, request).await,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Malformed tunnel request");
                    let _ = link.send(ProtoMsg::response_err("malformed tunnel request"));
                    ConnState::Closing
                }
            },
            other => {
                debug!(peer = %peer, msg = other.name(), "Unexpected message before request");
                ConnState::AwaitingRequest
            }
        }
    }

    async fn on_request<R>(&self, link: &ControlLink<R>, request: TunnelRequest) -> ConnState
    where
        R: AsyncRead + Unpin,
    {
        let peer = link.peer();
        info!(peer = %peer, request = %request, "Tunnel request");

        // An assigned port can be taken between the interceptor's check and the bind.
        let auto_port = matches!(request.kind(), TunnelKind::Tcp { remote_port: 0 });
        let mut attempt = 1;
        let outcome = loop {
            let granted = match self.intercept(request.clone()).await {
                Ok(granted) => granted,
                Err(rejection) => break Err(rejection),
            };
            match self.bind(link, granted) {
                Ok(bound) => break Ok(bound),
                Err(Error::AlreadyInUse(key)) if auto_port && attempt < MAX_PORT_ATTEMPTS => {
                    debug!(peer = %peer, key = %key, attempt, "Assigned port taken, reassigning");
                    attempt += 1;
                }
                Err(e) => break Err(rejection(e)),
            }
        };

        match outcome {
            Ok(mut bound) => {
                let request = bound.pool.request();
                let _ = link.send(ProtoMsg::response_ok(
                    bound.pool.tunnel_id(),
                    request.to_bytes(),
                ));
                // Sessions are announced only after the response is queued.
                if let Some(ready) = bound.ready.take() {
                    let _ = ready.send(());
                }
                self.announce(&bound);
                ConnState::Bound(bound)
            }
            Err(rejection) => {
                info!(peer = %peer, reason = %rejection, "Tunnel request rejected");
                let _ = link.send(ProtoMsg::response_err(&rejection.0));
                ConnState::Closing
            }
        }
    }

    async fn intercept(&self, request: TunnelRequest) -> std::result::Result<TunnelRequest, Rejection> {
        let interceptor = self.interceptor.clone();
        tokio::task::spawn_blocking(move || interceptor.intercept(request))
            .await
            .unwrap_or_else(|e| Err(Rejection::new(format!("request check failed: {e}"))))
    }

    fn bind<R>(&self, link: &ControlLink<R>, request: TunnelRequest) -> Result<Bound>
    where
        R: AsyncRead + Unpin,
    {
        let tunnel_id = self.next_tunnel_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind().clone();
        let pool = Arc::new(SessionPool::new(tunnel_id, request, link.handle()));

        let (binding, ready) = match kind {
            TunnelKind::Tcp { remote_port } => {
                let (ready, opened) = oneshot::channel();
                let events = self.events.clone();
                self.registries
                    .tcp
                    .register(remote_port, pool.clone(), move |listener, pool| {
                        serve_tcp(listener, pool, events, opened)
                    })?;
                (Binding::Tcp(remote_port), Some(ready))
            }
            TunnelKind::Http { vhost } => {
                if !self.http_enabled {
                    return Err(Error::Rejected("http tunnels are not enabled on this relay".into()));
                }
                self.registries.http.register(&vhost, pool.clone())?;
                (Binding::Http(vhost), None)
            }
            TunnelKind::Https { vhost } => {
                if !self.https_enabled {
                    return Err(Error::Rejected("https tunnels are not enabled on this relay".into()));
                }
                self.registries.https.register(&vhost, pool.clone())?;
                (Binding::Https(vhost), None)
            }
        };
        Ok(Bound {
            pool,
            binding,
            ready,
        })
    }

    fn announce(&self, bound: &Bound) {
        let tunnel_id = bound.pool.tunnel_id();
        let request = bound.pool.request().redacted();
        match &bound.binding {
            Binding::Tcp(port) => {
                info!(tunnel_id, remote_port = port, "TCP tunnel connected");
                self.events.emit(ServerEvent::TcpTunnelConnected {
                    tunnel_id,
                    remote_port: *port,
                    request,
                });
            }
            Binding::Http(vhost) | Binding::Https(vhost) => {
                let https = matches!(bound.binding, Binding::Https(_));
                info!(tunnel_id, vhost = %vhost, https, "HTTP tunnel connected");
                self.events.emit(ServerEvent::HttpTunnelConnected {
                    tunnel_id,
                    vhost: vhost.clone(),
                    https,
                    request,
                });
            }
        }
    }

    fn on_bound(&self, bound: Bound, inbound: Inbound) -> ConnState {
        let pool = &bound.pool;
        let msg = match inbound {
            Inbound::Msg(msg) => msg,
            Inbound::Discarded { msg_type, error } => {
                warn!(tunnel_id = pool.tunnel_id(), ?msg_type, error = %error, "Discarded message");
                return ConnState::Bound(bound);
            }
        };

        match msg {
            ProtoMsg::Transfer {
                tunnel_id,
                session_id,
                data,
            } if tunnel_id == pool.tunnel_id() => {
                match pool.get_session(session_id) {
                    Some(session) => {
                        session.write(data);
                    }
                    None => trace!(tunnel_id, session_id, "Transfer for unknown session dropped"),
                }
            }
            ProtoMsg::LocalConnected {
                tunnel_id,
                session_id,
            } => {
                trace!(tunnel_id, session_id, "Local connected");
            }
            ProtoMsg::LocalDisconnect {
                tunnel_id,
                session_id,
            } if tunnel_id == pool.tunnel_id() => {
                if let Some(session) = pool.remove_session(session_id) {
                    debug!(tunnel_id, session_id, "Local disconnected, closing session");
                    session.close();
                }
            }
            ProtoMsg::ForceOffReply => {
                info!(tunnel_id = pool.tunnel_id(), "Force-off acknowledged");
                pool.ack_force_off();
                self.teardown(&bound);
                return ConnState::Closing;
            }
            other => {
                debug!(tunnel_id = pool.tunnel_id(), msg = other.name(), "Ignored message");
            }
        }
        ConnState::Bound(bound)
    }

    /// Release the binding if this connection still owns it. Runs once per bound connection.
    fn teardown(&self, bound: &Bound) {
        let tunnel_id = bound.pool.tunnel_id();
        match &bound.binding {
            Binding::Tcp(port) => {
                self.registries.tcp.unregister_owned(port, tunnel_id);
                info!(tunnel_id, remote_port = port, "TCP tunnel disconnected");
                self.events.emit(ServerEvent::TcpTunnelDisconnect {
                    tunnel_id,
                    remote_port: *port,
                });
            }
            Binding::Http(vhost) | Binding::Https(vhost) => {
                let https = matches!(bound.binding, Binding::Https(_));
                let registry = if https {
                    &self.registries.https
                } else {
                    &self.registries.http
                };
                registry.unregister_owned(vhost, tunnel_id);
                info!(tunnel_id, vhost = %vhost, https, "HTTP tunnel disconnected");
                self.events.emit(ServerEvent::HttpTunnelDisconnect {
                    tunnel_id,
                    vhost: vhost.clone(),
                    https,
                });
            }
        }
        // A force-off may already have removed the entry.
        bound.pool.close_all();
    }
}

fn rejection(error: Error) -> Rejection {
    match error {
        Error::AlreadyInUse(key) => Rejection::new(format!("{key} is already in use")),
        Error::Rejected(reason) => Rejection::new(reason),
        other => Rejection::new(other.to_string()),
    }
}

fn serve_tcp(
    listener: TcpListener,
    pool: Arc<SessionPool>,
    events: EventSink,
    opened: oneshot::Receiver<()>,
) -> AbortHandle {
    tokio::spawn(async move {
        // Early connections wait in the backlog.
        if opened.await.is_err() {
            return;
        }
        debug!(tunnel_id = pool.tunnel_id(), addr = ?listener.local_addr().ok(), "TCP tunnel listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    accept_tcp(&pool, stream, peer, &events);
                }
                Err(e) => {
                    warn!(tunnel_id = pool.tunnel_id(), error = %e, "TCP tunnel accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
    .abort_handle()
}

fn accept_tcp(pool: &Arc<SessionPool>, stream: TcpStream, peer: SocketAddr, events: &EventSink) {
    let session_id = pool.accept_remote(stream, peer, None, events);
    trace!(tunnel_id = pool.tunnel_id(), session_id, "TCP session opened");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{probe_port, DefaultInterceptor, PortRange};
    use lighttunnel_shared::crypto::RsaKeyPair;
    use tokio::io::ReadHalf;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    type Link = ControlLink<ReadHalf<TcpStream>>;

    async fn start(token: Option<&str>) -> ServerHandle {
        let mut options = ServerOptions::new(LOCALHOST, 0);
        options.http_port = Some(0);
        let interceptor = DefaultInterceptor::new(token.map(str::to_string), None, LOCALHOST);
        TunnelServer::new(options, Arc::new(interceptor))
            .start()
            .await
            .unwrap()
    }

    async fn start_with(interceptor: Arc<dyn RequestInterceptor>) -> ServerHandle {
        TunnelServer::new(ServerOptions::new(LOCALHOST, 0), interceptor)
            .start()
            .await
            .unwrap()
    }

    fn two_free_ports() -> (u16, u16) {
        loop {
            let a = crate::policy::ephemeral_port(LOCALHOST).unwrap();
            let b = crate::policy::ephemeral_port(LOCALHOST).unwrap();
            if a != b {
                return (a, b);
            }
        }
    }

    fn granted_port(response: &ProtoMsg) -> u16 {
        match response {
            ProtoMsg::Response { ok: true, data, .. } => {
                TunnelRequest::from_bytes(data).unwrap().remote_port().unwrap()
            }
            other => panic!("expected accepted response, got {other:?}"),
        }
    }

    async fn connect(server: &ServerHandle) -> Link {
        let addr = server.control_addr();
        let stream = TcpStream::connect(addr).await.unwrap();
        ControlLink::new(stream, addr, HeartbeatConfig::default(), CancellationToken::new())
    }

    async fn recv(link: &mut Link) -> ProtoMsg {
        match link.next().await.unwrap() {
            Some(Inbound::Msg(msg)) => msg,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    async fn request(link: &mut Link, request: TunnelRequest) -> ProtoMsg {
        link.send(ProtoMsg::Request {
            data: request.to_bytes(),
        })
        .unwrap();
        recv(link).await
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_tcp_tunnel_sessions() {
        let server = start(None).await;
        let mut link = connect(&server).await;

        let ProtoMsg::Response { ok: true, tunnel_id, data } =
            request(&mut link, TunnelRequest::for_tcp("127.0.0.1", 2222, 0)).await
        else {
            panic!("expected accepted response");
        };
        let granted = TunnelRequest::from_bytes(&data).unwrap();
        let port = granted.remote_port().unwrap();
        assert_ne!(port, 0);
        assert!(server.tcp_registry().is_registered(&port));

        let mut external = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let ProtoMsg::RemoteConnected { session_id, .. } = recv(&mut link).await else {
            panic!("expected remote connected");
        };

        external.write_all(b"hello").await.unwrap();
        let ProtoMsg::Transfer { data, .. } = recv(&mut link).await else {
            panic!("expected transfer");
        };
        assert_eq!(&data[..], b"hello");

        link.send(ProtoMsg::Transfer {
            tunnel_id,
            session_id,
            data: "world".into(),
        })
        .unwrap();
        let mut buf = [0u8; 5];
        external.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        link.send(ProtoMsg::LocalDisconnect {
            tunnel_id,
            session_id,
        })
        .unwrap();
        let mut rest = Vec::new();
        assert_eq!(external.read_to_end(&mut rest).await.unwrap(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_taken_auto_port_is_reassigned() {
        let (taken, free) = two_free_ports();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let interceptor = move |request: TunnelRequest| -> std::result::Result<TunnelRequest, Rejection> {
            match request.kind() {
                TunnelKind::Tcp { remote_port: 0 } => {
                    let port = if counter.fetch_add(1, Ordering::SeqCst) == 0 { taken } else { free };
                    request.copy_tcp(port).map_err(|e| Rejection::new(e.to_string()))
                }
                _ => Ok(request),
            }
        };
        let server = start_with(Arc::new(interceptor)).await;

        let mut holder = connect(&server).await;
        let response = request(&mut holder, TunnelRequest::for_tcp("127.0.0.1", 22, taken)).await;
        assert_eq!(granted_port(&response), taken);

        let mut link = connect(&server).await;
        let response = request(&mut link, TunnelRequest::for_tcp("127.0.0.1", 22, 0)).await;
        assert_eq!(granted_port(&response), free);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Explicit ports are not reassigned.
        let mut late = connect(&server).await;
        let response = request(&mut late, TunnelRequest::for_tcp("127.0.0.1", 22, taken)).await;
        let ProtoMsg::Response { ok: false, data, .. } = response else {
            panic!("expected rejection, got {response:?}");
        };
        assert!(String::from_utf8_lossy(&data).contains("already in use"));
        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_auto_ports_share_small_range() {
        let (a, b) = two_free_ports();
        let range = PortRange::parse(&format!("{a},{b}")).unwrap();
        let server = start_with(Arc::new(DefaultInterceptor::new(None, Some(range), LOCALHOST))).await;

        for _ in 0..3 {
            let mut first = connect(&server).await;
            let mut second = connect(&server).await;
            let (one, two) = tokio::join!(
                request(&mut first, TunnelRequest::for_tcp("127.0.0.1", 22, 0)),
                request(&mut second, TunnelRequest::for_tcp("127.0.0.1", 23, 0)),
            );
            let mut ports = [granted_port(&one), granted_port(&two)];
            ports.sort_unstable();
            let mut expected = [a, b];
            expected.sort_unstable();
            assert_eq!(ports, expected);

            drop(first);
            drop(second);
            wait_until(|| probe_port(LOCALHOST, a) && probe_port(LOCALHOST, b)).await;
        }
        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_response_precedes_first_session() {
        let server = start(None).await;
        for _ in 0..5 {
            let port = crate::policy::ephemeral_port(LOCALHOST).unwrap();
            // Connects as soon as the tunnel port is bound.
            let external = tokio::spawn(async move {
                loop {
                    match TcpStream::connect((LOCALHOST, port)).await {
                        Ok(stream) => return stream,
                        Err(_) => tokio::task::yield_now().await,
                    }
                }
            });

            let mut link = connect(&server).await;
            let response = request(&mut link, TunnelRequest::for_tcp("127.0.0.1", 22, port)).await;
            assert_eq!(granted_port(&response), port);
            assert!(matches!(recv(&mut link).await, ProtoMsg::RemoteConnected { .. }));
            drop(external.await.unwrap());

            drop(link);
            let tcp = server.tcp_registry().clone();
            wait_until(|| tcp.is_empty()).await;
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_request_closes_connection() {
        let server = start(Some("secret")).await;
        let mut link = connect(&server).await;

        let response = request(
            &mut link,
            TunnelRequest::for_tcp("127.0.0.1", 22, 0).with_auth_token("wrong"),
        )
        .await;
        assert_eq!(response, ProtoMsg::response_err("invalid auth token"));
        assert!(link.next().await.unwrap().is_none());
        assert!(server.tcp_registry().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_rejected() {
        let server = start(None).await;
        let mut link = connect(&server).await;
        link.send(ProtoMsg::Request {
            data: "not a request".into(),
        })
        .unwrap();
        let ProtoMsg::Response { ok, .. } = recv(&mut link).await else {
            panic!("expected response");
        };
        assert!(!ok);
        assert!(link.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handshake_then_encrypted_request() {
        let server = start(None).await;
        let mut link = connect(&server).await;

        let keys = RsaKeyPair::generate().unwrap();
        link.send(ProtoMsg::Handshake {
            data: keys.public_der(),
        })
        .unwrap();
        let ProtoMsg::Handshake { data } = recv(&mut link).await else {
            panic!("expected handshake reply");
        };
        link.install_key(keys.open_cipher_key(&data).unwrap());

        let response = request(
            &mut link,
            TunnelRequest::for_http(false, "127.0.0.1", 8080, "enc.example.com"),
        )
        .await;
        assert!(matches!(response, ProtoMsg::Response { ok: true, .. }));
        assert!(server.http_registry().is_registered(&"enc.example.com".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (events, mut event_rx) = EventSink::channel();
        let mut options = ServerOptions::new(LOCALHOST, 0);
        options.http_port = Some(0);
        let server = TunnelServer::new(
            options,
            Arc::new(DefaultInterceptor::new(None, None, LOCALHOST)),
        )
        .with_events(events)
        .start()
        .await
        .unwrap();

        let mut link = connect(&server).await;
        let response = request(
            &mut link,
            TunnelRequest::for_http(false, "127.0.0.1", 8080, "a.example.com"),
        )
        .await;
        assert!(matches!(response, ProtoMsg::Response { ok: true, tunnel_id: 1, .. }));
        assert!(matches!(
            event_rx.recv().await,
            Some(ServerEvent::HttpTunnelConnected { tunnel_id: 1, https: false, .. })
        ));

        drop(link);
        assert!(matches!(
            event_rx.recv().await,
            Some(ServerEvent::HttpTunnelDisconnect { tunnel_id: 1, https: false, .. })
        ));
        let http = server.http_registry().clone();
        wait_until(|| http.is_empty()).await;
    }

    #[tokio::test]
    async fn test_https_disabled_rejects() {
        let server = start(None).await;
        let mut link = connect(&server).await;
        let response = request(
            &mut link,
            TunnelRequest::for_http(true, "127.0.0.1", 8443, "a.example.com"),
        )
        .await;
        assert!(matches!(response, ProtoMsg::Response { ok: false, .. }));
        assert!(server.https_registry().is_empty());
    }

    #[tokio::test]
    async fn test_force_off_acknowledged() {
        let server = start(None).await;
        let mut link = connect(&server).await;
        let ProtoMsg::Response { ok: true, data, .. } =
            request(&mut link, TunnelRequest::for_tcp("127.0.0.1", 22, 0)).await
        else {
            panic!("expected accepted response");
        };
        let port = TunnelRequest::from_bytes(&data).unwrap().remote_port().unwrap();

        let registry = server.tcp_registry().clone();
        let evict = tokio::spawn(async move { registry.force_off(&port).await });

        assert_eq!(recv(&mut link).await, ProtoMsg::ForceOff);
        link.send(ProtoMsg::ForceOffReply).unwrap();

        assert!(evict.await.unwrap().is_some());
        assert!(!server.tcp_registry().is_registered(&port));
        assert!(link.next().await.unwrap().is_none());
    }
}
