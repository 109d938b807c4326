//! Virtual-host routing for the HTTP and HTTPS listeners.
//!
//! Only the first request head on a connection is inspected: it picks the tunnel, passes basic
//! auth and gets the proxy headers. The rest of the connection, keep-alive requests included,
//! is streamed through the chosen session as-is.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::BytesMut;
use lighttunnel_shared::request::BasicAuth;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::headers::{parse_head, HeadParse, HeaderRewriter};
use crate::registry::HttpRegistry;
use crate::server::TLS_HANDSHAKE_TIMEOUT;

/// Time allowed for a client to send its first request head.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct VhostRouter {
    registry: Arc<HttpRegistry>,
    https: bool,
    tls: Option<TlsAcceptor>,
    events: EventSink,
}

impl VhostRouter {
    /// `tls` terminates TLS at the relay; it is required for the HTTPS listener.
    pub fn new(
        registry: Arc<HttpRegistry>,
        https: bool,
        tls: Option<TlsAcceptor>,
        events: EventSink,
    ) -> Self {
        Self {
            registry,
            https,
            tls,
            events,
        }
    }

    fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        info!(scheme = self.scheme(), addr = ?listener.local_addr().ok(), "Vhost listener started");
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Vhost accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);

            tokio::spawn(self.clone().handle(stream, peer));
        }
        debug!(scheme = self.scheme(), "Vhost listener stopped");
    }

    async fn handle<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match &self.tls {
            Some(acceptor) => {
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => self.route(tls, peer).await,
                    Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
                }
            }
            None => self.route(stream, peer).await,
        }
    }

    async fn route<S>(&self, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = BytesMut::with_capacity(4096);
        let (mut head, head_len) = loop {
            match parse_head(&buf) {
                HeadParse::Complete(head, len) => break (head, len),
                HeadParse::Invalid => {
                    return reply(&mut stream, 502, "Bad Gateway", &[]).await;
                }
                HeadParse::Partial => {}
            }
            match tokio::time::timeout(HEAD_TIMEOUT, stream.read_buf(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(_)) => {}
                Err(_) => {
                    debug!(peer = %peer, "Timed out waiting for request head");
                    return;
                }
            }
        };

        let Some(vhost) = head.vhost().map(str::to_string) else {
            return reply(&mut stream, 502, "Bad Gateway", &[]).await;
        };
        let Some(pool) = self.registry.get(&vhost) else {
            debug!(vhost = %vhost, peer = %peer, "No tunnel for host");
            return reply(&mut stream, 403, "Forbidden", &[]).await;
        };

        if let Some(auth) = pool.request().basic_auth() {
            if !authorized(head.header("Authorization"), &auth) {
                let challenge = format!("Basic realm=\"{}\"", auth.realm);
                return reply(
                    &mut stream,
                    401,
                    "Unauthorized",
                    &[("WWW-Authenticate", challenge.as_str())],
                )
                .await;
            }
        }

        let host = head.header("Host").unwrap_or_default().to_string();
        HeaderRewriter::for_request(pool.request()).rewrite_request(
            &mut head.headers,
            &peer.ip().to_string(),
            &host,
            self.https,
        );

        let rest = buf.split_off(head_len);
        let mut first = BytesMut::from(&head.to_bytes()[..]);
        first.extend_from_slice(&rest);

        pool.accept_remote(stream, peer, Some(first.freeze()), &self.events);
    }
}

fn authorized(header: Option<&str>, auth: &BasicAuth) -> bool {
    let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let expected = format!("{}:{}", auth.username, auth.password);
    decoded == expected.as_bytes()
}

async fn reply<S>(stream: &mut S, status: u16, reason: &str, extra: &[(&str, &str)])
where
    S: AsyncWrite + Unpin,
{
    let body = format!("{status} {reason}\n");
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in extra {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(&body);

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
