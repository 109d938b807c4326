//! Tunnel Request Policy
//!
//! Decides whether an incoming tunnel request is accepted and fills in what the client left
//! to the relay (an auto-assigned TCP port).

use std::net::{IpAddr, TcpListener};
use std::ops::RangeInclusive;

use lighttunnel_shared::request::TunnelKind;
use lighttunnel_shared::TunnelRequest;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Attempts at finding a free port in the allow range before giving up.
pub const MAX_PORT_ATTEMPTS: usize = 64;

/// Why a request was refused. Sent verbatim to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Consulted before anything is registered. An auto-port request is consulted again when the
/// port it was given turns out to be taken.
///
/// Runs on the blocking pool, so implementations may do synchronous work such as bind probes.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, request: TunnelRequest) -> Result<TunnelRequest, Rejection>;
}

impl<F> RequestInterceptor for F
where
    F: Fn(TunnelRequest) -> Result<TunnelRequest, Rejection> + Send + Sync,
{
    fn intercept(&self, request: TunnelRequest) -> Result<TunnelRequest, Rejection> {
        self(request)
    }
}

/// Comma separated ports and inclusive `start-end` ranges, e.g. `10000-21000,30000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    ranges: Vec<RangeInclusive<u32>>,
}

impl PortRange {
    pub fn parse(ports: &str) -> Result<Self, String> {
        let mut ranges = Vec::new();
        for part in ports.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once('-') {
                Some((start, end)) => parse_port(start)?..=parse_port(end)?,
                None => {
                    let port = parse_port(part)?;
                    port..=port
                }
            };
            if range.start() > range.end() {
                return Err(format!("empty port range '{part}'"));
            }
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err("no ports given".to_string());
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, port: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(&port))
    }

    fn len(&self) -> u32 {
        self.ranges.iter().map(|r| r.end() - r.start() + 1).sum()
    }

    /// Uniformly random port from the whole set.
    pub fn random_port(&self) -> u16 {
        let mut index = rand::thread_rng().gen_range(0..self.len());
        for range in &self.ranges {
            let size = range.end() - range.start() + 1;
            if index < size {
                return (range.start() + index) as u16;
            }
            index -= size;
        }
        0
    }
}

fn parse_port(s: &str) -> Result<u32, String> {
    let port: u32 = s
        .trim()
        .parse()
        .map_err(|_| format!("invalid port '{}'", s.trim()))?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(format!("port {port} out of range"));
    }
    Ok(port)
}

/// Bind and release a listener to see whether `port` is free at the OS level.
pub fn probe_port(bind_addr: IpAddr, port: u16) -> bool {
    TcpListener::bind((bind_addr, port)).is_ok()
}

/// Let the OS pick a free port.
pub fn ephemeral_port(bind_addr: IpAddr) -> Option<u16> {
    let listener = TcpListener::bind((bind_addr, 0)).ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}

/// Token check plus TCP port allocation.
#[derive(Debug, Clone)]
pub struct DefaultInterceptor {
    pub auth_token: Option<String>,
    pub allow_ports: Option<PortRange>,
    pub bind_addr: IpAddr,
}

impl DefaultInterceptor {
    pub fn new(auth_token: Option<String>, allow_ports: Option<PortRange>, bind_addr: IpAddr) -> Self {
        Self {
            auth_token,
            allow_ports,
            bind_addr,
        }
    }

    fn assign_port(&self) -> Result<u16, Rejection> {
        let Some(range) = &self.allow_ports else {
            return ephemeral_port(self.bind_addr)
                .ok_or_else(|| Rejection::new("no free port available"));
        };
        for _ in 0..MAX_PORT_ATTEMPTS {
            let port = range.random_port();
            if probe_port(self.bind_addr, port) {
                return Ok(port);
            }
            debug!(port, "Candidate port busy");
        }
        Err(Rejection::new("no free port in the allowed range"))
    }
}

impl RequestInterceptor for DefaultInterceptor {
    fn intercept(&self, request: TunnelRequest) -> Result<TunnelRequest, Rejection> {
        if let Some(expected) = &self.auth_token {
            if request.auth_token() != Some(expected.as_str()) {
                return Err(Rejection::new("invalid auth token"));
            }
        }

        match request.kind() {
            TunnelKind::Tcp { remote_port: 0 } => {
                let port = self.assign_port()?;
                request
                    .copy_tcp(port)
                    .map_err(|e| Rejection::new(e.to_string()))
            }
            TunnelKind::Tcp { remote_port } => match &self.allow_ports {
                Some(range) if !range.contains(*remote_port as u32) => Err(Rejection::new(format!(
                    "remote port {remote_port} is not allowed"
                ))),
                _ => Ok(request),
            },
            TunnelKind::Http { vhost } | TunnelKind::Https { vhost } => {
                if vhost.is_empty() {
                    return Err(Rejection::new("vhost is required"));
                }
                Ok(request)
            }
        }
    }
}
