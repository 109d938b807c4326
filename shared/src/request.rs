//! The tunnel request: what a client asks the relay to expose.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Well-known keys of [`TunnelRequest::extras`].
pub mod extras {
    pub const PROXY_SET_HEADERS: &str = "proxy_set_headers";
    pub const PROXY_ADD_HEADERS: &str = "proxy_add_headers";
    pub const ENABLE_BASIC_AUTH: &str = "enable_basic_auth";
    pub const BASIC_AUTH_REALM: &str = "basic_auth_realm";
    pub const BASIC_AUTH_USERNAME: &str = "basic_auth_username";
    pub const BASIC_AUTH_PASSWORD: &str = "basic_auth_password";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Tcp,
    Http,
    Https,
}

impl TunnelType {
    fn code(self) -> u8 {
        match self {
            TunnelType::Tcp => 1,
            TunnelType::Http => 2,
            TunnelType::Https => 3,
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Tcp => write!(f, "tcp"),
            TunnelType::Http => write!(f, "http"),
            TunnelType::Https => write!(f, "https"),
        }
    }
}

/// The part of a request that depends on its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tunnelType", rename_all = "lowercase")]
pub enum TunnelKind {
    /// `remote_port == 0` asks the relay to pick one.
    Tcp {
        #[serde(rename = "remotePort")]
        remote_port: u16,
    },
    Http { vhost: String },
    Https { vhost: String },
}

/// HTTP basic auth the relay enforces in front of a vhost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub realm: String,
    pub username: String,
    pub password: String,
}

/// Immutable description of one tunnel.
///
/// Built with [`TunnelRequest::for_tcp`] / [`TunnelRequest::for_http`] and the `with_*`
/// builders. The relay derives the final request with [`TunnelRequest::copy_tcp`] or
/// [`TunnelRequest::copy_http`], which leave the original untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    #[serde(flatten)]
    kind: TunnelKind,
    local_addr: String,
    local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default)]
    extras: BTreeMap<String, String>,
}

impl TunnelRequest {
    pub fn for_tcp(local_addr: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self::with_kind(TunnelKind::Tcp { remote_port }, local_addr.into(), local_port)
    }

    pub fn for_http(
        https: bool,
        local_addr: impl Into<String>,
        local_port: u16,
        vhost: impl Into<String>,
    ) -> Self {
        let vhost = vhost.into();
        let kind = if https {
            TunnelKind::Https { vhost }
        } else {
            TunnelKind::Http { vhost }
        };
        Self::with_kind(kind, local_addr.into(), local_port)
    }

    fn with_kind(kind: TunnelKind, local_addr: String, local_port: u16) -> Self {
        Self {
            kind,
            local_addr,
            local_port,
            auth_token: None,
            name: None,
            os: None,
            version: None,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Headers set (overwritten) on requests forwarded to this vhost.
    pub fn with_proxy_set_headers(self, headers: &[(String, String)]) -> Self {
        if headers.is_empty() {
            return self;
        }
        self.with_extra(extras::PROXY_SET_HEADERS, join_headers(headers))
    }

    /// Headers added to forwarded requests when not already present.
    pub fn with_proxy_add_headers(self, headers: &[(String, String)]) -> Self {
        if headers.is_empty() {
            return self;
        }
        self.with_extra(extras::PROXY_ADD_HEADERS, join_headers(headers))
    }

    pub fn with_basic_auth(self, auth: &BasicAuth) -> Self {
        self.with_extra(extras::ENABLE_BASIC_AUTH, "true")
            .with_extra(extras::BASIC_AUTH_REALM, auth.realm.clone())
            .with_extra(extras::BASIC_AUTH_USERNAME, auth.username.clone())
            .with_extra(extras::BASIC_AUTH_PASSWORD, auth.password.clone())
    }

    /// Same request bound to another remote port. Only valid for TCP requests.
    pub fn copy_tcp(&self, remote_port: u16) -> Result<Self> {
        match self.kind {
            TunnelKind::Tcp { .. } => Ok(Self {
                kind: TunnelKind::Tcp { remote_port },
                ..self.clone()
            }),
            _ => Err(Error::Tunnel(format!(
                "cannot assign a remote port to a {} tunnel",
                self.tunnel_type()
            ))),
        }
    }

    /// Same request bound to another vhost. Only valid for HTTP/HTTPS requests.
    pub fn copy_http(&self, vhost: impl Into<String>) -> Result<Self> {
        let vhost = vhost.into();
        let kind = match self.kind {
            TunnelKind::Http { .. } => TunnelKind::Http { vhost },
            TunnelKind::Https { .. } => TunnelKind::Https { vhost },
            TunnelKind::Tcp { .. } => {
                return Err(Error::Tunnel("cannot assign a vhost to a tcp tunnel".into()))
            }
        };
        Ok(Self {
            kind,
            ..self.clone()
        })
    }

    pub fn kind(&self) -> &TunnelKind {
        &self.kind
    }

    pub fn tunnel_type(&self) -> TunnelType {
        match self.kind {
            TunnelKind::Tcp { .. } => TunnelType::Tcp,
            TunnelKind::Http { .. } => TunnelType::Http,
            TunnelKind::Https { .. } => TunnelType::Https,
        }
    }

    pub fn remote_port(&self) -> Option<u16> {
        match self.kind {
            TunnelKind::Tcp { remote_port } => Some(remote_port),
            _ => None,
        }
    }

    pub fn vhost(&self) -> Option<&str> {
        match &self.kind {
            TunnelKind::Http { vhost } | TunnelKind::Https { vhost } => Some(vhost),
            TunnelKind::Tcp { .. } => None,
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn os(&self) -> Option<&str> {
        self.os.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn extras(&self) -> &BTreeMap<String, String> {
        &self.extras
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    pub fn proxy_set_headers(&self) -> Vec<(String, String)> {
        self.extra(extras::PROXY_SET_HEADERS)
            .map(split_headers)
            .unwrap_or_default()
    }

    pub fn proxy_add_headers(&self) -> Vec<(String, String)> {
        self.extra(extras::PROXY_ADD_HEADERS)
            .map(split_headers)
            .unwrap_or_default()
    }

    pub fn basic_auth(&self) -> Option<BasicAuth> {
        if self.extra(extras::ENABLE_BASIC_AUTH) != Some("true") {
            return None;
        }
        Some(BasicAuth {
            realm: self.extra(extras::BASIC_AUTH_REALM).unwrap_or(".").to_string(),
            username: self.extra(extras::BASIC_AUTH_USERNAME).unwrap_or_default().to_string(),
            password: self.extra(extras::BASIC_AUTH_PASSWORD).unwrap_or_default().to_string(),
        })
    }

    /// Copy without the auth token, for admin and log output.
    pub fn redacted(&self) -> Self {
        Self {
            auth_token: None,
            ..self.clone()
        }
    }

    /// Compact binary form carried in `Request` and `Response` messages.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.tunnel_type().code());
        buf.put_u16(self.local_port);
        buf.put_u16(self.remote_port().unwrap_or(0));
        put_str(&mut buf, &self.local_addr);
        put_str(&mut buf, self.vhost().unwrap_or_default());
        put_opt(&mut buf, &self.auth_token);
        put_opt(&mut buf, &self.name);
        put_opt(&mut buf, &self.os);
        put_opt(&mut buf, &self.version);
        buf.put_u32(self.extras.len() as u32);
        for (key, value) in &self.extras {
            put_str(&mut buf, key);
            put_str(&mut buf, value);
        }
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let code = get_u8(&mut buf)?;
        let local_port = get_u16(&mut buf)?;
        let remote_port = get_u16(&mut buf)?;
        let local_addr = get_str(&mut buf)?;
        let vhost = get_str(&mut buf)?;
        let kind = match code {
            1 => TunnelKind::Tcp { remote_port },
            2 => TunnelKind::Http { vhost },
            3 => TunnelKind::Https { vhost },
            other => return Err(Error::protocol(format!("unknown tunnel type {other}"))),
        };
        let auth_token = get_opt(&mut buf)?;
        let name = get_opt(&mut buf)?;
        let os = get_opt(&mut buf)?;
        let version = get_opt(&mut buf)?;

        let count = get_u32(&mut buf)?;
        let mut extras = BTreeMap::new();
        for _ in 0..count {
            let key = get_str(&mut buf)?;
            let value = get_str(&mut buf)?;
            extras.insert(key, value);
        }
        if buf.has_remaining() {
            return Err(Error::protocol(format!(
                "tunnel request: {} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self {
            kind,
            local_addr,
            local_port,
            auth_token,
            name,
            os,
            version,
            extras,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::protocol(format!("tunnel request json: {e}")))
    }
}

impl fmt::Display for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TunnelKind::Tcp { remote_port } => write!(
                f,
                "tcp {}:{} <- :{}",
                self.local_addr, self.local_port, remote_port
            ),
            TunnelKind::Http { vhost } => {
                write!(f, "http {}:{} <- {}", self.local_addr, self.local_port, vhost)
            }
            TunnelKind::Https { vhost } => {
                write!(f, "https {}:{} <- {}", self.local_addr, self.local_port, vhost)
            }
        }
    }
}

fn join_headers(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join(";")
}

fn split_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|entry| {
            let (name, value) = entry.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt(buf: &mut BytesMut, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn truncated() -> Error {
    Error::protocol("tunnel request: truncated")
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let (head, tail) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| Error::protocol("tunnel request: invalid utf-8"))?
        .to_string();
    *buf = tail;
    Ok(s)
}

fn get_opt(buf: &mut &[u8]) -> Result<Option<String>> {
    match get_u8(buf)? {
        0 => Ok(None),
        1 => get_str(buf).map(Some),
        other => Err(Error::protocol(format!("tunnel request: bad option flag {other}"))),
    }
}
