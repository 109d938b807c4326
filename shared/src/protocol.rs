//! Binary protocol types for LightTunnel communication.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! +----------+-------------+----------+-----------------+---------+--------------------+
//! | Magic(1) | Version(1)  | Flags(1) | TotalLength(4)  | Type(1) | Body (type-specific)|
//! +----------+-------------+----------+-----------------+---------+--------------------+
//! ```
//!
//! `TotalLength` counts the type byte and the body, not the three-byte prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{Error, Result};

/// First byte of every frame.
pub const MAGIC: u8 = 0x4C;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic + version + flags.
pub const PREFIX_LEN: usize = 3;

/// Prefix plus the 4-byte total length field.
pub const HEADER_LEN: usize = PREFIX_LEN + 4;

/// Maximum `TotalLength` accepted from the wire (4 MiB).
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Message type bytes
pub mod msg_type {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const HANDSHAKE: u8 = 0x03;
    pub const REQUEST: u8 = 0x10;
    pub const RESPONSE: u8 = 0x11;
    pub const TRANSFER: u8 = 0x20;
    pub const REMOTE_CONNECTED: u8 = 0x30;
    pub const REMOTE_DISCONNECT: u8 = 0x31;
    pub const LOCAL_CONNECTED: u8 = 0x32;
    pub const LOCAL_DISCONNECT: u8 = 0x33;
    pub const FORCE_OFF: u8 = 0x40;
    pub const FORCE_OFF_REPLY: u8 = 0x41;
}

/// Per-message payload transformation bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const GZIP: Flags = Flags(0x01);
    pub const ENCRYPTED: Flags = Flags(0x02);

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoMsg {
    Ping,
    Pong,
    /// Key exchange: the client's RSA public key, or the server's RSA-encrypted AES key.
    Handshake { data: Bytes },
    /// Binary form of a `TunnelRequest`.
    Request { data: Bytes },
    /// Final request when `ok`, otherwise a UTF-8 error message.
    Response { ok: bool, tunnel_id: u64, data: Bytes },
    Transfer { tunnel_id: u64, session_id: u64, data: Bytes },
    /// JSON `RemoteConnection` of the external peer.
    RemoteConnected { tunnel_id: u64, session_id: u64, data: Bytes },
    RemoteDisconnect { tunnel_id: u64, session_id: u64, data: Bytes },
    LocalConnected { tunnel_id: u64, session_id: u64 },
    LocalDisconnect { tunnel_id: u64, session_id: u64 },
    ForceOff,
    ForceOffReply,
    /// A type byte this build does not know. Kept verbatim so it can be skipped.
    Unknown { msg_type: u8, body: Bytes },
}

impl ProtoMsg {
    pub fn msg_type(&self) -> u8 {
        match self {
            ProtoMsg::Ping => msg_type::PING,
            ProtoMsg::Pong => msg_type::PONG,
            ProtoMsg::Handshake { .. } => msg_type::HANDSHAKE,
            ProtoMsg::Request { .. } => msg_type::REQUEST,
            ProtoMsg::Response { .. } => msg_type::RESPONSE,
            ProtoMsg::Transfer { .. } => msg_type::TRANSFER,
            ProtoMsg::RemoteConnected { .. } => msg_type::REMOTE_CONNECTED,
            ProtoMsg::RemoteDisconnect { .. } => msg_type::REMOTE_DISCONNECT,
            ProtoMsg::LocalConnected { .. } => msg_type::LOCAL_CONNECTED,
            ProtoMsg::LocalDisconnect { .. } => msg_type::LOCAL_DISCONNECT,
            ProtoMsg::ForceOff => msg_type::FORCE_OFF,
            ProtoMsg::ForceOffReply => msg_type::FORCE_OFF_REPLY,
            ProtoMsg::Unknown { msg_type, .. } => *msg_type,
        }
    }

    /// Human-readable type name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtoMsg::Ping => "PING",
            ProtoMsg::Pong => "PONG",
            ProtoMsg::Handshake { .. } => "HANDSHAKE",
            ProtoMsg::Request { .. } => "REQUEST",
            ProtoMsg::Response { .. } => "RESPONSE",
            ProtoMsg::Transfer { .. } => "TRANSFER",
            ProtoMsg::RemoteConnected { .. } => "REMOTE_CONNECTED",
            ProtoMsg::RemoteDisconnect { .. } => "REMOTE_DISCONNECT",
            ProtoMsg::LocalConnected { .. } => "LOCAL_CONNECTED",
            ProtoMsg::LocalDisconnect { .. } => "LOCAL_DISCONNECT",
            ProtoMsg::ForceOff => "FORCE_OFF",
            ProtoMsg::ForceOffReply => "FORCE_OFF_REPLY",
            ProtoMsg::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Variable-length payload eligible for compression (and encryption, see [`Self::is_encryptable`]).
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            ProtoMsg::Handshake { data }
            | ProtoMsg::Request { data }
            | ProtoMsg::Response { data, .. }
            | ProtoMsg::Transfer { data, .. }
            | ProtoMsg::RemoteConnected { data, .. }
            | ProtoMsg::RemoteDisconnect { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Replace the payload, keeping every other field. No-op for fixed-size messages.
    pub fn with_payload(self, payload: Bytes) -> Self {
        match self {
            ProtoMsg::Handshake { .. } => ProtoMsg::Handshake { data: payload },
            ProtoMsg::Request { .. } => ProtoMsg::Request { data: payload },
            ProtoMsg::Response { ok, tunnel_id, .. } => ProtoMsg::Response {
                ok,
                tunnel_id,
                data: payload,
            },
            ProtoMsg::Transfer {
                tunnel_id,
                session_id,
                ..
            } => ProtoMsg::Transfer {
                tunnel_id,
                session_id,
                data: payload,
            },
            ProtoMsg::RemoteConnected {
                tunnel_id,
                session_id,
                ..
            } => ProtoMsg::RemoteConnected {
                tunnel_id,
                session_id,
                data: payload,
            },
            ProtoMsg::RemoteDisconnect {
                tunnel_id,
                session_id,
                ..
            } => ProtoMsg::RemoteDisconnect {
                tunnel_id,
                session_id,
                data: payload,
            },
            other => other,
        }
    }

    /// The handshake carries the key exchange itself and is never encrypted.
    pub fn is_encryptable(&self) -> bool {
        self.payload().is_some() && !matches!(self, ProtoMsg::Handshake { .. })
    }

    /// Exact `TotalLength` of this message on the wire: type byte plus body.
    pub fn size(&self) -> usize {
        let body = match self {
            ProtoMsg::Ping | ProtoMsg::Pong | ProtoMsg::ForceOff | ProtoMsg::ForceOffReply => 0,
            ProtoMsg::Handshake { data } | ProtoMsg::Request { data } => 4 + data.len(),
            ProtoMsg::Response { data, .. } => 1 + 8 + 4 + data.len(),
            ProtoMsg::Transfer { data, .. }
            | ProtoMsg::RemoteConnected { data, .. }
            | ProtoMsg::RemoteDisconnect { data, .. } => 8 + 8 + 4 + data.len(),
            ProtoMsg::LocalConnected { .. } | ProtoMsg::LocalDisconnect { .. } => 16,
            ProtoMsg::Unknown { body, .. } => body.len(),
        };
        1 + body
    }

    /// Write the type byte and body.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.size());
        dst.put_u8(self.msg_type());
        match self {
            ProtoMsg::Ping | ProtoMsg::Pong | ProtoMsg::ForceOff | ProtoMsg::ForceOffReply => {}
            ProtoMsg::Handshake { data } | ProtoMsg::Request { data } => put_data(dst, data),
            ProtoMsg::Response {
                ok,
                tunnel_id,
                data,
            } => {
                dst.put_u8(u8::from(*ok));
                dst.put_u64(*tunnel_id);
                put_data(dst, data);
            }
            ProtoMsg::Transfer {
                tunnel_id,
                session_id,
                data,
            }
            | ProtoMsg::RemoteConnected {
                tunnel_id,
                session_id,
                data,
            }
            | ProtoMsg::RemoteDisconnect {
                tunnel_id,
                session_id,
                data,
            } => {
                dst.put_u64(*tunnel_id);
                dst.put_u64(*session_id);
                put_data(dst, data);
            }
            ProtoMsg::LocalConnected {
                tunnel_id,
                session_id,
            }
            | ProtoMsg::LocalDisconnect {
                tunnel_id,
                session_id,
            } => {
                dst.put_u64(*tunnel_id);
                dst.put_u64(*session_id);
            }
            ProtoMsg::Unknown { body, .. } => dst.put_slice(body),
        }
    }

    /// Parse a body already split at a verified frame boundary.
    pub fn decode(msg_type: u8, mut body: Bytes) -> Result<Self> {
        let msg = match msg_type {
            msg_type::PING => ProtoMsg::Ping,
            msg_type::PONG => ProtoMsg::Pong,
            msg_type::FORCE_OFF => ProtoMsg::ForceOff,
            msg_type::FORCE_OFF_REPLY => ProtoMsg::ForceOffReply,
            msg_type::HANDSHAKE => ProtoMsg::Handshake {
                data: take_data(&mut body, "HANDSHAKE")?,
            },
            msg_type::REQUEST => ProtoMsg::Request {
                data: take_data(&mut body, "REQUEST")?,
            },
            msg_type::RESPONSE => {
                let ok = take_u8(&mut body, "RESPONSE")? != 0;
                let tunnel_id = take_u64(&mut body, "RESPONSE")?;
                let data = take_data(&mut body, "RESPONSE")?;
                ProtoMsg::Response {
                    ok,
                    tunnel_id,
                    data,
                }
            }
            msg_type::TRANSFER | msg_type::REMOTE_CONNECTED | msg_type::REMOTE_DISCONNECT => {
                let tunnel_id = take_u64(&mut body, "session message")?;
                let session_id = take_u64(&mut body, "session message")?;
                let data = take_data(&mut body, "session message")?;
                match msg_type {
                    msg_type::TRANSFER => ProtoMsg::Transfer {
                        tunnel_id,
                        session_id,
                        data,
                    },
                    msg_type::REMOTE_CONNECTED => ProtoMsg::RemoteConnected {
                        tunnel_id,
                        session_id,
                        data,
                    },
                    _ => ProtoMsg::RemoteDisconnect {
                        tunnel_id,
                        session_id,
                        data,
                    },
                }
            }
            msg_type::LOCAL_CONNECTED | msg_type::LOCAL_DISCONNECT => {
                let tunnel_id = take_u64(&mut body, "local session message")?;
                let session_id = take_u64(&mut body, "local session message")?;
                if msg_type == msg_type::LOCAL_CONNECTED {
                    ProtoMsg::LocalConnected {
                        tunnel_id,
                        session_id,
                    }
                } else {
                    ProtoMsg::LocalDisconnect {
                        tunnel_id,
                        session_id,
                    }
                }
            }
            other => {
                return Ok(ProtoMsg::Unknown {
                    msg_type: other,
                    body,
                })
            }
        };

        if body.has_remaining() {
            return Err(Error::protocol(format!(
                "{}: {} trailing bytes",
                msg.name(),
                body.remaining()
            )));
        }
        Ok(msg)
    }

    pub fn response_ok(tunnel_id: u64, final_request: Bytes) -> Self {
        ProtoMsg::Response {
            ok: true,
            tunnel_id,
            data: final_request,
        }
    }

    pub fn response_err(reason: &str) -> Self {
        ProtoMsg::Response {
            ok: false,
            tunnel_id: 0,
            data: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }
}

/// A message together with the flags describing how its payload is encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: Flags,
    pub msg: ProtoMsg,
}

impl Frame {
    pub fn new(flags: Flags, msg: ProtoMsg) -> Self {
        Self { flags, msg }
    }

    pub fn plain(msg: ProtoMsg) -> Self {
        Self {
            flags: Flags::NONE,
            msg,
        }
    }

    /// Header plus `TotalLength`.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.msg.size()
    }
}

/// Peer of an external session, reported in `RemoteConnected`/`RemoteDisconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConnection {
    pub address: String,
}

impl RemoteConnection {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            address: addr.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

fn put_data(dst: &mut BytesMut, data: &Bytes) {
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
}

fn take_u8(body: &mut Bytes, what: &str) -> Result<u8> {
    if body.remaining() < 1 {
        return Err(Error::protocol(format!("{what}: truncated")));
    }
    Ok(body.get_u8())
}

fn take_u64(body: &mut Bytes, what: &str) -> Result<u64> {
    if body.remaining() < 8 {
        return Err(Error::protocol(format!("{what}: truncated id")));
    }
    Ok(body.get_u64())
}

fn take_data(body: &mut Bytes, what: &str) -> Result<Bytes> {
    if body.remaining() < 4 {
        return Err(Error::protocol(format!("{what}: truncated length")));
    }
    let len = body.get_u32() as usize;
    if body.remaining() < len {
        return Err(Error::protocol(format!(
            "{what}: declared {len} bytes, {} available",
            body.remaining()
        )));
    }
    Ok(body.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut flags = Flags::NONE;
        assert!(!flags.contains(Flags::GZIP));
        flags.insert(Flags::GZIP);
        assert!(flags.contains(Flags::GZIP));
        assert!(!flags.contains(Flags::ENCRYPTED));
        assert_eq!((Flags::GZIP | Flags::ENCRYPTED).bits(), 0x03);
    }

    #[test]
    fn test_size_matches_encoding() {
        let msgs = [
            ProtoMsg::Ping,
            ProtoMsg::Request {
                data: Bytes::from_static(b"abc"),
            },
            ProtoMsg::response_err("nope"),
            ProtoMsg::Transfer {
                tunnel_id: 1,
                session_id: 2,
                data: Bytes::from_static(b"hello"),
            },
            ProtoMsg::LocalDisconnect {
                tunnel_id: 1,
                session_id: 9,
            },
            ProtoMsg::Unknown {
                msg_type: 0x7F,
                body: Bytes::from_static(b"\x01\x02"),
            },
        ];
        for msg in msgs {
            let mut buf = BytesMut::new();
            msg.encode_into(&mut buf);
            assert_eq!(buf.len(), msg.size(), "{}", msg.name());
        }
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let body = Bytes::from_static(&[0, 0, 0, 9, b'x']);
        assert!(ProtoMsg::decode(msg_type::REQUEST, body).is_err());

        let body = Bytes::from_static(&[0, 0, 0, 1]);
        assert!(ProtoMsg::decode(msg_type::LOCAL_CONNECTED, body).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let body = Bytes::from_static(&[0xFF]);
        let err = ProtoMsg::decode(msg_type::PING, body).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let body = Bytes::from_static(b"future");
        let msg = ProtoMsg::decode(0xEE, body.clone()).unwrap();
        assert_eq!(
            msg,
            ProtoMsg::Unknown {
                msg_type: 0xEE,
                body
            }
        );
    }

    #[test]
    fn test_with_payload_keeps_ids() {
        let msg = ProtoMsg::Transfer {
            tunnel_id: 7,
            session_id: 8,
            data: Bytes::from_static(b"a"),
        };
        let msg = msg.with_payload(Bytes::from_static(b"bb"));
        assert_eq!(
            msg,
            ProtoMsg::Transfer {
                tunnel_id: 7,
                session_id: 8,
                data: Bytes::from_static(b"bb"),
            }
        );
        assert!(msg.is_encryptable());
        assert!(!ProtoMsg::Handshake { data: Bytes::new() }.is_encryptable());
        assert!(ProtoMsg::ForceOff.payload().is_none());
    }

    #[test]
    fn test_remote_connection_json() {
        let rc = RemoteConnection::new("10.0.0.1:5555".parse().unwrap());
        let bytes = rc.to_bytes();
        assert_eq!(&bytes[..], br#"{"address":"10.0.0.1:5555"}"#);
        assert_eq!(RemoteConnection::from_bytes(&bytes), Some(rc));
    }
}
