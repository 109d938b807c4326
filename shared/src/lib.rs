//! LightTunnel Shared Library
//!
//! Wire protocol, payload crypto, tunnel requests and the connection plumbing used by both
//! the relay and the client.

pub mod channel;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod heartbeat;
pub mod link;
pub mod protocol;
pub mod request;
pub mod stats;
pub mod tls;

pub use channel::{DataChannel, SessionTag, Side};
pub use error::{Error, Result};
pub use heartbeat::HeartbeatConfig;
pub use link::{ControlHandle, ControlLink, Inbound};
pub use protocol::{ProtoMsg, RemoteConnection};
pub use request::{TunnelRequest, TunnelType};

/// Crate version reported in requests and by the admin API.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
