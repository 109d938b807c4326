//! LightTunnel relay
//!
//! Accepts control connections from clients, binds their tunnels to public TCP ports or HTTP
//! virtual hosts, and multiplexes every external connection over the owning control
//! connection.

pub mod admin;
pub mod config;
pub mod events;
pub mod headers;
pub mod policy;
pub mod registry;
pub mod router;
pub mod server;
pub mod tunnel;

pub use config::RelayConfig;
pub use events::{EventSink, ServerEvent};
pub use lighttunnel_shared::{Error, Result};
pub use policy::{DefaultInterceptor, PortRange, Rejection, RequestInterceptor};
pub use registry::{HttpRegistry, TcpRegistry};
pub use server::{Registries, ServerHandle, ServerOptions, Snapshot, TunnelServer};
pub use tunnel::{SessionPool, TunnelDescriptor};
