//! LightTunnel client
//!
//! Opens tunnels on a relay and bridges each remote session to a connection on a local
//! service.

pub mod config;
pub mod multi;
pub mod proxy;
pub mod tunnel;

pub use config::ClientConfig;
pub use lighttunnel_shared::{Error, Result, TunnelRequest};
pub use multi::TunnelManager;
pub use proxy::LocalConnector;
pub use tunnel::{ClientEvent, ClientOptions, RetryPolicy, TunnelClient, TunnelHandle, TunnelState};
