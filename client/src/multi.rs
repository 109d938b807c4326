//! Multi-tunnel manager
//!
//! Spawns every tunnel of a configuration file over one [`TunnelClient`], logs their events
//! and shuts them down together.

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{server_host, ClientConfig};
use crate::tunnel::{ClientEvent, TunnelClient, TunnelHandle};
use lighttunnel_shared::{TunnelRequest, TunnelType};

/// Manages multiple tunnel connections
pub struct TunnelManager {
    client: TunnelClient,
    requests: Vec<TunnelRequest>,
    tunnels: Vec<TunnelHandle>,
    loggers: Vec<JoinHandle<()>>,
}

impl TunnelManager {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        if config.tunnels.is_empty() {
            anyhow::bail!("No tunnels defined in configuration");
        }
        let requests = config
            .tunnels
            .iter()
            .map(|tunnel| tunnel.to_request(config.auth_token.as_deref()))
            .collect();
        Ok(Self::with_requests(
            TunnelClient::new(config.client_options()?),
            requests,
        ))
    }

    pub fn with_requests(client: TunnelClient, requests: Vec<TunnelRequest>) -> Self {
        Self {
            client,
            requests,
            tunnels: Vec::new(),
            loggers: Vec::new(),
        }
    }

    /// Start all tunnels
    pub fn start_all(&mut self) {
        println!(
            "\nLightTunnel {}: starting {} tunnel(s) via {}\n",
            lighttunnel_shared::VERSION,
            self.requests.len(),
            self.client.options().server
        );

        for request in &self.requests {
            let mut handle = self.client.spawn(request.clone());
            if let Some(events) = handle.take_events() {
                let label = label(request);
                let host = server_host(&self.client.options().server).to_string();
                self.loggers.push(tokio::spawn(log_events(label, host, events)));
            }
            self.tunnels.push(handle);
        }
    }

    pub fn tunnels(&self) -> &[TunnelHandle] {
        &self.tunnels
    }

    /// Wait until every tunnel has stopped on its own, or Ctrl+C
    pub async fn wait_for_shutdown(self) {
        let TunnelManager {
            tunnels, loggers, ..
        } = self;
        let closers: Vec<_> = tunnels.iter().map(|t| t.closer()).collect();
        let all_done = futures_util::future::join_all(tunnels.into_iter().map(TunnelHandle::join));

        tokio::select! {
            _ = all_done => info!("All tunnels stopped"),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down all tunnels...");
                for closer in &closers {
                    closer.cancel();
                }
            }
        }
        for logger in loggers {
            let _ = logger.await;
        }
        println!("\nAll tunnels stopped.");
    }
}

fn label(request: &TunnelRequest) -> String {
    let name = request.name().unwrap_or("tunnel");
    format!("{name} ({})", request.tunnel_type())
}

/// Print the public endpoint of a connected tunnel.
pub fn describe(request: &TunnelRequest, server_host: &str) -> String {
    let local = format!("{}:{}", request.local_addr(), request.local_port());
    match (request.tunnel_type(), request.remote_port(), request.vhost()) {
        (TunnelType::Tcp, Some(port), _) => format!("tcp://{server_host}:{port} -> {local}"),
        (TunnelType::Http, _, Some(vhost)) => format!("http://{vhost} -> {local}"),
        (TunnelType::Https, _, Some(vhost)) => format!("https://{vhost} -> {local}"),
        _ => format!("{request} -> {local}"),
    }
}

async fn log_events(
    label: String,
    server_host: String,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connecting => info!("[{}] Connecting", label),
            ClientEvent::Connected { tunnel_id, request } => {
                println!("  ✓ {} #{}: {}", label, tunnel_id, describe(&request, &server_host));
            }
            ClientEvent::Disconnected { error: Some(error) } => {
                warn!("[{}] Disconnected: {}", label, error)
            }
            ClientEvent::Disconnected { error: None } => warn!("[{}] Connection lost", label),
            ClientEvent::Rejected { reason } => warn!("[{}] Rejected by relay: {}", label, reason),
            ClientEvent::ForcedOff => warn!("[{}] Forced off by relay", label),
            ClientEvent::Closed => {
                info!("[{}] Closed", label);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let tcp = TunnelRequest::for_tcp("127.0.0.1", 22, 10022);
        assert_eq!(describe(&tcp, "relay.example.com"), "tcp://relay.example.com:10022 -> 127.0.0.1:22");

        let http = TunnelRequest::for_http(false, "localhost", 3000, "api.example.com");
        assert_eq!(describe(&http, "relay.example.com"), "http://api.example.com -> localhost:3000");
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(TunnelManager::new(&ClientConfig::default()).is_err());
    }
}
