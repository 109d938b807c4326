use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lighttunnel_relay::{admin, EventSink, RelayConfig, ServerEvent, TunnelServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lighttunnel-relay")]
#[command(author = "LightTunnel Team")]
#[command(version)]
#[command(about = "Reverse tunnel relay: exposes client services on public ports and virtual hosts", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address every listener binds to
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Control port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable the HTTP vhost listener on this port
    #[arg(long)]
    http_port: Option<u16>,

    /// Token clients must present
    #[arg(long)]
    auth_token: Option<String>,

    /// Allowed public TCP ports, e.g. 10000-21000,30000
    #[arg(long)]
    allow_ports: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Command line flags win over the file.
    fn merge(&self, mut config: RelayConfig) -> Result<RelayConfig> {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(port) = self.port {
            config.control_port = port;
        }
        if let Some(port) = self.http_port {
            config.http = Some(lighttunnel_relay::config::HttpSection { port });
        }
        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
        }
        if let Some(ports) = &self.allow_ports {
            config.allow_ports = Some(ports.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "lighttunnel_relay=debug,lighttunnel_shared=debug"
    } else {
        "lighttunnel_relay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    let config = cli.merge(config)?;

    let (events, mut event_rx) = EventSink::channel();
    let server = TunnelServer::new(config.server_options()?, Arc::new(config.interceptor()?))
        .with_events(events)
        .start()
        .await
        .context("Failed to start relay")?;

    info!(
        "LightTunnel relay {} listening on {}",
        lighttunnel_shared::VERSION,
        server.control_addr()
    );

    let admin_shutdown = CancellationToken::new();
    if let Some(section) = &config.admin {
        let listener = TcpListener::bind((config.bind_addr, section.port))
            .await
            .with_context(|| format!("Failed to bind admin port {}", section.port))?;
        let app = admin::router(server.registries().clone(), config.admin_credentials());
        tokio::spawn(admin::serve(listener, app, admin_shutdown.clone()));
    }

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down...");
    admin_shutdown.cancel();
    server.shutdown().await;
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::TcpTunnelConnected {
            tunnel_id,
            remote_port,
            request,
        } => info!(tunnel_id, remote_port, client = ?request.name(), "TCP tunnel up"),
        ServerEvent::TcpTunnelDisconnect {
            tunnel_id,
            remote_port,
        } => info!(tunnel_id, remote_port, "TCP tunnel down"),
        ServerEvent::HttpTunnelConnected {
            tunnel_id,
            vhost,
            https,
            request,
        } => info!(tunnel_id, vhost = %vhost, https, client = ?request.name(), "HTTP tunnel up"),
        ServerEvent::HttpTunnelDisconnect {
            tunnel_id,
            vhost,
            https,
        } => info!(tunnel_id, vhost = %vhost, https, "HTTP tunnel down"),
        ServerEvent::RemoteConnected {
            tunnel_id,
            session_id,
            remote,
        } => debug!(tunnel_id, session_id, remote = %remote.address, "Remote connected"),
        ServerEvent::RemoteDisconnect {
            tunnel_id,
            session_id,
            remote,
        } => debug!(tunnel_id, session_id, remote = %remote.address, "Remote disconnected"),
    }
}
