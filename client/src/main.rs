use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lighttunnel::config::{ClientConfig, TlsConfig, TunnelConfig};
use lighttunnel::{TunnelClient, TunnelManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lighttunnel")]
#[command(author = "LightTunnel Team")]
#[command(version)]
#[command(about = "Expose local services through a LightTunnel relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay control address, host:port
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Authentication token
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Encrypt payloads
    #[arg(long, global = true)]
    encrypt: bool,

    /// Connect over TLS, trusting this PEM CA file
    #[arg(long, global = true)]
    tls_ca: Option<PathBuf>,

    /// YAML configuration file (default: lighttunnel.yml in . or ~)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a TCP service
    Tcp {
        /// Local port to expose
        local_port: u16,

        /// Public port on the relay (default: relay picks)
        #[arg(short, long, default_value_t = 0)]
        remote_port: u16,

        /// Local host to forward to
        #[arg(long, default_value = "127.0.0.1")]
        local_host: String,
    },
    /// Expose an HTTP service on a virtual host
    Http {
        /// Local port to expose
        local_port: u16,

        #[arg(long)]
        vhost: String,

        #[arg(long, default_value = "127.0.0.1")]
        local_host: String,
    },
    /// Expose an HTTP service on a virtual host served over HTTPS by the relay
    Https {
        local_port: u16,

        #[arg(long)]
        vhost: String,

        #[arg(long, default_value = "127.0.0.1")]
        local_host: String,
    },
    /// Start every tunnel defined in the configuration file
    Start,
}

impl Cli {
    fn load_config(&self) -> Result<ClientConfig> {
        let path = self.config.clone().or_else(ClientConfig::find_config);
        let mut config = match &path {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };

        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(token) = &self.token {
            config.auth_token = Some(token.clone());
        }
        if self.encrypt {
            config.encrypt = true;
        }
        if let Some(ca) = &self.tls_ca {
            config.tls = Some(TlsConfig {
                ca: ca.clone(),
                server_name: config.tls.as_ref().and_then(|t| t.server_name.clone()),
            });
        }
        config.validate()?;
        Ok(config)
    }

    /// The tunnel a subcommand describes, or `None` for `start`.
    fn single_tunnel(&self) -> Option<TunnelConfig> {
        let (proto, local_host, local_port, remote_port, vhost) = match &self.command {
            Commands::Tcp {
                local_port,
                remote_port,
                local_host,
            } => ("tcp", local_host, *local_port, *remote_port, None),
            Commands::Http {
                local_port,
                vhost,
                local_host,
            } => ("http", local_host, *local_port, 0, Some(vhost.clone())),
            Commands::Https {
                local_port,
                vhost,
                local_host,
            } => ("https", local_host, *local_port, 0, Some(vhost.clone())),
            Commands::Start => return None,
        };
        Some(TunnelConfig {
            name: format!("{proto}-{local_port}"),
            proto: proto.to_string(),
            local_host: local_host.clone(),
            local_port,
            remote_port,
            vhost,
            extras: Default::default(),
            proxy_set_headers: Default::default(),
            proxy_add_headers: Default::default(),
            basic_auth: None,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "lighttunnel=debug,lighttunnel_shared=debug"
    } else {
        "lighttunnel=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = cli.load_config()?;
    let mut manager = match cli.single_tunnel() {
        Some(tunnel) => {
            tunnel.validate()?;
            let request = tunnel.to_request(config.auth_token.as_deref());
            let client = TunnelClient::new(
                config
                    .client_options()
                    .context("Failed to prepare relay connection")?,
            );
            TunnelManager::with_requests(client, vec![request])
        }
        None => TunnelManager::new(&config)?,
    };

    info!("Connecting to relay {}", config.server);
    manager.start_all();
    println!("Press Ctrl+C to stop\n");
    manager.wait_for_shutdown().await;
    Ok(())
}
