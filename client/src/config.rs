//! Configuration file parser for the LightTunnel client
//!
//! Supports lighttunnel.yml with multi-tunnel definitions, retry behaviour,
//! TLS and payload encryption settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use lighttunnel_shared::request::BasicAuth;
use lighttunnel_shared::{tls, TunnelRequest};
use serde::{Deserialize, Serialize};

use crate::tunnel::{ClientOptions, RetryPolicy, TlsOptions};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay control address, `host:port`
    #[serde(default = "default_server")]
    pub server: String,

    /// Optional authentication token
    pub auth_token: Option<String>,

    /// Exchange a key with the relay and encrypt payloads
    #[serde(default)]
    pub encrypt: bool,

    /// Connect to the relay's TLS control port
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Tunnel definitions
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the CA certificate(s) to trust
    pub ca: PathBuf,
    /// Name to verify, defaults to the host part of `server`
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub on_lose: bool,
    #[serde(default = "default_true")]
    pub on_error: bool,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            on_lose: true,
            on_error: true,
            delay_secs: default_delay_secs(),
        }
    }
}

/// Single tunnel definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Human-readable name
    pub name: String,

    /// Protocol: tcp, http or https
    #[serde(default = "default_proto")]
    pub proto: String,

    /// Local hostname to forward to (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Local port to forward traffic to
    pub local_port: u16,

    /// Public port (TCP only, 0 or absent lets the relay pick)
    #[serde(default)]
    pub remote_port: u16,

    /// Virtual host (HTTP/HTTPS only)
    pub vhost: Option<String>,

    #[serde(default)]
    pub extras: BTreeMap<String, String>,

    /// Headers overwritten on forwarded requests
    #[serde(default)]
    pub proxy_set_headers: BTreeMap<String, String>,

    /// Headers added when absent
    #[serde(default)]
    pub proxy_add_headers: BTreeMap<String, String>,

    pub basic_auth: Option<BasicAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_realm")]
    pub realm: String,
}

fn default_server() -> String {
    "127.0.0.1:5080".to_string()
}

fn default_proto() -> String {
    "tcp".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_realm() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_delay_secs() -> u64 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            auth_token: None,
            encrypt: false,
            tls: None,
            retry: RetryConfig::default(),
            tunnels: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            anyhow::bail!("Server address cannot be empty");
        }
        for tunnel in &self.tunnels {
            tunnel.validate()?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::NEVER;
        if self.retry.on_lose {
            policy = policy | RetryPolicy::RETRY_ON_LOSE;
        }
        if self.retry.on_error {
            policy = policy | RetryPolicy::RETRY_ON_ERROR;
        }
        policy
    }

    /// Connection settings, with the CA loaded.
    pub fn client_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::new(self.server.clone());
        options.encrypt = self.encrypt;
        options.retry = self.retry_policy();
        options.reconnect_delay = Duration::from_secs(self.retry.delay_secs);

        if let Some(section) = &self.tls {
            let connector = tls::connector(&section.ca)
                .with_context(|| format!("Failed to load CA file: {}", section.ca.display()))?;
            let name = section
                .server_name
                .clone()
                .unwrap_or_else(|| server_host(&self.server).to_string());
            options.tls = Some(TlsOptions {
                connector,
                server_name: tls::server_name(&name)?,
            });
        }
        Ok(options)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "lighttunnel.yml",
            "lighttunnel.yaml",
            ".lighttunnel.yml",
            ".lighttunnel.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

/// `host` out of `host:port`, `[v6]:port` or a bare host.
pub fn server_host(server: &str) -> &str {
    if let Some(rest) = server.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match server.rsplit_once(':') {
        Some((host, _)) => host,
        None => server,
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Tunnel name cannot be empty");
        }
        if self.local_port == 0 {
            anyhow::bail!("Invalid local port 0 for tunnel '{}'", self.name);
        }
        match self.proto.as_str() {
            "tcp" => {}
            "http" | "https" => {
                if self.vhost.as_deref().map_or(true, str::is_empty) {
                    anyhow::bail!("Tunnel '{}' ({}) needs a vhost", self.name, self.proto);
                }
            }
            other => anyhow::bail!("Invalid protocol '{}' for tunnel '{}'", other, self.name),
        }
        Ok(())
    }

    /// The request sent to the relay for this tunnel.
    pub fn to_request(&self, auth_token: Option<&str>) -> TunnelRequest {
        let mut request = match self.proto.as_str() {
            "http" | "https" => TunnelRequest::for_http(
                self.proto == "https",
                self.local_host.clone(),
                self.local_port,
                self.vhost.clone().unwrap_or_default(),
            ),
            _ => TunnelRequest::for_tcp(self.local_host.clone(), self.local_port, self.remote_port),
        }
        .with_name(self.name.clone())
        .with_version(lighttunnel_shared::VERSION)
        .with_os(std::env::consts::OS);

        if let Some(token) = auth_token {
            request = request.with_auth_token(token);
        }
        for (key, value) in &self.extras {
            request = request.with_extra(key.clone(), value.clone());
        }
        if !self.proxy_set_headers.is_empty() {
            request = request.with_proxy_set_headers(&pairs(&self.proxy_set_headers));
        }
        if !self.proxy_add_headers.is_empty() {
            request = request.with_proxy_add_headers(&pairs(&self.proxy_add_headers));
        }
        if let Some(auth) = &self.basic_auth {
            request = request.with_basic_auth(&BasicAuth {
                realm: auth.realm.clone(),
                username: auth.username.clone(),
                password: auth.password.clone(),
            });
        }
        request
    }
}

fn pairs(headers: &BTreeMap<String, String>) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
