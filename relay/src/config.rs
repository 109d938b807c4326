//! Relay configuration file (`lighttunnel-relay.yml`).

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lighttunnel_shared::{tls, HeartbeatConfig};
use serde::{Deserialize, Serialize};

use crate::admin::AdminCredentials;
use crate::policy::{DefaultInterceptor, PortRange};
use crate::server::{ServerOptions, TlsListener};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address every listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Plain control port
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// TLS control port
    #[serde(default)]
    pub tls: Option<TlsSection>,

    /// HTTP vhost listener
    #[serde(default)]
    pub http: Option<HttpSection>,

    /// HTTPS vhost listener, TLS terminated here
    #[serde(default)]
    pub https: Option<TlsSection>,

    /// Token clients must present
    pub auth_token: Option<String>,

    /// Public TCP ports tunnels may use, e.g. `10000-21000,30000`
    pub allow_ports: Option<String>,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    /// Admin API
    #[serde(default)]
    pub admin: Option<AdminSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    pub port: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_write_idle")]
    pub write_idle_secs: u64,
    #[serde(default = "default_read_idle")]
    pub read_idle_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            write_idle_secs: default_write_idle(),
            read_idle_secs: default_read_idle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSection {
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_control_port() -> u16 {
    5080
}

fn default_write_idle() -> u64 {
    30
}

fn default_read_idle() -> u64 {
    90
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            control_port: default_control_port(),
            tls: None,
            http: None,
            https: None,
            auth_token: None,
            allow_ports: None,
            heartbeat: HeartbeatSection::default(),
            admin: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.port_range()?;

        if self.heartbeat.write_idle_secs == 0 || self.heartbeat.read_idle_secs == 0 {
            anyhow::bail!("Heartbeat intervals must be positive");
        }
        if self.heartbeat.read_idle_secs <= self.heartbeat.write_idle_secs {
            anyhow::bail!(
                "read_idle_secs ({}) must be greater than write_idle_secs ({})",
                self.heartbeat.read_idle_secs,
                self.heartbeat.write_idle_secs
            );
        }

        if let Some(admin) = &self.admin {
            if admin.username.is_some() != admin.password.is_some() {
                anyhow::bail!("Admin username and password must be set together");
            }
        }

        let mut seen = HashSet::new();
        for (what, port) in self.listener_ports() {
            if port != 0 && !seen.insert(port) {
                anyhow::bail!("Port {} is used by more than one listener ({})", port, what);
            }
        }
        Ok(())
    }

    fn listener_ports(&self) -> Vec<(&'static str, u16)> {
        let mut ports = vec![("control", self.control_port)];
        if let Some(tls) = &self.tls {
            ports.push(("tls", tls.port));
        }
        if let Some(http) = &self.http {
            ports.push(("http", http.port));
        }
        if let Some(https) = &self.https {
            ports.push(("https", https.port));
        }
        if let Some(admin) = &self.admin {
            ports.push(("admin", admin.port));
        }
        ports
    }

    pub fn port_range(&self) -> Result<Option<PortRange>> {
        self.allow_ports
            .as_deref()
            .map(|ports| {
                PortRange::parse(ports).map_err(|e| anyhow::anyhow!("Invalid allow_ports: {}", e))
            })
            .transpose()
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::from_secs(self.heartbeat.write_idle_secs, self.heartbeat.read_idle_secs)
    }

    pub fn interceptor(&self) -> Result<DefaultInterceptor> {
        Ok(DefaultInterceptor::new(
            self.auth_token.clone(),
            self.port_range()?,
            self.bind_addr,
        ))
    }

    /// Listener settings, with certificates loaded.
    pub fn server_options(&self) -> Result<ServerOptions> {
        let mut options = ServerOptions::new(self.bind_addr, self.control_port);
        options.heartbeat = self.heartbeat();
        options.http_port = self.http.as_ref().map(|h| h.port);
        options.tls_control = self.tls.as_ref().map(load_tls).transpose()?;
        options.https = self.https.as_ref().map(load_tls).transpose()?;
        Ok(options)
    }

    pub fn admin_credentials(&self) -> Option<AdminCredentials> {
        let admin = self.admin.as_ref()?;
        Some(AdminCredentials {
            username: admin.username.clone()?,
            password: admin.password.clone()?,
        })
    }
}

fn load_tls(section: &TlsSection) -> Result<TlsListener> {
    let acceptor = tls::acceptor(&section.cert, &section.key).with_context(|| {
        format!(
            "Failed to load TLS material ({}, {})",
            section.cert.display(),
            section.key.display()
        )
    })?;
    Ok(TlsListener {
        port: section.port,
        acceptor,
    })
}
