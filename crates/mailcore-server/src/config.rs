use anyhow::Context;
use mailcore_conn::connection::DEFAULT_MAX_LINE_SIZE;
use mailcore_conn::ConnectionOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: ServerSettings,
    /// STARTTLS (and implicit TLS) are only offered when present
    pub tls: Option<TlsSettings>,
    pub audit: AuditSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerSettings {
    pub service_name: String,
    /// `IP:port` pairs; `*` means every IPv4 address
    pub listen: Vec<String>,
    /// Serve on a local socket instead of TCP
    pub socket: Option<PathBuf>,
    pub backlog: i32,
    pub reuse_port: bool,
    /// More than one selects the pre-forked supervisor model
    pub workers: usize,
    pub resolve_ip: bool,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub timeout: Duration,
    #[serde(deserialize_with = "crate::duration::optional::deserialize")]
    pub login_timeout: Option<Duration>,
    pub max_line_size: usize,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub probe_interval: Duration,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub shutdown_timeout: Duration,
    pub implicit_tls: bool,
    pub log_filter: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            service_name: "mailcore".to_string(),
            listen: vec![],
            socket: None,
            backlog: 128,
            reuse_port: false,
            workers: 1,
            resolve_ip: false,
            timeout: Duration::from_secs(600),
            login_timeout: Some(Duration::from_secs(60)),
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            probe_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            implicit_tls: false,
            log_filter: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TlsSettings {
    /// PEM encoded certificate chain
    pub certificate: Option<PathBuf>,
    /// PEM encoded private key. When omitted, a self-signed
    /// certificate is generated at startup.
    pub private_key: Option<PathBuf>,
    /// Subject name for the self-signed certificate; defaults to
    /// the local hostname
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuditSettings {
    pub enabled: bool,
    /// Append JSON lines here. Without a path, records are logged
    /// on the `audit` tracing target.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreSettings {
    /// `host:port` of the backing store. Without one, the store is
    /// assumed to always be reachable.
    pub address: Option<String>,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub connect_timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the worker should listen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoints {
    Tcp(Vec<SocketAddr>),
    Unix(PathBuf),
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let server = &self.server;
        match (server.listen.is_empty(), &server.socket) {
            (false, Some(_)) => anyhow::bail!("server.listen and server.socket are mutually exclusive"),
            (true, None) => anyhow::bail!("one of server.listen or server.socket is required"),
            _ => {}
        }
        if server.workers == 0 {
            anyhow::bail!("server.workers must be at least 1");
        }
        if server.max_line_size == 0 {
            anyhow::bail!("server.max_line_size must be at least 1");
        }
        if server.probe_interval.is_zero() {
            anyhow::bail!("server.probe_interval must be positive");
        }
        if server.backlog <= 0 {
            anyhow::bail!("server.backlog must be positive");
        }
        if server.implicit_tls && self.tls.is_none() {
            anyhow::bail!("server.implicit_tls requires a [tls] section");
        }
        if self.audit.path.is_some() && !self.audit.enabled {
            tracing::warn!("audit.path is set but audit.enabled is false; no audit log will be written");
        }
        Ok(())
    }

    pub fn endpoints(&self) -> anyhow::Result<Endpoints> {
        if let Some(path) = &self.server.socket {
            return Ok(Endpoints::Unix(path.clone()));
        }
        let addrs = self
            .server
            .listen
            .iter()
            .map(|address| mailcore_reactor::parse_listen_address(address))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Endpoints::Tcp(addrs))
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            timeout: self.server.timeout,
            login_timeout: self.server.login_timeout,
            max_line_size: self.server.max_line_size,
            resolve_ip: self.server.resolve_ip,
        }
    }
}
