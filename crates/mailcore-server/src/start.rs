use crate::config::{Config, Endpoints};
use crate::diagnostic_logging::{set_diagnostic_log_filter, LoggingConfig};
use crate::store::probe_from_settings;
use crate::supervisor::Supervisor;
use crate::tls_helpers::make_server_config;
use crate::worker::{Outcome, Worker, WorkerTiming};
use anyhow::Context;
use mailcore_conn::{AuditSink, JsonlAuditSink, TracingAuditSink};
use mailcore_reactor::{AcceptConfig, Dispatch, Listener, SignalBridge};
use rustls::ServerConfig;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

/// Builds the protocol handler for a worker, given the loaded
/// configuration and the TLS configuration to offer, if any
pub type DispatchFactory<'a> =
    dyn Fn(&Config, Option<Arc<ServerConfig>>) -> Box<dyn Dispatch> + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Listen on the configured endpoints
    Daemon,
    /// Serve a single connection on stdin/stdout
    Stdio,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

pub struct StartConfig<'a> {
    pub logging: LoggingConfig<'a>,
    pub config_path: &'a Path,
    pub mode: RunMode,
}

impl<'a> StartConfig<'a> {
    pub fn run(self, factory: &DispatchFactory) -> anyhow::Result<()> {
        self.logging.init()?;

        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

        let config = Config::load(self.config_path)?;
        apply_log_filter(&config);

        match self.mode {
            RunMode::CheckConfig => {
                tracing::info!("{} is OK", self.config_path.display());
                return Ok(());
            }
            RunMode::Stdio => crate::stdio::run_stdio(&config, factory)?,
            RunMode::Daemon => serve(self.config_path, config, factory)?,
        }

        tracing::info!("Shutdown completed OK!");
        Ok(())
    }
}

fn apply_log_filter(config: &Config) {
    if let Some(filter) = &config.server.log_filter {
        if let Err(err) = set_diagnostic_log_filter(filter) {
            tracing::error!("applying server.log_filter: {err:#}");
        }
    }
}

/// Run generations of workers until one exits without asking for a
/// restart. Each restart reloads the configuration from disk; if the
/// new one doesn't load, the previous one is used again.
pub fn serve(config_path: &Path, mut config: Config, factory: &DispatchFactory) -> anyhow::Result<()> {
    loop {
        match run_generation(&config, factory)? {
            Outcome::Exit => return Ok(()),
            Outcome::Restart => match Config::load(config_path) {
                Ok(reloaded) => {
                    tracing::info!("reloaded {}", config_path.display());
                    apply_log_filter(&reloaded);
                    config = reloaded;
                }
                Err(err) => {
                    tracing::error!("{err:#}; restarting with the previous configuration");
                }
            },
        }
    }
}

/// Bind, then serve in this process or in pre-forked children
/// depending on `server.workers`
pub fn run_generation(config: &Config, factory: &DispatchFactory) -> anyhow::Result<Outcome> {
    let listeners = bind_listeners(config)?;
    // Built before any fork so every worker presents the same
    // certificate, even a generated one
    let tls = build_tls(config)?;

    if config.server.workers == 1 {
        return run_worker(config, listeners, tls, factory, SignalBridge::install()?);
    }

    let child_main = |slot: usize, listeners: Vec<Listener>, bridge: SignalBridge| {
        tracing::debug!("worker slot {slot} is pid {}", std::process::id());
        run_worker(config, listeners, tls.clone(), factory, bridge)
    };
    let outcome = Supervisor::new(
        config.server.workers,
        config.server.shutdown_timeout,
        listeners,
        &child_main,
    )?
    .run();
    outcome
}

pub fn run_worker(
    config: &Config,
    listeners: Vec<Listener>,
    tls: Option<Arc<ServerConfig>>,
    factory: &DispatchFactory,
    bridge: SignalBridge,
) -> anyhow::Result<Outcome> {
    let accept = accept_config(config, tls.as_ref())?;
    let dispatch = factory(config, tls);
    Worker::with_bridge(
        bridge,
        listeners,
        accept,
        dispatch,
        probe_from_settings(&config.store),
        worker_timing(config),
    )?
    .run()
}

pub fn bind_listeners(config: &Config) -> anyhow::Result<Vec<Listener>> {
    let server = &config.server;
    match config.endpoints()? {
        Endpoints::Unix(path) => Ok(vec![Listener::bind_unix(&path, server.backlog)?]),
        Endpoints::Tcp(addrs) => addrs
            .into_iter()
            .map(|addr| Listener::bind_tcp(addr, server.backlog, server.reuse_port))
            .collect(),
    }
}

pub fn build_tls(config: &Config) -> anyhow::Result<Option<Arc<ServerConfig>>> {
    config
        .tls
        .as_ref()
        .map(|settings| make_server_config(settings).context("configuring TLS"))
        .transpose()
}

pub fn accept_config(
    config: &Config,
    tls: Option<&Arc<ServerConfig>>,
) -> anyhow::Result<AcceptConfig> {
    let audit: Option<Rc<dyn AuditSink>> = match (config.audit.enabled, &config.audit.path) {
        (false, _) => None,
        (true, Some(path)) => Some(Rc::new(JsonlAuditSink::open(path)?)),
        (true, None) => Some(Rc::new(TracingAuditSink)),
    };
    let implicit_tls = match (config.server.implicit_tls, tls) {
        (true, Some(tls)) => Some(Arc::clone(tls)),
        (true, None) => anyhow::bail!("server.implicit_tls requires a [tls] section"),
        (false, _) => None,
    };
    Ok(AcceptConfig {
        options: config.connection_options(),
        service: config.server.service_name.clone(),
        implicit_tls,
        audit,
    })
}

pub fn worker_timing(config: &Config) -> WorkerTiming {
    WorkerTiming {
        probe_interval: config.server.probe_interval,
        shutdown_timeout: config.server.shutdown_timeout,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn accept_config_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let config = Config::parse(&format!(
            r#"
[server]
service_name = "imap"
listen = ["127.0.0.1:0"]
implicit_tls = true
timeout = "5m"

[tls]
hostname = "mail.example.com"

[audit]
enabled = true
path = "{}"
"#,
            audit_path.display()
        ))
        .unwrap();

        let tls = build_tls(&config).unwrap();
        assert!(tls.is_some());
        let accept = accept_config(&config, tls.as_ref()).unwrap();
        assert_equal!(accept.service, "imap");
        assert!(accept.implicit_tls.is_some());
        assert!(accept.audit.is_some());
        assert_equal!(accept.options.timeout, std::time::Duration::from_secs(300));
        assert!(audit_path.exists());

        let listeners = bind_listeners(&config).unwrap();
        assert_equal!(listeners.len(), 1);
        assert!(listeners[0].local_addr().is_some());
    }

    #[test]
    fn unix_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailcore.sock");
        let config = Config::parse(&format!(
            "[server]\nsocket = \"{}\"\n",
            path.display()
        ))
        .unwrap();
        let listeners = bind_listeners(&config).unwrap();
        assert_equal!(listeners.len(), 1);
        assert!(path.exists());

        let accept = accept_config(&config, None).unwrap();
        assert!(accept.audit.is_none());
        assert!(accept.implicit_tls.is_none());
    }
}
