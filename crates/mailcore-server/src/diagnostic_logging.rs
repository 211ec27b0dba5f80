use anyhow::Context;
use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

// The reload handle has a type that depends on every layer composed
// beneath it, so rather than naming it we stash a closure that has
// captured it.
static TRACING_FILTER_RELOAD_HANDLE: OnceLock<
    Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>,
> = OnceLock::new();

pub fn set_diagnostic_log_filter(new_filter: &str) -> anyhow::Result<()> {
    let func = TRACING_FILTER_RELOAD_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("unable to retrieve filter reload handle"))?;
    (func)(new_filter)
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl LoggingConfig<'_> {
    pub fn init(&self) -> anyhow::Result<()> {
        // Workers are forked from the process that sets this up, so
        // log files are written synchronously rather than through a
        // background thread that the children would not inherit.
        let log_writer = match &self.log_dir {
            Some(log_dir) => BoxMakeWriter::new(tracing_appender::rolling::hourly(log_dir, "log")),
            None => BoxMakeWriter::new(std::io::stderr),
        };

        let layer = fmt::layer().with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let env_filter = EnvFilter::try_new(
            std::env::var(self.filter_env_var)
                .as_deref()
                .unwrap_or(self.default_filter),
        )?;
        let (env_filter, reload_handle) = tracing_subscriber::reload::Layer::new(env_filter);
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .try_init()
            .context("installing the tracing subscriber")?;

        TRACING_FILTER_RELOAD_HANDLE
            .set(Box::new(move |new_filter: &str| {
                let f = EnvFilter::try_new(new_filter)
                    .with_context(|| format!("parsing log filter '{new_filter}'"))?;
                reload_handle.reload(f).context("applying new log filter")
            }))
            .map_err(|_| anyhow::anyhow!("failed to assign reloadable logging filter"))?;

        Ok(())
    }
}
