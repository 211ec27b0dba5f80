use clap::Parser;
use mailcore_server::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use mailcore_server::echo;
use mailcore_server::start::{RunMode, StartConfig};
use std::path::PathBuf;

/// mailcore: transport and process core for a mail server.
///
/// This binary serves a line echo protocol with STARTTLS support.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file to load.
    #[arg(long, default_value = "/etc/mailcore/mailcored.toml")]
    config: PathBuf,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Serve a single connection on stdin and stdout instead of
    /// listening on the configured endpoints
    #[arg(long)]
    stdio: bool,

    /// Load and validate the configuration, then exit
    #[arg(long, conflicts_with = "stdio")]
    check_config: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    mailcore_server::panic::register_panic_hook();

    let mode = if opts.check_config {
        RunMode::CheckConfig
    } else if opts.stdio {
        RunMode::Stdio
    } else {
        RunMode::Daemon
    };

    StartConfig {
        logging: LoggingConfig {
            log_dir: opts.diag_log_dir.clone(),
            diag_format: opts.diag_format,
            filter_env_var: "MAILCORED_LOG",
            default_filter: "mailcored=info,mailcore_server=info,mailcore_reactor=info,mailcore_conn=info,audit=info",
        },
        config_path: &opts.config,
        mode,
    }
    .run(&echo::factory)
}
