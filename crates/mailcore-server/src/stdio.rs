//! Serve exactly one connection on the process' stdin and stdout,
//! eg: when spawned by inetd or run from a terminal.
use crate::config::Config;
use crate::start::{accept_config, build_tls, worker_timing, DispatchFactory};
use crate::store::probe_from_settings;
use crate::worker::{Outcome, Worker};
use mailcore_conn::Transport;

pub fn run_stdio(config: &Config, factory: &DispatchFactory) -> anyhow::Result<()> {
    let tls = build_tls(config)?;
    let accept = accept_config(config, tls.as_ref())?;
    let conn = accept.build(Transport::stdio()?)?;

    let mut worker = Worker::new(
        vec![],
        accept,
        factory(config, tls),
        probe_from_settings(&config.store),
        worker_timing(config),
    )?;
    worker.adopt(conn)?;
    serve_until_closed(&mut worker)
}

/// Turn the worker until its connections have all closed, or the
/// worker stops for some other reason
pub fn serve_until_closed(worker: &mut Worker) -> anyhow::Result<()> {
    while worker.reactor().connection_count() > 0 {
        if let Some(outcome) = worker.turn()? {
            // there is nothing to restart with a single connection
            if outcome == Outcome::Restart {
                tracing::info!("ignoring restart request in stdio mode");
            }
            break;
        }
    }
    Ok(())
}
