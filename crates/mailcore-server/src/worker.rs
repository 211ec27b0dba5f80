//! The per-process serving state machine:
//! `Starting -> Serving -> Draining -> Stopped`.
use crate::store::StoreProbe;
use mailcore_reactor::{AcceptConfig, Dispatch, Listener, Reactor, SignalBridge, SignalFlags};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// What the caller should do once the worker has stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exit,
    /// Reload configuration and start over
    Restart,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    pub probe_interval: Duration,
    /// How long a drain may take before remaining connections are
    /// closed regardless
    pub shutdown_timeout: Duration,
}

pub struct Worker {
    reactor: Reactor,
    bridge: SignalBridge,
    dispatch: Box<dyn Dispatch>,
    probe: Box<dyn StoreProbe>,
    timing: WorkerTiming,
    state: WorkerState,
    restart: bool,
    next_probe: Instant,
    drain_deadline: Option<Instant>,
    started: Instant,
}

impl Worker {
    pub fn new(
        listeners: Vec<Listener>,
        accept: AcceptConfig,
        dispatch: Box<dyn Dispatch>,
        probe: Box<dyn StoreProbe>,
        timing: WorkerTiming,
    ) -> anyhow::Result<Self> {
        let bridge = SignalBridge::install()?;
        Self::with_bridge(bridge, listeners, accept, dispatch, probe, timing)
    }

    /// Like `new`, but with signal handling that the caller has
    /// already put in place
    pub fn with_bridge(
        mut bridge: SignalBridge,
        listeners: Vec<Listener>,
        accept: AcceptConfig,
        dispatch: Box<dyn Dispatch>,
        probe: Box<dyn StoreProbe>,
        timing: WorkerTiming,
    ) -> anyhow::Result<Self> {
        tracing::debug!("worker {} starting", std::process::id());
        let mut reactor = Reactor::new(listeners, accept)?;
        if let Some(receiver) = bridge.take_receiver() {
            reactor.set_wake(receiver)?;
        }
        let now = Instant::now();
        let mut worker = Self {
            reactor,
            bridge,
            dispatch,
            probe,
            timing,
            state: WorkerState::Starting,
            restart: false,
            next_probe: now + timing.probe_interval,
            drain_deadline: None,
            started: now,
        };
        worker.set_state(WorkerState::Serving);
        tracing::info!(
            "serving on {}",
            worker.reactor.listener_addrs().join(", ")
        );
        Ok(worker)
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn bridge(&self) -> &SignalBridge {
        &self.bridge
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Take on a connection that did not come from a listener,
    /// eg: one attached to stdio
    pub fn adopt(&mut self, conn: mailcore_conn::Connection) -> anyhow::Result<()> {
        self.reactor.adopt(conn, self.dispatch.as_mut())?;
        Ok(())
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            tracing::debug!("worker state {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    /// How long the reactor may sleep before the worker has something
    /// of its own to do. Connection deadlines are the reactor's concern.
    fn next_wait(&self) -> Option<Duration> {
        let now = Instant::now();
        match self.state {
            WorkerState::Serving => Some(self.next_probe.saturating_duration_since(now)),
            _ => self
                .drain_deadline
                .map(|deadline| deadline.saturating_duration_since(now)),
        }
    }

    /// Run until stopped
    pub fn run(mut self) -> anyhow::Result<Outcome> {
        loop {
            if let Some(outcome) = self.turn()? {
                return Ok(outcome);
            }
        }
    }

    /// One reactor turn followed by the post-dispatch checks.
    /// Returns the outcome once the worker has stopped.
    pub fn turn(&mut self) -> anyhow::Result<Option<Outcome>> {
        if self.state == WorkerState::Stopped {
            return Ok(Some(self.outcome()));
        }

        let wait = self.next_wait();
        self.reactor.turn(self.dispatch.as_mut(), wait)?;

        let flags = self.bridge.take();
        if flags.any() {
            self.handle_signals(flags);
        }

        if self.state == WorkerState::Serving && Instant::now() >= self.next_probe {
            self.probe_store();
        }

        if self.state == WorkerState::Draining {
            if self.reactor.connection_count() == 0 {
                tracing::info!("drain complete");
                self.set_state(WorkerState::Stopped);
            } else if self
                .drain_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
            {
                tracing::warn!(
                    "shutdown_timeout elapsed with {} connections open",
                    self.reactor.connection_count()
                );
                self.force_stop();
            }
        }

        if self.state == WorkerState::Stopped {
            return Ok(Some(self.outcome()));
        }
        Ok(None)
    }

    fn outcome(&self) -> Outcome {
        if self.restart {
            Outcome::Restart
        } else {
            Outcome::Exit
        }
    }

    fn handle_signals(&mut self, flags: SignalFlags) {
        if flags.child_exited {
            reap_children();
        }
        if flags.status {
            self.log_status();
        }
        if flags.alarm && self.state == WorkerState::Serving {
            self.probe_store();
        }
        if flags.stop {
            self.restart = false;
            if self.state == WorkerState::Draining {
                tracing::info!("second stop request while draining; stopping now");
                self.force_stop();
            } else {
                self.begin_drain("stop requested");
            }
        } else if flags.restart {
            self.restart = true;
            self.begin_drain("restart requested");
        }
    }

    fn probe_store(&mut self) {
        self.next_probe = Instant::now() + self.timing.probe_interval;
        if !self.probe.is_reachable() {
            tracing::error!("store is unreachable");
            self.begin_drain("store unreachable");
        }
    }

    fn begin_drain(&mut self, reason: &str) {
        if self.state != WorkerState::Serving {
            return;
        }
        tracing::info!(
            "{reason}; draining {} connections",
            self.reactor.connection_count()
        );
        self.reactor.stop_accepting();
        self.drain_deadline = Some(Instant::now() + self.timing.shutdown_timeout);
        self.set_state(WorkerState::Draining);
    }

    fn force_stop(&mut self) {
        let closed = self.reactor.close_all();
        if closed > 0 {
            tracing::info!("closed {closed} connections");
        }
        self.set_state(WorkerState::Stopped);
    }

    pub fn log_status(&self) {
        tracing::info!(
            "status: pid={} state={:?} uptime={} listeners=[{}] connections={}",
            std::process::id(),
            self.state,
            humantime::format_duration(Duration::from_secs(self.started.elapsed().as_secs())),
            self.reactor.listener_addrs().join(", "),
            self.reactor.connection_count()
        );
        for conn in self.reactor.connections() {
            let stats = conn.stats();
            tracing::info!(
                "  {} rx={} tx={} idle={:?} tls={:?}",
                conn.peer(),
                stats.bytes_rx,
                stats.bytes_tx,
                conn.idle_for(),
                conn.tls_state()
            );
        }
    }
}

/// Collect every exited child without blocking
pub fn reap_children() -> Vec<(Pid, WaitStatus)> {
    let mut reaped = vec![];
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                let Some(pid) = status.pid() else {
                    break;
                };
                tracing::debug!("reaped child {pid}: {status:?}");
                reaped.push((pid, status));
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => break,
            Err(err) => {
                tracing::error!("waitpid: {err:#}");
                break;
            }
        }
    }
    reaped
}

#[cfg(test)]
mod test {
    use super::*;
    use std::process::Command;

    #[test]
    fn reaps_exited_children() {
        let child = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let reaped = reap_children();
            if reaped.iter().any(|(p, _)| *p == pid) {
                break;
            }
            assert!(Instant::now() < deadline, "child was never reaped");
            std::thread::sleep(Duration::from_millis(10));
        }
        // nothing left to collect
        assert!(reap_children().iter().all(|(p, _)| *p != pid));
    }
}
