//! Pre-fork process model: the listeners are bound once, then
//! `workers` children are forked to serve them. The parent only
//! supervises; it never accepts connections itself.
use crate::worker::{reap_children, Outcome};
use mailcore_conn::Connection;
use mailcore_reactor::{AcceptConfig, Listener, Reactor, Session, SignalBridge};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A child that exits sooner than this after being forked is
/// respawned only after the same delay, so that a worker failing at
/// startup doesn't spin.
const MIN_CHILD_LIFETIME: Duration = Duration::from_secs(1);
const TICK: Duration = Duration::from_millis(500);

/// Runs in each forked child with its slot, the inherited listeners
/// and the child's own signal bridge
pub type ChildMain<'a> =
    dyn Fn(usize, Vec<Listener>, SignalBridge) -> anyhow::Result<Outcome> + 'a;

struct Child {
    slot: usize,
    spawned: Instant,
}

pub struct Supervisor<'a> {
    workers: usize,
    shutdown_timeout: Duration,
    child_main: &'a ChildMain<'a>,
    // These are Options so that a freshly forked child can drop the
    // parent's copies before running its own worker.
    listeners: Option<Vec<Listener>>,
    reactor: Option<Reactor>,
    bridge: Option<SignalBridge>,
    children: HashMap<Pid, Child>,
    respawn: Vec<(usize, Instant)>,
    stop_deadline: Option<Instant>,
    killed: bool,
    restart: bool,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        workers: usize,
        shutdown_timeout: Duration,
        listeners: Vec<Listener>,
        child_main: &'a ChildMain<'a>,
    ) -> anyhow::Result<Self> {
        let mut bridge = SignalBridge::install()?;
        let mut reactor = Reactor::new(vec![], AcceptConfig::default())?;
        if let Some(receiver) = bridge.take_receiver() {
            reactor.set_wake(receiver)?;
        }
        Ok(Self {
            workers,
            shutdown_timeout,
            child_main,
            listeners: Some(listeners),
            reactor: Some(reactor),
            bridge: Some(bridge),
            children: HashMap::new(),
            respawn: vec![],
            stop_deadline: None,
            killed: false,
            restart: false,
        })
    }

    fn spawn(&mut self, slot: usize) -> anyhow::Result<()> {
        // SAFETY: the supervisor is single threaded; logging writes
        // synchronously and there are no helper threads to lose.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                tracing::info!("started worker {child} in slot {slot}");
                self.children.insert(
                    child,
                    Child {
                        slot,
                        spawned: Instant::now(),
                    },
                );
                Ok(())
            }
            ForkResult::Child => {
                let code = match self.run_child(slot) {
                    Ok(outcome) => {
                        tracing::debug!("worker in slot {slot} finished: {outcome:?}");
                        0
                    }
                    Err(err) => {
                        tracing::error!("worker in slot {slot} failed: {err:#}");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    fn run_child(&mut self, slot: usize) -> anyhow::Result<Outcome> {
        // The child's handlers go in before the inherited ones come
        // out, so every signal lands on one bridge or the other
        let bridge = SignalBridge::install()?;
        if let Some(inherited) = self.bridge.take() {
            if inherited.take().stop {
                bridge.request_stop();
            }
        }
        self.reactor.take();
        self.children.clear();
        let listeners = self.listeners.take().unwrap_or_default();
        (self.child_main)(slot, listeners, bridge)
    }

    pub fn run(mut self) -> anyhow::Result<Outcome> {
        tracing::info!("supervisor {} starting {} workers", std::process::id(), self.workers);
        for slot in 0..self.workers {
            self.spawn(slot)?;
        }

        loop {
            if let Some(reactor) = self.reactor.as_mut() {
                let mut no_sessions =
                    |_: &mut Connection| -> anyhow::Result<Box<dyn Session>> {
                        anyhow::bail!("the supervisor does not serve connections")
                    };
                reactor.turn(&mut no_sessions, Some(TICK))?;
            }

            let flags = match &self.bridge {
                Some(bridge) => bridge.take(),
                None => Default::default(),
            };

            // SIGCHLD can coalesce, so reap on every tick regardless
            self.reap();

            if flags.status {
                self.log_status();
            }
            if flags.stop {
                self.restart = false;
                if self.stop_deadline.is_some() {
                    tracing::info!("second stop request; killing workers");
                    self.signal_children(Signal::SIGKILL);
                    self.killed = true;
                } else {
                    self.begin_stop("stop requested");
                }
            } else if flags.restart {
                self.restart = true;
                self.begin_stop("restart requested");
            }

            match self.stop_deadline {
                Some(deadline) => {
                    if self.children.is_empty() {
                        tracing::info!("all workers have exited");
                        return Ok(if self.restart {
                            Outcome::Restart
                        } else {
                            Outcome::Exit
                        });
                    }
                    if !self.killed && Instant::now() >= deadline {
                        tracing::warn!(
                            "shutdown_timeout elapsed with {} workers running; killing them",
                            self.children.len()
                        );
                        self.signal_children(Signal::SIGKILL);
                        self.killed = true;
                    }
                }
                None => self.respawn_due()?,
            }
        }
    }

    fn reap(&mut self) {
        for (pid, status) in reap_children() {
            let Some(child) = self.children.remove(&pid) else {
                continue;
            };
            match status {
                WaitStatus::Exited(_, 0) => {
                    tracing::info!("worker {pid} in slot {} exited", child.slot)
                }
                status => tracing::error!(
                    "worker {pid} in slot {} terminated: {status:?}",
                    child.slot
                ),
            }
            if self.stop_deadline.is_none() {
                let lived = child.spawned.elapsed();
                let delay = MIN_CHILD_LIFETIME.saturating_sub(lived);
                self.respawn.push((child.slot, Instant::now() + delay));
            }
        }
    }

    fn respawn_due(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) =
            self.respawn.drain(..).partition(|(_, when)| *when <= now);
        self.respawn = later;
        for (slot, _) in due {
            self.spawn(slot)?;
        }
        Ok(())
    }

    fn begin_stop(&mut self, reason: &str) {
        if self.stop_deadline.is_some() {
            return;
        }
        tracing::info!("{reason}; stopping {} workers", self.children.len());
        self.respawn.clear();
        self.stop_deadline = Some(Instant::now() + self.shutdown_timeout);
        self.signal_children(Signal::SIGTERM);
    }

    fn signal_children(&self, signal: Signal) {
        for pid in self.children.keys() {
            if let Err(err) = kill(*pid, signal) {
                tracing::error!("sending {signal} to worker {pid}: {err:#}");
            }
        }
    }

    fn log_status(&self) {
        tracing::info!(
            "status: supervisor pid={} workers={} stopping={}",
            std::process::id(),
            self.children.len(),
            self.stop_deadline.is_some()
        );
        let mut children: Vec<_> = self.children.iter().collect();
        children.sort_by_key(|(_, child)| child.slot);
        for (pid, child) in children {
            tracing::info!(
                "  slot {} pid {pid} up {}",
                child.slot,
                humantime::format_duration(Duration::from_secs(child.spawned.elapsed().as_secs()))
            );
        }
    }
}

impl Drop for Supervisor<'_> {
    fn drop(&mut self) {
        // Never leave workers orphaned on an error path
        if !self.children.is_empty() {
            self.signal_children(Signal::SIGKILL);
            reap_children();
        }
    }
}
