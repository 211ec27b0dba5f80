//! Turns asynchronous signals into flags that the event loop reads
//! at a point of its choosing.
//!
//! The handlers installed here do exactly two async-signal-safe
//! things: store `true` into an atomic flag and write a byte to a
//! non-blocking pipe. The read end of that pipe is registered with
//! the reactor so that a signal always produces one more turn of
//! the loop, at which point the owner calls `take` and acts on
//! whatever has been raised.
use mio::unix::pipe;
use signal_hook::consts::signal::{SIGALRM, SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use signal_hook::SigId;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Snapshot of the signals raised since the previous `take`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalFlags {
    pub stop: bool,
    pub restart: bool,
    pub status: bool,
    pub alarm: bool,
    pub child_exited: bool,
}

impl SignalFlags {
    pub fn any(&self) -> bool {
        self.stop || self.restart || self.status || self.alarm || self.child_exited
    }
}

#[derive(Debug, Default)]
struct Flags {
    stop: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
    status: Arc<AtomicBool>,
    alarm: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
}

impl Flags {
    fn for_signal(&self, signal: i32) -> &Arc<AtomicBool> {
        match signal {
            SIGHUP => &self.restart,
            SIGUSR1 => &self.status,
            SIGALRM => &self.alarm,
            SIGCHLD => &self.child_exited,
            _ => &self.stop,
        }
    }
}

/// SIGSEGV and friends are deliberately absent and keep their
/// default disposition. SIGPIPE is already ignored by the Rust
/// runtime, so a vanished peer shows up as EPIPE on its connection.
pub const HANDLED_SIGNALS: &[i32] = &[SIGTERM, SIGINT, SIGQUIT, SIGHUP, SIGUSR1, SIGALRM, SIGCHLD];

#[derive(Debug)]
pub struct SignalBridge {
    flags: Flags,
    ids: Vec<SigId>,
    sender: pipe::Sender,
    receiver: Option<pipe::Receiver>,
}

impl SignalBridge {
    pub fn install() -> std::io::Result<Self> {
        let (sender, receiver) = pipe::new()?;
        let flags = Flags::default();
        let mut bridge = Self {
            flags,
            ids: vec![],
            sender,
            receiver: Some(receiver),
        };

        for &signal in HANDLED_SIGNALS {
            // flag first, so that by the time the wake byte can be
            // observed the flag is already set
            let flag = Arc::clone(bridge.flags.for_signal(signal));
            bridge.ids.push(signal_hook::flag::register(signal, flag)?);
            bridge.ids.push(signal_hook::low_level::pipe::register_raw(
                signal,
                bridge.sender.as_raw_fd(),
            )?);
        }
        tracing::debug!("installed handlers for {} signals", HANDLED_SIGNALS.len());

        Ok(bridge)
    }

    /// The read end of the self-pipe, for registration with the
    /// reactor. Can be taken once.
    pub fn take_receiver(&mut self) -> Option<pipe::Receiver> {
        self.receiver.take()
    }

    /// Read and clear every flag
    pub fn take(&self) -> SignalFlags {
        SignalFlags {
            stop: self.flags.stop.swap(false, Ordering::SeqCst),
            restart: self.flags.restart.swap(false, Ordering::SeqCst),
            status: self.flags.status.swap(false, Ordering::SeqCst),
            alarm: self.flags.alarm.swap(false, Ordering::SeqCst),
            child_exited: self.flags.child_exited.swap(false, Ordering::SeqCst),
        }
    }

    pub fn request_stop(&self) {
        self.raise_flag(&self.flags.stop);
    }

    pub fn request_restart(&self) {
        self.raise_flag(&self.flags.restart);
    }

    pub fn request_status(&self) {
        self.raise_flag(&self.flags.status);
    }

    fn raise_flag(&self, flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
        match (&self.sender).write(&[0]) {
            Ok(_) => {}
            // a full pipe already guarantees a wakeup
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => tracing::error!("writing to signal pipe: {err:#}"),
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Empty the self-pipe so that its next readiness edge corresponds
/// to a new signal
pub fn drain_wake_pipe(receiver: &mut pipe::Receiver) -> usize {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        match receiver.read(&mut buf) {
            Ok(0) => return total,
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return total,
            Err(err) => {
                tracing::error!("reading signal pipe: {err:#}");
                return total;
            }
        }
    }
}
