use crate::listener::{is_transient_accept_error, Listener};
use crate::session::{AcceptConfig, Dispatch, Session};
use crate::signals::drain_wake_pipe;
use mailcore_conn::{CloseReport, Connection};
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Readiness of the signal self-pipe
pub const WAKE: Token = Token(0);
const LISTENER_BASE: usize = 1;
const CONNECTION_BASE: usize = 1 << 20;
const EVENT_CAPACITY: usize = 1024;

struct Entry {
    conn: Connection,
    session: Option<Box<dyn Session>>,
}

/// What happened during one turn of the loop
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TurnReport {
    pub events: usize,
    pub woken: bool,
    pub accepted: usize,
    pub closed: usize,
    pub timed_out: usize,
}

/// Single threaded, readiness driven multiplexer for listeners and
/// connections.
///
/// Each call to `turn` waits for readiness (or the nearest idle
/// deadline), services every ready source exactly once and expires
/// idle connections. Callbacks for different connections never
/// overlap.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listeners: Vec<Listener>,
    accepting: bool,
    wake: Option<pipe::Receiver>,
    connections: HashMap<Token, Entry>,
    next_token: usize,
    accept: AcceptConfig,
}

impl Reactor {
    pub fn new(mut listeners: Vec<Listener>, accept: AcceptConfig) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        for (idx, listener) in listeners.iter_mut().enumerate() {
            listener.register(poll.registry(), Token(LISTENER_BASE + idx))?;
        }
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listeners,
            accepting: true,
            wake: None,
            connections: HashMap::new(),
            next_token: CONNECTION_BASE,
            accept,
        })
    }

    /// Register the read end of a self-pipe as the wake source
    pub fn set_wake(&mut self, mut receiver: pipe::Receiver) -> std::io::Result<()> {
        self.poll
            .registry()
            .register(&mut receiver, WAKE, Interest::READABLE)?;
        if let Some(mut previous) = self.wake.replace(receiver) {
            self.poll.registry().deregister(&mut previous).ok();
        }
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Remove listener interest; established connections carry on
    pub fn stop_accepting(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        for listener in &mut self.listeners {
            if let Err(err) = listener.deregister(self.poll.registry()) {
                tracing::error!("deregistering listener {}: {err:#}", listener.describe());
            }
        }
    }

    pub fn listener_addrs(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.describe()).collect()
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().map(|e| &e.conn)
    }

    /// Apply `func` to a connection from outside of its own callbacks,
    /// for example to uncork it, then re-sync its interest
    pub fn with_connection<R>(
        &mut self,
        token: Token,
        func: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let entry = self.connections.get_mut(&token)?;
        let result = func(&mut entry.conn);
        let mut report = TurnReport::default();
        self.settle(token, &mut report);
        Some(result)
    }

    /// Take ownership of a connection that was not produced by one of
    /// our listeners (eg: one attached to stdio) and dispatch it
    pub fn adopt(
        &mut self,
        mut conn: Connection,
        dispatch: &mut dyn Dispatch,
    ) -> anyhow::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;

        let session = match dispatch.dispatch(&mut conn) {
            Ok(session) => session,
            Err(err) => {
                conn.abort();
                conn.close(None);
                return Err(err.context(format!("dispatching connection from {}", conn.peer())));
            }
        };
        self.connections.insert(
            token,
            Entry {
                conn,
                session: Some(session),
            },
        );
        let mut report = TurnReport::default();
        self.settle(token, &mut report);
        Ok(token)
    }

    /// Close every connection immediately
    pub fn close_all(&mut self) -> usize {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        let mut report = TurnReport::default();
        for token in tokens {
            self.finish(token, &mut report);
        }
        report.closed
    }

    fn next_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let now = Instant::now();
        let nearest = self
            .connections
            .values()
            .filter_map(|e| e.conn.deadline())
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));
        match (nearest, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Wait for and service one batch of events. `max_wait` bounds
    /// the wait on top of the nearest idle deadline; None waits until
    /// something happens.
    pub fn turn(
        &mut self,
        dispatch: &mut dyn Dispatch,
        max_wait: Option<Duration>,
    ) -> std::io::Result<TurnReport> {
        let mut report = TurnReport::default();
        let timeout = self.next_timeout(max_wait);

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                (event.token(), readable, writable)
            })
            .collect();
        report.events = ready.len();

        for (token, readable, writable) in ready {
            if token == WAKE {
                if let Some(receiver) = self.wake.as_mut() {
                    drain_wake_pipe(receiver);
                }
                report.woken = true;
            } else if token.0 < CONNECTION_BASE {
                self.accept_one(token, dispatch, &mut report);
            } else {
                self.service(token, readable, writable, &mut report);
            }
        }

        self.expire_idle(&mut report);
        Ok(report)
    }

    /// Accept a single connection from the listener behind `token`,
    /// then re-arm it so that any backlog produces a fresh event
    fn accept_one(&mut self, token: Token, dispatch: &mut dyn Dispatch, report: &mut TurnReport) {
        if !self.accepting {
            return;
        }
        let Some(listener) = self.listeners.get_mut(token.0 - LISTENER_BASE) else {
            return;
        };
        let accepted = listener.accept();
        if let Err(err) = listener.reregister(self.poll.registry(), token) {
            tracing::error!("re-arming listener {}: {err:#}", listener.describe());
        }

        let transport = match accepted {
            Ok(transport) => transport,
            Err(err) if is_transient_accept_error(&err) => {
                tracing::debug!("accept: {err:#}");
                return;
            }
            Err(err) => {
                tracing::error!("accept failed on {}: {err:#}", listener.describe());
                return;
            }
        };

        let conn = match self.accept.build(transport) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!("setting up accepted connection: {err:#}");
                return;
            }
        };
        tracing::info!("new connection from {}", conn.peer());
        match self.adopt(conn, dispatch) {
            Ok(_) => report.accepted += 1,
            Err(err) => tracing::error!("{err:#}"),
        }
    }

    fn service(&mut self, token: Token, readable: bool, writable: bool, report: &mut TurnReport) {
        // events for a connection closed earlier in this turn
        let Some(Entry { conn, session }) = self.connections.get_mut(&token) else {
            return;
        };
        let Some(session) = session.as_mut() else {
            return;
        };

        if writable && !conn.should_close() {
            if let Err(err) = conn.on_writable() {
                tracing::debug!("{}: write failed: {err:#}", conn.peer());
            }
        }

        if readable && !conn.should_close() {
            let had_eof = conn.peer_closed();
            match conn.on_readable() {
                Ok(n) => {
                    if n > 0 {
                        if let Err(err) = session.on_data(conn) {
                            tracing::error!("{}: session error: {err:#}", conn.peer());
                            conn.abort();
                        }
                    }
                    if conn.peer_closed() && !had_eof && !conn.is_closed() {
                        if let Err(err) = session.on_eof(conn) {
                            tracing::error!("{}: session error at EOF: {err:#}", conn.peer());
                            conn.abort();
                        }
                    }
                }
                Err(err) => tracing::debug!("{}: read failed: {err:#}", conn.peer()),
            }
        }

        self.settle(token, report);
    }

    /// Close the connection if it is finished, otherwise bring its
    /// reactor interest up to date
    fn settle(&mut self, token: Token, report: &mut TurnReport) {
        let Some(entry) = self.connections.get_mut(&token) else {
            return;
        };
        if entry.conn.should_close() {
            self.finish(token, report);
            return;
        }
        if let Err(err) = entry.conn.update_interest(self.poll.registry(), token) {
            tracing::error!("{}: updating interest: {err:#}", entry.conn.peer());
            entry.conn.abort();
            self.finish(token, report);
        }
    }

    fn finish(&mut self, token: Token, report: &mut TurnReport) -> Option<CloseReport> {
        let mut entry = self.connections.remove(&token)?;
        let close = entry.conn.close(Some((self.poll.registry(), token)));
        if let Some(mut session) = entry.session.take() {
            session.on_closed(&close);
        }
        report.closed += 1;
        Some(close)
    }

    fn expire_idle(&mut self, report: &mut TurnReport) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, e)| e.conn.deadline().is_some_and(|d| d <= now))
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(Entry { conn, session }) = self.connections.get_mut(&token) {
                if let Some(session) = session.as_mut() {
                    session.on_timeout(conn);
                }
                conn.mark_timed_out();
            }
            report.timed_out += 1;
            self.finish(token, report);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let remaining = self.close_all();
        if remaining > 0 {
            tracing::debug!("closed {remaining} connections while dropping the reactor");
        }
    }
}
