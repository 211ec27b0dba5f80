use crate::audit::{AuditSink, FinalStatus, LoginRecord, LoginStatus, SessionRecord};
use crate::buffer::{ConnectionBuffer, LineTooLong};
use crate::peer::PeerInfo;
use crate::tls::{HandshakeState, Step, TlsError, TlsSession, Want};
use crate::transport::{RegisteredTransport, Transport};
use chrono::{DateTime, Utc};
use mio::{Registry, Token};
use rustls::ServerConfig;
use std::io::{ErrorKind, Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Plaintext is handed to the transport (or to TLS) in segments of
/// at most this size; it matches the maximum TLS record payload.
pub const WRITE_SEGMENT: usize = 16 * 1024;
/// Size of each in-place read into the tail of the read buffer
pub const READ_CHUNK: usize = 16 * 1024;
pub const DEFAULT_MAX_LINE_SIZE: usize = 65536;

/// Outcome of the most recent I/O attempt.
/// `Error` is terminal; nothing ever clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Ok,
    Again,
    Eof,
    Error,
}

#[derive(Error, Debug)]
pub enum ConnError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("line exceeds the maximum length of {max} bytes")]
    LineTooLong { max: usize },
    #[error("connection is in the error state")]
    Errored,
    #[error("connection is closed")]
    Closed,
    #[error("TLS is already active on this connection")]
    TlsAlreadyActive,
}

impl From<LineTooLong> for ConnError {
    fn from(err: LineTooLong) -> Self {
        Self::LineTooLong { max: err.max }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    /// Number of underlying sends that moved at least one byte
    pub write_segments: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub status: FinalStatus,
    pub stats: ConnStats,
    pub duration: Duration,
}

/// An external credential exchange that is bound to a connection
/// for as long as the connection lives
pub trait AuthSession {
    fn mechanism(&self) -> &str;
    fn username(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub timeout: Duration,
    /// Applies instead of `timeout` until the connection is
    /// marked authenticated
    pub login_timeout: Option<Duration>,
    pub max_line_size: usize,
    pub resolve_ip: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            login_timeout: Some(Duration::from_secs(60)),
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            resolve_ip: false,
        }
    }
}

/// One client connection: the transport, a read and a write buffer,
/// and optionally a TLS session layered between them.
///
/// All operations are non-blocking. The owner drives I/O by calling
/// `on_readable`/`on_writable` when the transport is ready and then
/// syncing reactor interest via `update_interest`.
pub struct Connection {
    transport: Option<RegisteredTransport>,
    tls: Option<TlsSession>,
    /// Bytes at the front of `write_buf` that were queued before a
    /// STARTTLS request and still go out in the clear
    plaintext_remaining: usize,
    handshake_want: Option<Want>,
    read_buf: ConnectionBuffer,
    write_buf: ConnectionBuffer,
    state: ConnState,
    stats: ConnStats,
    peer: PeerInfo,
    options: ConnectionOptions,
    authenticated: bool,
    auth: Option<Box<dyn AuthSession>>,
    audit: Option<Rc<dyn AuditSink>>,
    service: Option<String>,
    user: Option<String>,
    login_id: Option<u64>,
    corked: bool,
    close_requested: bool,
    peer_eof: bool,
    timed_out: bool,
    started: DateTime<Utc>,
    started_instant: Instant,
    last_activity: Instant,
    closed: Option<CloseReport>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("tls", &self.tls)
            .field("stats", &self.stats)
            .field("corked", &self.corked)
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

impl Connection {
    pub fn new(transport: Transport, options: &ConnectionOptions) -> Self {
        let mut peer = PeerInfo::new(transport.peer_addr(), transport.local_addr());
        if options.resolve_ip {
            peer.resolve();
        }
        let now = Instant::now();
        Self {
            transport: Some(RegisteredTransport::new(transport)),
            tls: None,
            plaintext_remaining: 0,
            handshake_want: None,
            read_buf: ConnectionBuffer::new(),
            write_buf: ConnectionBuffer::new(),
            state: ConnState::Ok,
            stats: ConnStats::default(),
            peer,
            options: options.clone(),
            authenticated: false,
            auth: None,
            audit: None,
            service: None,
            user: None,
            login_id: None,
            corked: false,
            close_requested: false,
            peer_eof: false,
            timed_out: false,
            started: Utc::now(),
            started_instant: now,
            last_activity: now,
            closed: None,
        }
    }

    pub fn with_audit(mut self, sink: Rc<dyn AuditSink>, service: &str) -> Self {
        self.audit.replace(sink);
        self.service.replace(service.to_string());
        self
    }

    /// Encrypt from the first byte. The handshake begins on the
    /// first readable event; anything written before it completes
    /// is held until then.
    pub fn with_implicit_tls(mut self, config: Arc<ServerConfig>) -> Result<Self, ConnError> {
        self.tls.replace(TlsSession::new(config)?);
        Ok(self)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stats(&self) -> ConnStats {
        self.stats
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn tls_state(&self) -> Option<HandshakeState> {
        self.tls.as_ref().map(|t| t.state())
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn is_corked(&self) -> bool {
        self.corked
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_eof
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Number of received bytes not yet consumed by the handler
    pub fn buffered_input(&self) -> usize {
        self.read_buf.available()
    }

    /// Number of written bytes not yet handed to the transport
    pub fn pending_output(&self) -> usize {
        self.write_buf.available()
    }

    fn output_drained(&self) -> bool {
        self.write_buf.is_drained() && !self.tls.as_ref().is_some_and(|t| t.wants_write())
    }

    /// true once the owner should close this connection: after a
    /// fatal error, a timeout, or once output has drained following
    /// a peer EOF or a close request.
    pub fn should_close(&self) -> bool {
        self.closed.is_some()
            || self.state == ConnState::Error
            || ((self.peer_eof || self.close_requested) && self.output_drained())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = timeout;
    }

    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    pub fn set_auth_session(&mut self, auth: Box<dyn AuthSession>) {
        self.auth.replace(auth);
    }

    pub fn auth_session(&self) -> Option<&dyn AuthSession> {
        self.auth.as_deref()
    }

    pub fn take_auth_session(&mut self) -> Option<Box<dyn AuthSession>> {
        self.auth.take()
    }

    /// Stop all reactor interest and idle timing until `uncork`
    pub fn cork(&mut self) {
        self.corked = true;
    }

    pub fn uncork(&mut self) {
        self.corked = false;
        self.last_activity = Instant::now();
    }

    /// Ask the owner to close once pending output has drained
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// The idle timeout currently in force, or None while corked
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.corked || self.closed.is_some() {
            return None;
        }
        match self.options.login_timeout {
            Some(login) if !self.authenticated => Some(login),
            _ => Some(self.options.timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.idle_timeout().map(|t| self.last_activity + t)
    }

    /// Force the connection into the error state because it sat idle
    /// past its deadline
    pub fn mark_timed_out(&mut self) {
        tracing::debug!("{} idle for {:?}, timing out", self.peer, self.idle_for());
        self.timed_out = true;
        self.poison();
    }

    /// Force the error state, eg: because the handler failed
    pub fn abort(&mut self) {
        self.poison();
    }

    pub fn wants_read(&self) -> bool {
        if self.corked || self.peer_eof || !self.is_usable() {
            return false;
        }
        // Bytes from the peer are handshake records once an upgrade
        // has been requested; leave them in the kernel until the
        // plaintext ahead of the upgrade has gone out
        self.plaintext_remaining == 0
    }

    pub fn wants_write(&self) -> bool {
        if self.corked || !self.is_usable() {
            return false;
        }
        if self.handshake_want == Some(Want::Write) {
            return true;
        }
        if self.tls.as_ref().is_some_and(|t| t.wants_write()) {
            return true;
        }
        if self.write_buf.is_drained() {
            return false;
        }
        match self.tls_state() {
            None | Some(HandshakeState::Established) => true,
            _ => self.plaintext_remaining > 0,
        }
    }

    /// Bring the reactor registration in line with `wants_read` and
    /// `wants_write`. Re-registration also re-arms edge triggered
    /// readiness, so this is called after every dispatch.
    pub fn update_interest(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        let read = self.wants_read();
        let write = self.wants_write();
        match self.transport.as_mut() {
            Some(transport) => transport.update_interest(registry, token, read, write),
            None => Ok(()),
        }
    }

    fn is_usable(&self) -> bool {
        self.closed.is_none() && self.state != ConnState::Error
    }

    fn check_usable(&self) -> Result<(), ConnError> {
        if self.closed.is_some() {
            Err(ConnError::Closed)
        } else if self.state == ConnState::Error {
            Err(ConnError::Errored)
        } else {
            Ok(())
        }
    }

    fn poison(&mut self) {
        self.state = ConnState::Error;
        self.read_buf.clear();
        self.write_buf.clear();
        self.plaintext_remaining = 0;
        self.handshake_want = None;
    }

    fn fatal(&mut self, err: ConnError) -> ConnError {
        tracing::debug!("{}: {err:#}", self.peer);
        self.poison();
        err
    }

    /// Queue `data` and send as much of it as the transport will
    /// take right now. Whatever doesn't fit stays buffered and is
    /// sent from `on_writable`.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ConnError> {
        self.check_usable()?;
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!("S > {} {:?}", self.peer, String::from_utf8_lossy(data));
        }
        self.write_buf.append(data);
        self.flush_output()
    }

    /// Allows `write!(conn, ...)`
    pub fn write_fmt(&mut self, args: std::fmt::Arguments) -> Result<(), ConnError> {
        match args.as_str() {
            Some(s) => self.write(s.as_bytes()),
            None => self.write(args.to_string().as_bytes()),
        }
    }

    /// Called when the transport is writable: advance a pending
    /// handshake, push out TLS records and drain the write buffer
    pub fn on_writable(&mut self) -> Result<(), ConnError> {
        self.check_usable()?;
        self.flush_output()
    }

    /// Called when the transport is readable. Reads until the
    /// transport would block or reports EOF, returning the number of
    /// bytes added to the read buffer.
    pub fn on_readable(&mut self) -> Result<usize, ConnError> {
        self.check_usable()?;
        if self.plaintext_remaining > 0 {
            return Ok(0);
        }
        if self.tls.is_some() {
            if !self.drive_handshake()? {
                return Ok(0);
            }
            self.drain_encrypted()?;
        }

        let mut total = 0;
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Err(ConnError::Closed);
            };
            let buf = self.read_buf.reserve_tail(READ_CHUNK);
            let res: Result<Step<usize>, ConnError> = match self.tls.as_mut() {
                Some(tls) => tls.read(transport.get_mut(), buf).map_err(ConnError::from),
                None => match transport.get_mut().read(buf) {
                    Ok(0) => Ok(Step::Eof),
                    Ok(n) => Ok(Step::Done(n)),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(Step::Retry(Want::Read)),
                    Err(err) if err.kind() == ErrorKind::Interrupted => {
                        self.read_buf.commit_tail(READ_CHUNK, 0);
                        continue;
                    }
                    Err(err) => Err(err.into()),
                },
            };

            match res {
                Ok(Step::Done(n)) => {
                    self.read_buf.commit_tail(READ_CHUNK, n);
                    total += n;
                    self.stats.bytes_rx += n as u64;
                    self.last_activity = Instant::now();
                    self.state = ConnState::Ok;
                }
                Ok(Step::Retry(_)) => {
                    self.read_buf.commit_tail(READ_CHUNK, 0);
                    self.state = ConnState::Again;
                    break;
                }
                Ok(Step::Eof) => {
                    self.read_buf.commit_tail(READ_CHUNK, 0);
                    tracing::debug!("{} closed the connection", self.peer);
                    self.state = ConnState::Eof;
                    self.peer_eof = true;
                    break;
                }
                Err(err) => {
                    self.read_buf.commit_tail(READ_CHUNK, 0);
                    return Err(self.fatal(err));
                }
            }
        }

        if total > 0 && tracing::enabled!(tracing::Level::TRACE) {
            let pending = self.read_buf.pending();
            let recent = &pending[pending.len().saturating_sub(total)..];
            tracing::trace!("C < {} {:?}", self.peer, String::from_utf8_lossy(recent));
        }
        Ok(total)
    }

    /// Take the next complete line, terminator included.
    /// Returns `Ok(None)` if no complete line has arrived yet.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        self.check_usable()?;
        match self.read_buf.consume_line(self.options.max_line_size) {
            Ok(line) => Ok(line),
            Err(err) => Err(self.fatal(err.into())),
        }
    }

    /// Take exactly `n` bytes, or None if they haven't all arrived
    pub fn read_bytes(&mut self, n: usize) -> Result<Option<Vec<u8>>, ConnError> {
        self.check_usable()?;
        Ok(self.read_buf.consume(n))
    }

    /// Upgrade to TLS. Output queued before this call is sent in the
    /// clear, then the handshake begins. Input that has already been
    /// received but not consumed is discarded.
    pub fn start_tls(&mut self, config: Arc<ServerConfig>) -> Result<(), ConnError> {
        self.check_usable()?;
        if self.tls.is_some() {
            return Err(ConnError::TlsAlreadyActive);
        }
        let unread = self.read_buf.available();
        if unread > 0 {
            tracing::info!(
                "{} sent {unread} bytes ahead of the TLS handshake; discarding them",
                self.peer
            );
        }
        self.read_buf.clear();
        self.tls.replace(TlsSession::new(config)?);
        self.plaintext_remaining = self.write_buf.available();
        self.flush_output()
    }

    /// Record a login attempt with the audit sink, if any.
    /// A successful login also marks the connection authenticated.
    pub fn audit_login(&mut self, service: &str, user: &str, status: LoginStatus) {
        self.service.replace(service.to_string());
        if status == LoginStatus::Active {
            self.user.replace(user.to_string());
            self.authenticated = true;
        }
        let Some(audit) = &self.audit else {
            return;
        };
        let record = LoginRecord::new(service, Some(user), status, &self.peer);
        match audit.login(&record) {
            Ok(id) => {
                if status == LoginStatus::Active {
                    self.login_id = id;
                }
            }
            Err(err) => tracing::error!("failed to record login for {user}: {err:#}"),
        }
    }

    fn flush_output(&mut self) -> Result<(), ConnError> {
        if self.plaintext_remaining > 0 {
            self.drain_plain(true)?;
            if self.plaintext_remaining > 0 {
                return Ok(());
            }
        }
        if self.tls.is_none() {
            return self.drain_plain(false);
        }
        if !self.drive_handshake()? {
            return Ok(());
        }
        self.drain_encrypted()
    }

    /// Returns true once the handshake has completed
    fn drive_handshake(&mut self) -> Result<bool, ConnError> {
        let (Some(tls), Some(transport)) = (self.tls.as_mut(), self.transport.as_mut()) else {
            return Err(ConnError::Closed);
        };
        let step = match tls.state() {
            HandshakeState::Established => return Ok(true),
            HandshakeState::NotStarted => tls.start_handshake(transport.get_mut()),
            HandshakeState::InProgress | HandshakeState::Failed => {
                tls.handshake_step(transport.get_mut())
            }
        };
        match step {
            Ok(Step::Done(())) => {
                self.handshake_want = None;
                tracing::debug!(
                    "{} TLS established with {:?}",
                    self.peer,
                    tls.cipher_suite().map(|s| s.suite())
                );
                Ok(true)
            }
            Ok(Step::Retry(want)) => {
                self.handshake_want.replace(want);
                Ok(false)
            }
            Ok(Step::Eof) => Err(self.handshake_failed(TlsError::HandshakeEof)),
            Err(err) => Err(self.handshake_failed(err)),
        }
    }

    fn handshake_failed(&mut self, err: TlsError) -> ConnError {
        if let Some(transport) = &self.transport {
            transport.get_ref().shutdown().ok();
        }
        self.fatal(err.into())
    }

    /// Send plaintext straight to the transport. With `boundary` set
    /// only the bytes queued ahead of a STARTTLS request are sent.
    fn drain_plain(&mut self, boundary: bool) -> Result<(), ConnError> {
        loop {
            let mut len = self.write_buf.available().min(WRITE_SEGMENT);
            if boundary {
                len = len.min(self.plaintext_remaining);
            }
            if len == 0 {
                return Ok(());
            }
            let Some(transport) = self.transport.as_mut() else {
                return Err(ConnError::Closed);
            };
            let res = transport.get_mut().write(&self.write_buf.pending()[..len]);
            match res {
                Ok(0) => return Err(self.fatal(std::io::Error::from(ErrorKind::WriteZero).into())),
                Ok(n) => {
                    self.write_buf.advance(n);
                    self.stats.bytes_tx += n as u64;
                    self.stats.write_segments += 1;
                    if boundary {
                        self.plaintext_remaining -= n;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fatal(err.into())),
            }
        }
    }

    fn drain_encrypted(&mut self) -> Result<(), ConnError> {
        loop {
            let (Some(tls), Some(transport)) = (self.tls.as_mut(), self.transport.as_mut()) else {
                return Err(ConnError::Closed);
            };
            let flushed = tls.flush(transport.get_mut());
            match flushed {
                Ok(Step::Done(())) => {}
                Ok(_) => return Ok(()),
                Err(err) => return Err(self.fatal(err.into())),
            }

            let len = self.write_buf.available().min(WRITE_SEGMENT);
            if len == 0 {
                return Ok(());
            }
            let (Some(tls), Some(transport)) = (self.tls.as_mut(), self.transport.as_mut()) else {
                return Err(ConnError::Closed);
            };
            let res = tls.write(transport.get_mut(), &self.write_buf.pending()[..len]);
            match res {
                Ok(Step::Done(n)) => {
                    self.write_buf.advance(n);
                    self.stats.bytes_tx += n as u64;
                    self.stats.write_segments += 1;
                }
                Ok(_) => return Ok(()),
                Err(err) => return Err(self.fatal(err.into())),
            }
        }
    }

    fn final_status(&self) -> FinalStatus {
        if self.timed_out {
            FinalStatus::TimedOut
        } else if self.state == ConnState::Error {
            FinalStatus::Error
        } else if self.peer_eof {
            FinalStatus::Eof
        } else {
            FinalStatus::Closed
        }
    }

    /// Release everything the connection holds. Each step is
    /// attempted regardless of whether earlier ones failed.
    /// Closing an already closed connection returns the first
    /// report and does nothing else.
    pub fn close(&mut self, registration: Option<(&Registry, Token)>) -> CloseReport {
        if let Some(report) = &self.closed {
            return report.clone();
        }
        let status = self.final_status();

        if let (Some(transport), Some((registry, token))) = (self.transport.as_mut(), registration)
        {
            if let Err(err) = transport.deregister(registry, token) {
                tracing::debug!("{}: deregister: {err:#}", self.peer);
            }
        }

        if self.state != ConnState::Error {
            if let (Some(tls), Some(transport)) = (self.tls.as_mut(), self.transport.as_mut()) {
                if tls.is_established() {
                    tls.close(transport.get_mut());
                }
            }
        }

        if let Some(transport) = &self.transport {
            if let Err(err) = transport.get_ref().shutdown() {
                if err.kind() != ErrorKind::NotConnected {
                    tracing::debug!("{}: shutdown: {err:#}", self.peer);
                }
            }
        }

        self.tls.take();
        self.transport.take();
        self.read_buf = ConnectionBuffer::new();
        self.write_buf = ConnectionBuffer::new();
        self.plaintext_remaining = 0;
        self.auth.take();

        let report = CloseReport {
            status,
            stats: self.stats,
            duration: self.started_instant.elapsed(),
        };

        if let Some(audit) = self.audit.take() {
            let record = SessionRecord {
                login_id: self.login_id,
                service: self.service.clone(),
                user: self.user.clone(),
                peer_ip: self.peer.peer_ip(),
                peer_port: self.peer.peer_port(),
                local_ip: self.peer.local_ip(),
                local_port: self.peer.local_port(),
                resolved_name: self.peer.resolved_name.clone(),
                start_time: self.started,
                end_time: Utc::now(),
                bytes_rx: self.stats.bytes_rx,
                bytes_tx: self.stats.bytes_tx,
                status,
            };
            if let Err(err) = audit.session_closed(&record) {
                tracing::error!("failed to record session end for {}: {err:#}", self.peer);
            }
        }

        tracing::debug!(
            "closed {} status={status:?} rx={} tx={} after {:?}",
            self.peer,
            report.stats.bytes_rx,
            report.stats.bytes_tx,
            report.duration
        );
        self.closed.replace(report.clone());
        report
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed.is_none() {
            self.close(None);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Connection, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let server = mio::net::UnixStream::from_std(server);
        (
            Connection::new(Transport::Unix(server), &ConnectionOptions::default()),
            client,
        )
    }

    fn pump_until(
        conn: &mut Connection,
        mut done: impl FnMut(&mut Connection) -> bool,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(conn) {
            anyhow::ensure!(Instant::now() < deadline, "timed out");
            conn.on_writable()?;
            conn.on_readable()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    struct TestCerts {
        server: Arc<ServerConfig>,
        client: Arc<rustls::ClientConfig>,
    }

    fn test_certs() -> TestCerts {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert).unwrap();
        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        TestCerts {
            server: Arc::new(server),
            client: Arc::new(client),
        }
    }

    fn tls_client(
        config: Arc<rustls::ClientConfig>,
        sock: UnixStream,
    ) -> rustls::StreamOwned<rustls::ClientConnection, UnixStream> {
        let name = ServerName::try_from("localhost").unwrap();
        let conn = rustls::ClientConnection::new(config, name).unwrap();
        rustls::StreamOwned::new(conn, sock)
    }

    #[test]
    fn line_extraction() {
        let (mut conn, mut client) = pair();
        client.write_all(b"A\nBC\n").unwrap();
        pump_until(&mut conn, |c| c.buffered_input() == 5).unwrap();

        assert_equal!(conn.read_line().unwrap(), Some(b"A\n".to_vec()));
        assert_equal!(conn.read_line().unwrap(), Some(b"BC\n".to_vec()));
        assert_equal!(conn.read_line().unwrap(), None);
        assert_equal!(conn.stats().bytes_rx, 5);
    }

    #[test]
    fn oversized_line_forces_error() {
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let options = ConnectionOptions {
            max_line_size: 16,
            ..Default::default()
        };
        let mut conn = Connection::new(
            Transport::Unix(mio::net::UnixStream::from_std(server)),
            &options,
        );

        client.write_all(&[b'x'; 32]).unwrap();
        pump_until(&mut conn, |c| c.buffered_input() == 32).unwrap();

        assert!(matches!(
            conn.read_line(),
            Err(ConnError::LineTooLong { max: 16 })
        ));
        assert_equal!(conn.state(), ConnState::Error);
        assert_equal!(conn.buffered_input(), 0);
        assert!(matches!(conn.read_line(), Err(ConnError::Errored)));
        assert!(matches!(conn.write(b"nope"), Err(ConnError::Errored)));
        assert!(conn.should_close());
    }

    #[test]
    fn large_write_is_segmented() {
        let (mut conn, mut client) = pair();
        let payload: Vec<u8> = (0..5 * WRITE_SEGMENT + 100).map(|i| i as u8).collect();

        let reader = std::thread::spawn(move || {
            let mut received = vec![0u8; 5 * WRITE_SEGMENT + 100];
            client.read_exact(&mut received).unwrap();
            received
        });

        conn.write(&payload).unwrap();
        pump_until(&mut conn, |c| c.pending_output() == 0).unwrap();

        assert_equal!(reader.join().unwrap(), payload);
        assert!(conn.stats().write_segments >= 6);
        assert_equal!(conn.stats().bytes_tx, payload.len() as u64);
        assert_equal!(conn.write_buf.offset(), 0);
        assert_equal!(conn.write_buf.len(), 0);
        assert!(!conn.wants_write());
    }

    #[test]
    fn write_fmt_and_eof() {
        let (mut conn, mut client) = pair();
        write!(conn, "* OK {} ready\r\n", "mailcore").unwrap();
        let mut greeting = [0u8; 21];
        client.read_exact(&mut greeting).unwrap();
        assert_equal!(&greeting[..], &b"* OK mailcore ready\r\n"[..]);

        drop(client);
        pump_until(&mut conn, |c| c.peer_closed()).unwrap();
        assert_equal!(conn.state(), ConnState::Eof);
        assert!(conn.should_close());
        assert_equal!(conn.close(None).status, FinalStatus::Eof);
    }

    #[test]
    fn implicit_tls_holds_early_output() {
        let certs = test_certs();
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(
            Transport::Unix(mio::net::UnixStream::from_std(server)),
            &ConnectionOptions::default(),
        )
        .with_implicit_tls(certs.server.clone())
        .unwrap();

        // queued before the client has even said hello
        conn.write(b"* OK hello\r\n").unwrap();
        assert_equal!(conn.tls_state(), Some(HandshakeState::InProgress));
        assert_equal!(conn.stats().bytes_tx, 0);

        let client_config = certs.client.clone();
        let client = std::thread::spawn(move || {
            let mut stream = tls_client(client_config, client);
            let mut greeting = [0u8; 12];
            stream.read_exact(&mut greeting).unwrap();
            stream.write_all(b"ping\n").unwrap();
            stream.flush().unwrap();
            greeting
        });

        pump_until(&mut conn, |c| c.buffered_input() >= 5).unwrap();
        assert_equal!(conn.tls_state(), Some(HandshakeState::Established));
        assert_equal!(conn.read_line().unwrap(), Some(b"ping\n".to_vec()));
        assert_equal!(&client.join().unwrap()[..], &b"* OK hello\r\n"[..]);
    }

    #[test]
    fn starttls_discards_early_plaintext() {
        let certs = test_certs();
        let (mut conn, mut client) = pair();

        // a command smuggled in behind STARTTLS must not survive
        client.write_all(b"STARTTLS\nINJECTED\n").unwrap();
        pump_until(&mut conn, |c| c.buffered_input() == 18).unwrap();
        assert_equal!(conn.read_line().unwrap(), Some(b"STARTTLS\n".to_vec()));

        conn.write(b"OK begin TLS\n").unwrap();
        conn.start_tls(certs.server.clone()).unwrap();
        assert_equal!(conn.buffered_input(), 0);
        conn.write(b"secret\n").unwrap();
        assert!(matches!(
            conn.start_tls(certs.server.clone()),
            Err(ConnError::TlsAlreadyActive)
        ));

        let client_config = certs.client.clone();
        let client = std::thread::spawn(move || {
            let mut plain = [0u8; 13];
            client.read_exact(&mut plain).unwrap();
            let mut stream = tls_client(client_config, client);
            let mut secret = [0u8; 7];
            stream.read_exact(&mut secret).unwrap();
            stream.write_all(b"NOOP\n").unwrap();
            stream.flush().unwrap();
            (plain, secret)
        });

        pump_until(&mut conn, |c| c.buffered_input() >= 5).unwrap();
        assert_equal!(conn.read_line().unwrap(), Some(b"NOOP\n".to_vec()));

        let (plain, secret) = client.join().unwrap();
        assert_equal!(&plain[..], &b"OK begin TLS\n"[..]);
        assert_equal!(&secret[..], &b"secret\n"[..]);
    }

    fn implicit_tls_pair(certs: &TestCerts) -> (Connection, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            Transport::Unix(mio::net::UnixStream::from_std(server)),
            &ConnectionOptions::default(),
        )
        .with_implicit_tls(certs.server.clone())
        .unwrap();
        (conn, client)
    }

    fn read_until_error(conn: &mut Connection) -> ConnError {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match conn.on_readable() {
                Ok(_) => {
                    assert!(Instant::now() < deadline, "handshake never failed");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => return err,
            }
        }
    }

    #[test]
    fn garbage_handshake_is_fatal() {
        let certs = test_certs();
        let (mut conn, mut client) = implicit_tls_pair(&certs);
        conn.write(b"* OK hello\r\n").unwrap();

        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let err = read_until_error(&mut conn);
        assert!(
            matches!(err, ConnError::Tls(TlsError::Protocol(_) | TlsError::Io(_))),
            "{err:#}"
        );
        assert_equal!(conn.tls_state(), Some(HandshakeState::Failed));
        assert_equal!(conn.state(), ConnState::Error);
        assert!(conn.should_close());
        assert!(matches!(conn.read_line(), Err(ConnError::Errored)));

        let report = conn.close(None);
        assert_equal!(report.status, FinalStatus::Error);
        // the greeting queued for the encrypted session never left
        let mut rest = vec![];
        client.read_to_end(&mut rest).ok();
        assert!(!rest.windows(4).any(|w| w == b"* OK"));
    }

    #[test]
    fn eof_during_handshake_is_fatal() {
        let certs = test_certs();
        let (mut conn, client) = implicit_tls_pair(&certs);
        drop(client);

        let err = read_until_error(&mut conn);
        assert!(matches!(err, ConnError::Tls(TlsError::HandshakeEof)), "{err:#}");
        assert_equal!(conn.tls_state(), Some(HandshakeState::Failed));
        assert_equal!(conn.state(), ConnState::Error);
        assert!(conn.should_close());
        assert_equal!(conn.close(None).status, FinalStatus::Error);
    }

    #[derive(Default)]
    struct RecordingSink {
        logins: RefCell<Vec<LoginRecord>>,
        sessions: RefCell<Vec<SessionRecord>>,
    }

    impl AuditSink for RecordingSink {
        fn login(&self, record: &LoginRecord) -> anyhow::Result<Option<u64>> {
            self.logins.borrow_mut().push(record.clone());
            Ok(Some(42))
        }
        fn session_closed(&self, record: &SessionRecord) -> anyhow::Result<()> {
            self.sessions.borrow_mut().push(record.clone());
            Ok(())
        }
    }

    struct Plain;
    impl AuthSession for Plain {
        fn mechanism(&self) -> &str {
            "PLAIN"
        }
    }

    #[test]
    fn close_emits_session_record() {
        let sink = Rc::new(RecordingSink::default());
        let (conn, mut client) = pair();
        let mut conn = conn.with_audit(sink.clone(), "imap");
        conn.set_auth_session(Box::new(Plain));

        assert!(!conn.is_authenticated());
        assert_equal!(conn.idle_timeout(), Some(Duration::from_secs(60)));
        conn.audit_login("imap", "alice", LoginStatus::Active);
        assert!(conn.is_authenticated());
        assert_equal!(conn.idle_timeout(), Some(Duration::from_secs(600)));

        conn.write(b"bye\n").unwrap();
        conn.request_close();
        assert!(conn.should_close());

        let report = conn.close(None);
        assert_equal!(report.status, FinalStatus::Closed);
        assert_equal!(report.stats.bytes_tx, 4);
        assert!(conn.auth_session().is_none());
        assert!(matches!(conn.write(b"x"), Err(ConnError::Closed)));

        let sessions = sink.sessions.borrow();
        assert_equal!(sessions.len(), 1);
        assert_equal!(sessions[0].login_id, Some(42));
        assert_equal!(sessions[0].user.as_deref(), Some("alice"));
        assert_equal!(sessions[0].bytes_tx, 4);

        // a second close changes nothing
        assert_equal!(conn.close(None), report);
        assert_equal!(sink.sessions.borrow().len(), 1);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert_equal!(rest, b"bye\n".to_vec());
    }

    #[test]
    fn timeouts_follow_authentication() {
        let (mut conn, _client) = pair();
        conn.set_auth_session(Box::new(Plain));
        assert_equal!(conn.idle_timeout(), Some(Duration::from_secs(60)));

        conn.set_timeout(Duration::from_secs(5));
        // the login deadline still applies
        assert_equal!(conn.idle_timeout(), Some(Duration::from_secs(60)));
        conn.set_authenticated();
        assert_equal!(conn.idle_timeout(), Some(Duration::from_secs(5)));

        let auth = conn.take_auth_session().unwrap();
        assert_equal!(auth.mechanism(), "PLAIN");
        assert!(auth.username().is_none());
        assert!(conn.take_auth_session().is_none());
    }

    #[test]
    fn corked_holds_no_interest() {
        let (mut conn, _client) = pair();
        conn.write_buf.append(b"queued");
        assert!(conn.wants_read());
        assert!(conn.wants_write());

        conn.cork();
        assert!(!conn.wants_read());
        assert!(!conn.wants_write());
        assert_equal!(conn.deadline(), None);

        conn.uncork();
        assert!(conn.wants_read());
        assert!(conn.deadline().is_some());
    }

    #[test]
    fn drop_closes_and_audits() {
        let sink = Rc::new(RecordingSink::default());
        {
            let (conn, _client) = pair();
            let mut conn = conn.with_audit(sink.clone(), "pop3");
            conn.mark_timed_out();
        }
        let sessions = sink.sessions.borrow();
        assert_equal!(sessions.len(), 1);
        assert_equal!(sessions[0].status, FinalStatus::TimedOut);
        assert_equal!(sessions[0].service.as_deref(), Some("pop3"));
    }
}
