//! Server side TLS sessions driven over a non-blocking transport.
//!
//! rustls is a sans-io state machine; this module is the thin layer
//! that pumps ciphertext between it and the transport and reduces
//! the various `WouldBlock`/`Interrupted`/rustls error combinations
//! down to the three outcomes the connection layer cares about:
//! done, retry (with the readiness that is needed), or fatal.
use rustls::{ServerConfig, ServerConnection};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("TLS protocol error: {0}")]
    Protocol(#[from] rustls::Error),
    #[error("TLS transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection during the TLS handshake")]
    HandshakeEof,
    #[error("TLS session has already failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    InProgress,
    Established,
    Failed,
}

/// The readiness an operation is waiting on before it can make progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

/// Non-fatal outcome of a non-blocking step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    Done(T),
    Retry(Want),
    Eof,
}

pub struct TlsSession {
    conn: ServerConnection,
    state: HandshakeState,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("TlsSession")
            .field("state", &self.state)
            .finish()
    }
}

impl TlsSession {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        Ok(Self {
            conn: ServerConnection::new(config)?,
            state: HandshakeState::NotStarted,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// true if there is ciphertext queued that has not yet been
    /// handed to the transport
    pub fn wants_write(&self) -> bool {
        self.state != HandshakeState::Failed && self.conn.wants_write()
    }

    pub fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        self.conn.negotiated_cipher_suite()
    }

    pub fn start_handshake<T: Read + Write>(&mut self, io: &mut T) -> Result<Step<()>, TlsError> {
        if self.state == HandshakeState::NotStarted {
            self.state = HandshakeState::InProgress;
        }
        self.handshake_step(io)
    }

    /// Drive the handshake as far as it will go without blocking
    pub fn handshake_step<T: Read + Write>(&mut self, io: &mut T) -> Result<Step<()>, TlsError> {
        match self.state {
            HandshakeState::Established => return Ok(Step::Done(())),
            HandshakeState::Failed => return Err(TlsError::Failed),
            HandshakeState::NotStarted | HandshakeState::InProgress => {}
        }
        self.state = HandshakeState::InProgress;

        loop {
            if self.conn.wants_write() {
                match self.conn.write_tls(io) {
                    Ok(_) => continue,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        return Ok(Step::Retry(Want::Write))
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(self.fail(io, err.into())),
                }
            }

            if !self.conn.is_handshaking() {
                self.state = HandshakeState::Established;
                tracing::debug!(
                    "TLS handshake complete using {:?}",
                    self.conn.negotiated_cipher_suite().map(|s| s.suite())
                );
                return Ok(Step::Done(()));
            }

            match self.conn.read_tls(io) {
                Ok(0) => return Err(self.fail(io, TlsError::HandshakeEof)),
                Ok(_) => {
                    if let Err(err) = self.conn.process_new_packets() {
                        return Err(self.fail(io, err.into()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Step::Retry(Want::Read))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(io, err.into())),
            }
        }
    }

    /// Read decrypted application data into `buf`
    pub fn read<T: Read + Write>(
        &mut self,
        io: &mut T,
        buf: &mut [u8],
    ) -> Result<Step<usize>, TlsError> {
        if self.state == HandshakeState::Failed {
            return Err(TlsError::Failed);
        }
        let mut saw_eof = false;
        loop {
            let res = self.conn.reader().read(buf);
            match res {
                Ok(0) => return Ok(Step::Eof),
                Ok(n) => return Ok(Step::Done(n)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if saw_eof {
                        return Ok(Step::Eof);
                    }
                }
                // transport closed without a close_notify; that is
                // still the end of the stream as far as we're concerned
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(Step::Eof),
                Err(err) => return Err(self.fail(io, err.into())),
            }

            match self.conn.read_tls(io) {
                Ok(0) => saw_eof = true,
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Step::Retry(Want::Read))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(io, err.into())),
            }
            if let Err(err) = self.conn.process_new_packets() {
                return Err(self.fail(io, err.into()));
            }
            // key updates and alerts may need to go out
            if let Step::Retry(_) = self.flush(io)? {
                tracing::trace!("deferring TLS control records until writable");
            }
        }
    }

    /// Encrypt `data`, returning the number of plaintext bytes that
    /// were accepted by the session. Accepted bytes are owned by the
    /// session from that point; any ciphertext that could not be
    /// written yet remains queued and `wants_write` reports true.
    pub fn write<T: Read + Write>(
        &mut self,
        io: &mut T,
        data: &[u8],
    ) -> Result<Step<usize>, TlsError> {
        if self.state != HandshakeState::Established {
            return Err(TlsError::Failed);
        }
        if let Step::Retry(want) = self.flush(io)? {
            return Ok(Step::Retry(want));
        }
        let res = self.conn.writer().write(data);
        let n = match res {
            Ok(n) => n,
            Err(err) => return Err(self.fail(io, err.into())),
        };
        if n == 0 && !data.is_empty() {
            return Ok(Step::Retry(Want::Write));
        }
        self.flush(io)?;
        Ok(Step::Done(n))
    }

    /// Hand any queued ciphertext to the transport
    pub fn flush<T: Read + Write>(&mut self, io: &mut T) -> Result<Step<()>, TlsError> {
        while self.conn.wants_write() {
            match self.conn.write_tls(io) {
                Ok(0) => return Ok(Step::Retry(Want::Write)),
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Step::Retry(Want::Write))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fail(io, err.into())),
            }
        }
        Ok(Step::Done(()))
    }

    /// Queue a close_notify and try to get it onto the wire.
    /// This is best effort; errors are only logged.
    pub fn close<T: Read + Write>(&mut self, io: &mut T) {
        if self.state == HandshakeState::Failed {
            return;
        }
        self.conn.send_close_notify();
        if let Err(err) = self.flush(io) {
            tracing::debug!("sending TLS close_notify: {err:#}");
        }
    }

    /// Transition to Failed, making one attempt to send whatever
    /// alert rustls has queued to explain the failure to the peer
    fn fail<T: Read + Write>(&mut self, io: &mut T, err: TlsError) -> TlsError {
        tracing::debug!("TLS session failed: {err:#}");
        if self.conn.wants_write() {
            self.conn.write_tls(io).ok();
        }
        self.state = HandshakeState::Failed;
        err
    }
}
