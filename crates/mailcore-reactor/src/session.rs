use mailcore_conn::{AuditSink, CloseReport, ConnError, Connection, ConnectionOptions, Transport};
use rustls::ServerConfig;
use std::rc::Rc;
use std::sync::Arc;

/// Protocol handler state for one connection.
///
/// Callbacks run on the reactor thread, one at a time, and must not
/// block. Returning an error marks the connection as failed and it
/// is closed before the reactor moves on.
pub trait Session {
    /// New bytes are available in the connection's read buffer
    fn on_data(&mut self, conn: &mut Connection) -> anyhow::Result<()>;

    /// The peer closed its side. Called at most once, after any
    /// final `on_data`.
    fn on_eof(&mut self, _conn: &mut Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// The idle deadline passed. The connection is closed as soon as
    /// this returns; a final write is attempted but not guaranteed.
    fn on_timeout(&mut self, _conn: &mut Connection) {}

    fn on_closed(&mut self, _report: &CloseReport) {}
}

/// Hands each newly accepted connection to a protocol handler
pub trait Dispatch {
    fn dispatch(&mut self, conn: &mut Connection) -> anyhow::Result<Box<dyn Session>>;
}

impl<F> Dispatch for F
where
    F: FnMut(&mut Connection) -> anyhow::Result<Box<dyn Session>>,
{
    fn dispatch(&mut self, conn: &mut Connection) -> anyhow::Result<Box<dyn Session>> {
        (self)(conn)
    }
}

/// How the reactor constructs connections for accepted transports
#[derive(Clone, Default)]
pub struct AcceptConfig {
    pub options: ConnectionOptions,
    pub service: String,
    pub implicit_tls: Option<Arc<ServerConfig>>,
    pub audit: Option<Rc<dyn AuditSink>>,
}

impl std::fmt::Debug for AcceptConfig {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("AcceptConfig")
            .field("options", &self.options)
            .field("service", &self.service)
            .field("implicit_tls", &self.implicit_tls.is_some())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl AcceptConfig {
    pub fn build(&self, transport: Transport) -> Result<Connection, ConnError> {
        let mut conn = Connection::new(transport, &self.options);
        if let Some(audit) = &self.audit {
            conn = conn.with_audit(Rc::clone(audit), &self.service);
        }
        if let Some(tls) = &self.implicit_tls {
            conn = conn.with_implicit_tls(Arc::clone(tls))?;
        }
        Ok(conn)
    }
}
