//! Buffered, non-blocking per-connection I/O with an optional TLS
//! layer that can be present from the first byte or negotiated
//! part way through a plaintext session.
pub mod audit;
pub mod buffer;
pub mod connection;
pub mod peer;
pub mod tls;
pub mod transport;

pub use audit::{AuditSink, FinalStatus, JsonlAuditSink, LoginStatus, TracingAuditSink};
pub use buffer::{ConnectionBuffer, LineTooLong};
pub use connection::{
    AuthSession, CloseReport, ConnError, ConnState, ConnStats, Connection, ConnectionOptions,
};
pub use peer::PeerInfo;
pub use tls::{HandshakeState, TlsError};
pub use transport::Transport;
