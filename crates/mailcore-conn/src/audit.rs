//! Best-effort login and session records.
//!
//! Recording failures are reported to the caller, who is expected
//! to log and carry on; an audit sink going away must never take
//! a connection (let alone the process) down with it.
use crate::peer::PeerInfo;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Active,
    Failed,
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// Closed by us, typically at the request of the session
    Closed,
    /// The peer closed its end
    Eof,
    /// A fatal local error: transport, TLS or protocol abuse
    Error,
    /// No activity within the idle timeout
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRecord {
    pub service: String,
    pub user: Option<String>,
    pub status: LoginStatus,
    pub peer_ip: Option<String>,
    pub peer_port: Option<u16>,
    pub local_ip: Option<String>,
    pub local_port: Option<u16>,
    pub resolved_name: Option<String>,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub login_id: Option<u64>,
    pub service: Option<String>,
    pub user: Option<String>,
    pub peer_ip: Option<String>,
    pub peer_port: Option<u16>,
    pub local_ip: Option<String>,
    pub local_port: Option<u16>,
    pub resolved_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub status: FinalStatus,
}

impl LoginRecord {
    pub fn new(service: &str, user: Option<&str>, status: LoginStatus, peer: &PeerInfo) -> Self {
        Self {
            service: service.to_string(),
            user: user.map(|u| u.to_string()),
            status,
            peer_ip: peer.peer_ip(),
            peer_port: peer.peer_port(),
            local_ip: peer.local_ip(),
            local_port: peer.local_port(),
            resolved_name: peer.resolved_name.clone(),
            login_time: Utc::now(),
        }
    }
}

pub trait AuditSink {
    /// Record a login attempt. An active login may be assigned an
    /// id that the eventual session record refers back to.
    fn login(&self, record: &LoginRecord) -> anyhow::Result<Option<u64>>;

    fn session_closed(&self, record: &SessionRecord) -> anyhow::Result<()>;
}

/// Emits records as structured tracing events on the `audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn login(&self, record: &LoginRecord) -> anyhow::Result<Option<u64>> {
        tracing::info!(
            target: "audit",
            service = %record.service,
            user = record.user.as_deref().unwrap_or(""),
            status = ?record.status,
            peer_ip = record.peer_ip.as_deref().unwrap_or(""),
            peer_port = record.peer_port.unwrap_or(0),
            "login"
        );
        Ok(None)
    }

    fn session_closed(&self, record: &SessionRecord) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            service = record.service.as_deref().unwrap_or(""),
            user = record.user.as_deref().unwrap_or(""),
            peer_ip = record.peer_ip.as_deref().unwrap_or(""),
            peer_port = record.peer_port.unwrap_or(0),
            bytes_rx = record.bytes_rx,
            bytes_tx = record.bytes_tx,
            duration_ms = (record.end_time - record.start_time).num_milliseconds(),
            status = ?record.status,
            "session closed"
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonlEntry<'a> {
    Login {
        id: Option<u64>,
        #[serde(flatten)]
        record: &'a LoginRecord,
    },
    Session {
        #[serde(flatten)]
        record: &'a SessionRecord,
    },
}

/// Appends one JSON object per record to a file.
/// Active logins are numbered sequentially from 1.
#[derive(Debug)]
pub struct JsonlAuditSink {
    file: RefCell<File>,
    next_id: Cell<u64>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self {
            file: RefCell::new(file),
            next_id: Cell::new(1),
        })
    }

    fn append(&self, entry: &JsonlEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file
            .borrow_mut()
            .write_all(&line)
            .context("writing audit record")
    }
}

impl AuditSink for JsonlAuditSink {
    fn login(&self, record: &LoginRecord) -> anyhow::Result<Option<u64>> {
        let id = match record.status {
            LoginStatus::Active => {
                let id = self.next_id.get();
                self.next_id.set(id + 1);
                Some(id)
            }
            LoginStatus::Failed => None,
        };
        self.append(&JsonlEntry::Login { id, record })?;
        Ok(id)
    }

    fn session_closed(&self, record: &SessionRecord) -> anyhow::Result<()> {
        self.append(&JsonlEntry::Session { record })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn jsonl_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();

        let peer = PeerInfo::new(
            Some("192.0.2.1:40000".parse().unwrap()),
            Some("192.0.2.2:143".parse().unwrap()),
        );

        let failed = LoginRecord::new("imap", Some("bob"), LoginStatus::Failed, &peer);
        assert_equal!(sink.login(&failed).unwrap(), None);
        let active = LoginRecord::new("imap", Some("alice"), LoginStatus::Active, &peer);
        assert_equal!(sink.login(&active).unwrap(), Some(1));

        let now = Utc::now();
        sink.session_closed(&SessionRecord {
            login_id: Some(1),
            service: Some("imap".to_string()),
            user: Some("alice".to_string()),
            peer_ip: peer.peer_ip(),
            peer_port: peer.peer_port(),
            local_ip: peer.local_ip(),
            local_port: peer.local_port(),
            resolved_name: None,
            start_time: now,
            end_time: now,
            bytes_rx: 10,
            bytes_tx: 20,
            status: FinalStatus::Eof,
        })
        .unwrap();

        let data = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = data
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_equal!(lines.len(), 3);
        assert_equal!(lines[0]["kind"], "login");
        assert_equal!(lines[0]["status"], "failed");
        assert_equal!(lines[0]["id"], serde_json::Value::Null);
        assert_equal!(lines[1]["id"], 1);
        assert_equal!(lines[1]["user"], "alice");
        assert_equal!(lines[2]["kind"], "session");
        assert_equal!(lines[2]["login_id"], 1);
        assert_equal!(lines[2]["status"], "eof");
        assert_equal!(lines[2]["bytes_tx"], 20);
        assert_equal!(lines[2]["local_port"], 143);
    }
}
