//! A line oriented echo service. It is just enough protocol to drive
//! the connection core from a terminal or a test: every line is
//! echoed back, apart from a handful of commands.
//!
//! ```text
//! STARTTLS       upgrade the connection
//! LOGIN <user>   record a login for <user>
//! QUIT           say goodbye and close
//! ```
use crate::config::Config;
use mailcore_conn::{Connection, LoginStatus};
use mailcore_reactor::{Dispatch, Session};
use rustls::ServerConfig;
use std::sync::Arc;

pub struct EchoDispatch {
    service: String,
    tls: Option<Arc<ServerConfig>>,
}

impl EchoDispatch {
    pub fn new(service: &str, tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            service: service.to_string(),
            tls,
        }
    }
}

/// Matches `start::DispatchFactory`
pub fn factory(config: &Config, tls: Option<Arc<ServerConfig>>) -> Box<dyn Dispatch> {
    Box::new(EchoDispatch::new(&config.server.service_name, tls))
}

impl Dispatch for EchoDispatch {
    fn dispatch(&mut self, conn: &mut Connection) -> anyhow::Result<Box<dyn Session>> {
        let tls = match &self.tls {
            // implicit TLS connections are already encrypted
            Some(tls) if conn.tls_state().is_none() => Some(Arc::clone(tls)),
            _ => None,
        };
        let mut caps = String::new();
        if tls.is_some() {
            caps.push_str(" STARTTLS");
        }
        write!(conn, "OK {} ready{caps}\r\n", self.service)?;
        Ok(Box::new(EchoSession {
            service: self.service.clone(),
            tls,
        }))
    }
}

pub struct EchoSession {
    service: String,
    tls: Option<Arc<ServerConfig>>,
}

impl EchoSession {
    fn command(&mut self, conn: &mut Connection, line: &str) -> anyhow::Result<bool> {
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "QUIT" => {
                conn.write(b"OK bye\r\n")?;
                conn.request_close();
                Ok(false)
            }
            "STARTTLS" => {
                match self.tls.take() {
                    Some(tls) => {
                        conn.write(b"OK begin TLS\r\n")?;
                        conn.start_tls(tls)?;
                        // anything pipelined behind STARTTLS was discarded
                        Ok(false)
                    }
                    None if conn.tls_state().is_some() => {
                        conn.write(b"NO TLS is already active\r\n")?;
                        Ok(true)
                    }
                    None => {
                        conn.write(b"NO TLS is not available\r\n")?;
                        Ok(true)
                    }
                }
            }
            "LOGIN" if !arg.is_empty() => {
                conn.audit_login(&self.service, arg, LoginStatus::Active);
                write!(conn, "OK logged in as {arg}\r\n")?;
                Ok(true)
            }
            "LOGIN" => {
                conn.write(b"BAD LOGIN requires a user name\r\n")?;
                Ok(true)
            }
            _ => {
                write!(conn, "{line}\r\n")?;
                Ok(true)
            }
        }
    }
}

impl Session for EchoSession {
    fn on_data(&mut self, conn: &mut Connection) -> anyhow::Result<()> {
        while let Some(line) = conn.read_line()? {
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if !self.command(conn, line)? {
                break;
            }
        }
        Ok(())
    }

    fn on_timeout(&mut self, conn: &mut Connection) {
        conn.write(b"BYE idle timeout\r\n").ok();
    }
}
