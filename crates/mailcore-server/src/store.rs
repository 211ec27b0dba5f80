use crate::config::StoreSettings;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Answers "can this process still reach its backing store?".
/// A negative answer makes the worker drain and stop.
pub trait StoreProbe {
    fn is_reachable(&mut self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

impl StoreProbe for AlwaysReachable {
    fn is_reachable(&mut self) -> bool {
        true
    }
}

impl<F> StoreProbe for F
where
    F: FnMut() -> bool,
{
    fn is_reachable(&mut self) -> bool {
        (self)()
    }
}

/// Considers the store reachable if a TCP connection to it can be
/// established within `timeout`. This blocks the worker for up to
/// that long, so keep the timeout short.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            timeout,
        }
    }

    fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        Ok(self.address.to_socket_addrs()?.collect())
    }
}

impl StoreProbe for TcpProbe {
    fn is_reachable(&mut self) -> bool {
        let addrs = match self.resolve() {
            Ok(addrs) => addrs,
            Err(err) => {
                tracing::error!("resolving store address {}: {err:#}", self.address);
                return false;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return true,
                Err(err) => tracing::debug!("store probe {addr}: {err:#}"),
            }
        }
        tracing::error!("store at {} is unreachable", self.address);
        false
    }
}

pub fn probe_from_settings(settings: &StoreSettings) -> Box<dyn StoreProbe> {
    match &settings.address {
        Some(address) => Box::new(TcpProbe::new(address, settings.connect_timeout)),
        None => Box::new(AlwaysReachable),
    }
}
