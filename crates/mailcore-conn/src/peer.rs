use nix::sys::socket::{SockaddrIn, SockaddrIn6, SockaddrLike};
use serde::Serialize;
use std::ffi::CStr;
use std::net::SocketAddr;

/// Identity metadata for the two ends of a connection.
/// Addresses are absent for local sockets and stdio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub peer_address: Option<SocketAddr>,
    pub local_address: Option<SocketAddr>,
    pub resolved_name: Option<String>,
}

impl PeerInfo {
    pub fn new(peer_address: Option<SocketAddr>, local_address: Option<SocketAddr>) -> Self {
        Self {
            peer_address,
            local_address,
            resolved_name: None,
        }
    }

    /// Populate `resolved_name` from reverse DNS.
    /// This blocks the calling thread for the duration of the lookup.
    pub fn resolve(&mut self) {
        let Some(addr) = self.peer_address else {
            return;
        };
        match reverse_lookup(&addr) {
            Ok(name) => self.resolved_name = Some(name),
            Err(err) => tracing::info!("reverse lookup of {} failed: {err:#}", addr.ip()),
        }
    }

    pub fn peer_ip(&self) -> Option<String> {
        self.peer_address.map(|a| a.ip().to_string())
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.peer_address.map(|a| a.port())
    }

    pub fn local_ip(&self) -> Option<String> {
        self.local_address.map(|a| a.ip().to_string())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_address.map(|a| a.port())
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match (&self.peer_address, &self.resolved_name) {
            (Some(addr), Some(name)) => write!(fmt, "{addr} ({name})"),
            (Some(addr), None) => write!(fmt, "{addr}"),
            (None, _) => write!(fmt, "local"),
        }
    }
}

fn reverse_lookup(addr: &SocketAddr) -> std::io::Result<String> {
    match addr {
        SocketAddr::V4(v4) => name_info(&SockaddrIn::from(*v4)),
        SocketAddr::V6(v6) => name_info(&SockaddrIn6::from(*v6)),
    }
}

fn name_info<S: SockaddrLike>(addr: &S) -> std::io::Result<String> {
    let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
    // SAFETY: addr points to a valid sockaddr of addr.len() bytes, and
    // host is a writable buffer whose length we pass alongside it.
    let rc = unsafe {
        libc::getnameinfo(
            addr.as_ptr(),
            addr.len(),
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        // SAFETY: gai_strerror returns a pointer to a static string
        let reason = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
        return Err(std::io::Error::other(reason.to_string_lossy().into_owned()));
    }
    // SAFETY: getnameinfo NUL terminated the buffer on success
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}
