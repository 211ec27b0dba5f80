use anyhow::Context;
use mailcore_conn::Transport;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Mode applied to a freshly bound local socket: world writable,
/// setgid
pub const UNIX_SOCKET_MODE: u32 = 0o2777;

#[derive(Debug)]
pub enum Listener {
    Tcp(mio::net::TcpListener),
    Unix {
        listener: mio::net::UnixListener,
        path: PathBuf,
    },
}

/// Resolve an `IP:port` endpoint, where `*` stands for every IPv4
/// address
pub fn parse_listen_address(address: &str) -> anyhow::Result<SocketAddr> {
    let address = address.trim();
    let resolved = match address.strip_prefix("*:") {
        Some(port) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in listen address {address}"))?;
            SocketAddr::from(([0, 0, 0, 0], port))
        }
        None => address
            .to_socket_addrs()
            .with_context(|| format!("resolving listen address {address}"))?
            .next()
            .with_context(|| format!("listen address {address} resolved to nothing"))?,
    };
    Ok(resolved)
}

impl Listener {
    pub fn bind_tcp(addr: SocketAddr, backlog: i32, reuse_port: bool) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("creating socket")?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind to {addr}"))?;
        socket
            .listen(backlog)
            .with_context(|| format!("failed to listen on {addr}"))?;
        let listener: std::net::TcpListener = socket.into();
        let listener = mio::net::TcpListener::from_std(listener);
        tracing::info!("listening on {}", listener.local_addr()?);
        Ok(Self::Tcp(listener))
    }

    /// Bind a local stream socket at `path`. A stale socket left
    /// behind by a previous run is removed first; anything else
    /// already at that path causes an error.
    pub fn bind_unix(path: &Path, backlog: i32) -> anyhow::Result<Self> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(path)
                    .with_context(|| format!("removing stale socket {}", path.display()))?;
            }
            Ok(_) => anyhow::bail!("{} exists and is not a socket", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("checking {}", path.display()));
            }
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).context("creating socket")?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&SockAddr::unix(path)?)
            .with_context(|| format!("failed to bind to {}", path.display()))?;
        socket
            .listen(backlog)
            .with_context(|| format!("failed to listen on {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(UNIX_SOCKET_MODE))
            .with_context(|| format!("chmod {}", path.display()))?;

        let listener: std::os::unix::net::UnixListener = socket.into();
        tracing::info!("listening on {}", path.display());
        Ok(Self::Unix {
            listener: mio::net::UnixListener::from_std(listener),
            path: path.to_path_buf(),
        })
    }

    /// Accept one pending connection
    pub fn accept(&self) -> std::io::Result<Transport> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                tracing::debug!("accepted connection from {addr}");
                // a failure here only costs latency
                stream.set_nodelay(true).ok();
                Ok(Transport::Tcp(stream))
            }
            Self::Unix { listener, path } => {
                let (stream, _) = listener.accept()?;
                tracing::debug!("accepted local connection on {}", path.display());
                Ok(Transport::Unix(stream))
            }
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        match self {
            Self::Tcp(l) => registry.register(l, token, Interest::READABLE),
            Self::Unix { listener, .. } => registry.register(listener, token, Interest::READABLE),
        }
    }

    /// Re-arm readiness after an accept
    pub fn reregister(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        match self {
            Self::Tcp(l) => registry.reregister(l, token, Interest::READABLE),
            Self::Unix { listener, .. } => {
                registry.reregister(listener, token, Interest::READABLE)
            }
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> std::io::Result<()> {
        match self {
            Self::Tcp(l) => registry.deregister(l),
            Self::Unix { listener, .. } => registry.deregister(listener),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(l) => l.local_addr().ok(),
            Self::Unix { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(l) => match l.local_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "tcp:?".to_string(),
            },
            Self::Unix { path, .. } => path.display().to_string(),
        }
    }
}

/// Accept failures that say nothing about the health of the listener
pub fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionAborted
    ) || matches!(err.raw_os_error(), Some(libc::EPROTO) | Some(libc::ECONNABORTED))
}
