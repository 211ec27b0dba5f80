use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

/// The descriptors underneath a connection.
///
/// Sockets use the same descriptor for both directions; a stdio
/// attached connection receives on stdin and transmits on stdout,
/// and each of those is registered with the reactor separately.
#[derive(Debug)]
pub enum Transport {
    Tcp(mio::net::TcpStream),
    Unix(mio::net::UnixStream),
    Stdio { rx: File, tx: File },
}

/// What is currently registered with the reactor on behalf of a transport
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Registration {
    socket: Option<Interest>,
    rx: bool,
    tx: bool,
}

#[derive(Debug)]
pub struct RegisteredTransport {
    transport: Transport,
    registration: Registration,
}

impl Transport {
    /// Duplicate the process stdin/stdout descriptors and switch them
    /// to non-blocking mode
    pub fn stdio() -> std::io::Result<Self> {
        let rx = std::io::stdin().as_fd().try_clone_to_owned()?;
        let tx = std::io::stdout().as_fd().try_clone_to_owned()?;
        set_nonblocking(&rx)?;
        set_nonblocking(&tx)?;
        Ok(Self::Stdio {
            rx: File::from(rx),
            tx: File::from(tx),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) => s.peer_addr().ok(),
            Self::Unix(_) | Self::Stdio { .. } => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) => s.local_addr().ok(),
            Self::Unix(_) | Self::Stdio { .. } => None,
        }
    }

    pub fn shutdown(&self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
            Self::Stdio { .. } => Ok(()),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
            Self::Stdio { rx, .. } => rx.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
            Self::Stdio { tx, .. } => tx.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
            Self::Stdio { tx, .. } => tx.flush(),
        }
    }
}

impl RegisteredTransport {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            registration: Registration::default(),
        }
    }

    pub fn get_ref(&self) -> &Transport {
        &self.transport
    }

    pub fn get_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn is_registered(&self) -> bool {
        self.registration != Registration::default()
    }

    /// Bring the reactor registration in line with the requested
    /// interest, registering, re-registering or deregistering as
    /// required. Re-registration also re-arms the readiness
    /// notification for the descriptor.
    pub fn update_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        read: bool,
        write: bool,
    ) -> std::io::Result<()> {
        let wanted = match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        match &mut self.transport {
            Transport::Tcp(s) => {
                update_source(registry, s, token, &mut self.registration.socket, wanted)
            }
            Transport::Unix(s) => {
                update_source(registry, s, token, &mut self.registration.socket, wanted)
            }
            Transport::Stdio { rx, tx } => {
                let rx_fd = rx.as_raw_fd();
                let tx_fd = tx.as_raw_fd();
                update_fd(
                    registry,
                    &mut SourceFd(&rx_fd),
                    token,
                    &mut self.registration.rx,
                    read,
                    Interest::READABLE,
                )?;
                update_fd(
                    registry,
                    &mut SourceFd(&tx_fd),
                    token,
                    &mut self.registration.tx,
                    write,
                    Interest::WRITABLE,
                )
            }
        }
    }

    pub fn deregister(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        self.update_interest(registry, token, false, false)
    }
}

fn update_source<S: mio::event::Source>(
    registry: &Registry,
    source: &mut S,
    token: Token,
    current: &mut Option<Interest>,
    wanted: Option<Interest>,
) -> std::io::Result<()> {
    match (*current, wanted) {
        (None, None) => {}
        (None, Some(interest)) => registry.register(source, token, interest)?,
        (Some(_), Some(interest)) => registry.reregister(source, token, interest)?,
        (Some(_), None) => registry.deregister(source)?,
    }
    *current = wanted;
    Ok(())
}

fn update_fd(
    registry: &Registry,
    source: &mut SourceFd<'_>,
    token: Token,
    registered: &mut bool,
    wanted: bool,
    interest: Interest,
) -> std::io::Result<()> {
    match (*registered, wanted) {
        (false, false) => {}
        (false, true) => registry.register(source, token, interest)?,
        (true, true) => registry.reregister(source, token, interest)?,
        (true, false) => registry.deregister(source)?,
    }
    *registered = wanted;
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: raw remains a valid, open descriptor for as long as
    // `fd` is borrowed, and F_GETFL/F_SETFL don't touch memory.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
