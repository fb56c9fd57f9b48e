//! Byte-stream transports the event loop can drive.
//!
//! The engine only needs four capabilities from a connection: read, write,
//! shutdown, and registration with the mio poll. [`Transport`] and
//! [`Acceptor`] capture those so the frame codec and handshake are written
//! once and run over TCP and Unix-domain sockets alike.

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};

/// Listen backlog for TCP listeners.
const LISTEN_BACKLOG: i32 = 1024;

/// Prefix selecting a Unix-domain socket in a listen address.
const UNIX_PREFIX: &str = "unix:";

/// Address of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    /// Unix peers are usually unnamed.
    Unix(Option<PathBuf>),
}

impl PeerAddr {
    /// Peer host, for TCP peers.
    pub fn host(&self) -> Option<String> {
        match self {
            PeerAddr::Tcp(addr) => Some(addr.ip().to_string()),
            PeerAddr::Unix(_) => None,
        }
    }

    /// Peer port, for TCP peers.
    pub fn port(&self) -> Option<u16> {
        match self {
            PeerAddr::Tcp(addr) => Some(addr.port()),
            PeerAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Unix(Some(path)) => write!(f, "{UNIX_PREFIX}{}", path.display()),
            PeerAddr::Unix(None) => write!(f, "{UNIX_PREFIX}unnamed"),
        }
    }
}

/// A connected, non-blocking byte stream.
pub trait Transport: Read + Write + Source + Send {
    /// Shut down both directions of the stream.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// A non-blocking listening socket.
pub trait Acceptor: Source + Send {
    /// Accept one pending connection. Returns `WouldBlock` when none is queued.
    fn accept(&self) -> io::Result<(Box<dyn Transport>, PeerAddr)>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<PeerAddr>;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> io::Result<(Box<dyn Transport>, PeerAddr)> {
        let (stream, addr) = TcpListener::accept(self)?;
        // Frames are small and written whole; don't let Nagle delay them.
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), PeerAddr::Tcp(addr)))
    }

    fn local_addr(&self) -> io::Result<PeerAddr> {
        TcpListener::local_addr(self).map(PeerAddr::Tcp)
    }
}

#[cfg(unix)]
impl Acceptor for UnixListener {
    fn accept(&self) -> io::Result<(Box<dyn Transport>, PeerAddr)> {
        let (stream, addr) = UnixListener::accept(self)?;
        let path = addr.as_pathname().map(|p| p.to_path_buf());
        Ok((Box::new(stream), PeerAddr::Unix(path)))
    }

    fn local_addr(&self) -> io::Result<PeerAddr> {
        let addr = UnixListener::local_addr(self)?;
        Ok(PeerAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf())))
    }
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `host:port` or `unix:<path>`.
    ///
    /// Host names are resolved and the first address is used.
    pub fn parse(listen: &str) -> io::Result<Endpoint> {
        if let Some(path) = listen.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "empty unix socket path",
                ));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        listen
            .to_socket_addrs()?
            .next()
            .map(Endpoint::Tcp)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address resolved for '{listen}'"),
                )
            })
    }

    /// Bind a non-blocking listener for this endpoint.
    pub fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
        match self {
            Endpoint::Tcp(addr) => {
                let listener = create_tcp_listener(*addr)?;
                Ok(Box::new(TcpListener::from_std(listener)))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Box::new(UnixListener::bind(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
            Endpoint::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_tcp_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
