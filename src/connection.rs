use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier handed to the lifecycle hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> ConnectionId {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The scheme clients used to reach this listener. The library does not
/// terminate TLS itself; `Https` marks listeners sitting behind a
/// terminating proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Abstracts away the stream types the server can be deployed on.
pub struct Connection {
    inner: ConnectionInner,
    id: ConnectionId,
    scheme: Scheme,
    alive: Arc<AtomicBool>,
}

enum ConnectionInner {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub(crate) fn set_scheme(&mut self, scheme: Scheme) {
        self.scheme = scheme;
    }

    /// Whether the connection has been closed through a close handle.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.inner {
            ConnectionInner::Tcp(ref tcp) => tcp.peer_addr().ok(),
            ConnectionInner::Unix(_) => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.inner {
            ConnectionInner::Tcp(ref tcp) => tcp.local_addr().ok(),
            ConnectionInner::Unix(_) => None,
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self.inner {
            ConnectionInner::Tcp(ref tcp) => tcp.set_read_timeout(timeout),
            ConnectionInner::Unix(ref unix) => unix.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self.inner {
            ConnectionInner::Tcp(ref tcp) => tcp.set_write_timeout(timeout),
            ConnectionInner::Unix(ref unix) => unix.set_write_timeout(timeout),
        }
    }

    /// A second handle over the same socket, sharing id and liveness.
    /// Workers use one clone for reading and one for writing.
    pub fn try_clone(&self) -> io::Result<Connection> {
        let inner = match self.inner {
            ConnectionInner::Tcp(ref tcp) => ConnectionInner::Tcp(tcp.try_clone()?),
            ConnectionInner::Unix(ref unix) => ConnectionInner::Unix(unix.try_clone()?),
        };
        Ok(Connection {
            inner,
            id: self.id,
            scheme: self.scheme,
            alive: self.alive.clone(),
        })
    }

    /// A handle the scheduler keeps to force-close the socket of a worker
    /// that does not cooperate with shutdown.
    pub(crate) fn close_handle(&self) -> io::Result<CloseHandle> {
        let inner = match self.inner {
            ConnectionInner::Tcp(ref tcp) => CloseInner::Tcp(tcp.try_clone()?),
            ConnectionInner::Unix(ref unix) => CloseInner::Unix(unix.try_clone()?),
        };
        Ok(CloseHandle {
            inner,
            alive: self.alive.clone(),
        })
    }

    pub(crate) fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        match self.inner {
            ConnectionInner::Tcp(ref tcp) => {
                tcp.shutdown(Shutdown::Both).ok();
            }
            ConnectionInner::Unix(ref unix) => {
                unix.shutdown(Shutdown::Both).ok();
            }
        }
    }
}

pub(crate) struct CloseHandle {
    inner: CloseInner,
    alive: Arc<AtomicBool>,
}

enum CloseInner {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl CloseHandle {
    pub(crate) fn close(&self) {
        self.alive.store(false, Ordering::Release);
        match self.inner {
            CloseInner::Tcp(ref tcp) => {
                tcp.shutdown(Shutdown::Both).ok();
            }
            CloseInner::Unix(ref unix) => {
                unix.shutdown(Shutdown::Both).ok();
            }
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner {
            ConnectionInner::Tcp(ref mut tcp) => tcp.read(buf),
            ConnectionInner::Unix(ref mut unix) => unix.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner {
            ConnectionInner::Tcp(ref mut tcp) => tcp.write(buf),
            ConnectionInner::Unix(ref mut unix) => unix.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner {
            ConnectionInner::Tcp(ref mut tcp) => tcp.flush(),
            ConnectionInner::Unix(ref mut unix) => unix.flush(),
        }
    }
}

impl From<TcpStream> for Connection {
    fn from(tcp: TcpStream) -> Self {
        Connection {
            inner: ConnectionInner::Tcp(tcp),
            id: ConnectionId::next(),
            scheme: Scheme::Http,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl From<(TcpStream, SocketAddr)> for Connection {
    fn from((tcp, _addr): (TcpStream, SocketAddr)) -> Self {
        tcp.into()
    }
}

impl From<UnixStream> for Connection {
    fn from(unix: UnixStream) -> Self {
        Connection {
            inner: ConnectionInner::Unix(unix),
            id: ConnectionId::next(),
            scheme: Scheme::Http,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }
}
