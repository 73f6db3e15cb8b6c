use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use socket2::{Domain, Protocol, Socket, Type};

use crate::protocol::error::{RemotoError, Result};
use crate::protocol::uri::Location;

/// First sleep after a transient socket error.
const BACKOFF_INITIAL: Duration = Duration::from_micros(10);

/// Upper bound of a single backoff sleep.
const BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Consecutive transient errors tolerated without any progress.
const BACKOFF_MAX_ATTEMPTS: u32 = 100;

/// Timeout for establishing a connection when no socket timeout is configured
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest single read; `recv` grows its buffer by at most this much per read.
const RECV_CHUNK: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded exponential backoff for transient socket errors.
///
/// Sleeps start at 10µs and double up to 50ms. After 100 consecutive transient
/// errors without a single byte of progress the operation gives up.
#[derive(Debug)]
struct Backoff {
    delay: Duration,
    attempts: u32,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
            attempts: 0,
        }
    }

    fn reset(&mut self) {
        self.delay = BACKOFF_INITIAL;
        self.attempts = 0;
    }

    /// Sleeps for the next delay, or returns `false` when retries are exhausted.
    fn wait(&mut self) -> bool {
        if self.attempts >= BACKOFF_MAX_ATTEMPTS {
            return false;
        }
        std::thread::sleep(self.delay);
        self.attempts += 1;
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        true
    }
}

/// The socket under a [`Connection`].
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).read(buf),
            Stream::Unix(s) => (&*s).read(buf),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).write(buf),
            Stream::Unix(s) => (&*s).write(buf),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn timeout(&self) -> io::Result<Option<Duration>> {
        match self {
            Stream::Tcp(s) => s.read_timeout(),
            Stream::Unix(s) => s.read_timeout(),
        }
    }

    fn peer(&self) -> String {
        match self {
            Stream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            Stream::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unix>".to_string()),
        }
    }
}

/// A blocking stream socket with exact-size send and receive.
///
/// A connection is owned by one proxy, one pool worker or the multiplex loop at
/// a time. All I/O methods take `&self` so a server can close a connection
/// from another thread to unblock whoever is reading it.
///
/// # Example
///
/// ```no_run
/// use remoto_common::protocol::Location;
/// use remoto_common::transport::Connection;
///
/// let conn = Connection::connect(&Location::tcp("127.0.0.1", 9090), None).unwrap();
/// conn.send(b"hello").unwrap();
/// let reply = conn.recv(5).unwrap();
/// conn.close();
/// ```
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    id: u64,
    peer: String,
    closed: AtomicBool,
    /// Object this connection was opened for, if any
    object_id: Option<String>,
}

impl Connection {
    /// Wraps an already connected socket.
    pub fn new(stream: Stream) -> Self {
        let peer = stream.peer();
        Self {
            stream,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            closed: AtomicBool::new(false),
            object_id: None,
        }
    }

    /// Connects to a daemon location.
    ///
    /// A TCP host may resolve to several addresses; each is tried until one
    /// accepts. The socket timeout, if given, applies to the connect attempt
    /// and to every later send and receive.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if no address accepts the connection and
    /// `Timeout` if the attempt timed out.
    pub fn connect(location: &Location, timeout: Option<Duration>) -> Result<Self> {
        let stream = match location {
            Location::Tcp { host, port } => {
                let addrs = (host.as_str(), *port).to_socket_addrs().map_err(|e| {
                    RemotoError::closed(format!("cannot resolve '{}': {}", location, e))
                })?;

                let mut last_err = None;
                let mut connected = None;
                for addr in addrs {
                    match connect_tcp(addr, timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }

                let stream = match connected {
                    Some(stream) => stream,
                    None => {
                        return Err(match last_err {
                            Some(e) if is_timeout(&e) => {
                                RemotoError::Timeout(format!("connecting to {}", location))
                            }
                            Some(e) => RemotoError::closed(format!("cannot connect to {}: {}", location, e)),
                            None => RemotoError::closed(format!("cannot connect to {}: no addresses", location)),
                        })
                    }
                };
                Stream::Tcp(stream)
            }
            Location::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(|e| {
                    RemotoError::closed(format!("cannot connect to {}: {}", location, e))
                })?;
                Stream::Unix(stream)
            }
        };

        let conn = Self::new(stream);
        conn.set_timeout(timeout)?;
        tracing::debug!(connection = conn.id, peer = %conn.peer, "connected");
        Ok(conn)
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        // A zero duration is rejected by the OS; treat it as "no timeout".
        let timeout = timeout.filter(|t| !t.is_zero());
        self.stream
            .set_timeout(timeout)
            .map_err(|e| map_io_error(e, "setting timeout"))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.stream.timeout().ok().flatten()
    }

    /// Sends all of `data`.
    ///
    /// # Errors
    ///
    /// - `Timeout` if a socket timeout is configured and expired
    /// - `ConnectionClosed` if the peer went away or a non-transient error occurred
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        let mut backoff = Backoff::new();
        while sent < data.len() {
            match self.stream.write(&data[sent..]) {
                Ok(0) => return Err(RemotoError::closed("sending: connection lost")),
                Ok(n) => {
                    sent += n;
                    backoff.reset();
                }
                Err(e) if is_timeout(&e) && self.timeout().is_some() => {
                    return Err(RemotoError::Timeout("sending: timeout".to_string()));
                }
                Err(e) if is_transient(&e) => {
                    if !backoff.wait() {
                        return Err(RemotoError::closed("sending: too many transient errors"));
                    }
                }
                Err(e) => return Err(RemotoError::closed(format!("sending: connection lost: {}", e))),
            }
        }
        Ok(())
    }

    /// Receives exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// - `Timeout` if a socket timeout is configured and expired
    /// - `ConnectionClosed` carrying the bytes read so far if the stream
    ///   ended early or failed with a non-transient error
    pub fn recv(&self, size: usize) -> Result<Vec<u8>> {
        // the buffer grows with the data actually received, not the size asked for
        let mut data = Vec::with_capacity(size.min(RECV_CHUNK));
        let mut filled = 0;
        let mut backoff = Backoff::new();
        while filled < size {
            let want = (size - filled).min(RECV_CHUNK);
            data.resize(filled + want, 0);
            match self.stream.read(&mut data[filled..]) {
                Ok(0) => {
                    data.truncate(filled);
                    return Err(RemotoError::ConnectionClosed {
                        message: "receiving: not enough data".to_string(),
                        partial: data,
                    });
                }
                Ok(n) => {
                    filled += n;
                    backoff.reset();
                }
                Err(e) if is_timeout(&e) && self.timeout().is_some() => {
                    return Err(RemotoError::Timeout("receiving: timeout".to_string()));
                }
                Err(e) if is_transient(&e) => {
                    if !backoff.wait() {
                        data.truncate(filled);
                        return Err(RemotoError::ConnectionClosed {
                            message: "receiving: too many transient errors".to_string(),
                            partial: data,
                        });
                    }
                }
                Err(e) => {
                    data.truncate(filled);
                    return Err(RemotoError::ConnectionClosed {
                        message: format!("receiving: connection lost: {}", e),
                        partial: data,
                    });
                }
            }
        }
        data.truncate(filled);
        Ok(data)
    }

    /// Shuts the socket down in both directions. Closing twice is harmless.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown();
            tracing::debug!(connection = self.id, peer = %self.peer, "connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn fileno(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.stream {
            Stream::Tcp(s) => s.as_fd(),
            Stream::Unix(s) => s.as_fd(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a TCP socket with `TCP_NODELAY` set before connecting.
fn connect_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
        || err.raw_os_error() == Some(Errno::EINPROGRESS as i32)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Map IO errors to RemotoError variants
///
/// - Timeouts/would block -> `Timeout`
/// - Connection errors -> `ConnectionClosed`
/// - Other IO errors -> `Io`
pub(crate) fn map_io_error(err: io::Error, context: &str) -> RemotoError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            RemotoError::Timeout(format!("{}: timed out", context))
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => RemotoError::closed(format!("{}: connection lost", context)),
        _ => RemotoError::Io(err),
    }
}
