use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::protocol::error::{RemotoError, Result};
use crate::protocol::uri::Location;
use crate::transport::connection::{map_io_error, Connection, Stream};

/// Pending connection queue length passed to `listen`.
const LISTEN_BACKLOG: i32 = 100;

/// A listening socket a daemon accepts connections on.
///
/// TCP listeners are created through `socket2` so that `SO_REUSEADDR` is set
/// before binding; a restarted daemon can rebind its port immediately. Unix
/// listeners remove their socket file when dropped.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Binds to the given location.
    pub fn bind(location: &Location) -> Result<Self> {
        match location {
            Location::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|e| RemotoError::Config(format!("cannot resolve '{}': {}", host, e)))?
                    .next()
                    .ok_or_else(|| RemotoError::Config(format!("no address for '{}'", host)))?;
                Self::bind_tcp(addr)
                    .map_err(|e| map_io_error(e, &format!("binding {}", location)))
            }
            Location::Unix(path) => {
                // A stale socket file from a previous run would make bind fail.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| map_io_error(e, &format!("binding {}", location)))?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    fn bind_tcp(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(Listener::Tcp(socket.into()))
    }

    /// The location clients should use to reach this listener.
    pub fn location(&self) -> Result<Location> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Location::tcp(addr.ip().to_string(), addr.port()))
            }
            Listener::Unix { path, .. } => Ok(Location::Unix(path.clone())),
        }
    }

    /// Accepts one connection and applies the socket timeout to it.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Connection> {
        let stream = match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Stream::Unix(stream)
            }
        };
        let conn = Connection::new(stream);
        conn.set_timeout(timeout)?;
        Ok(conn)
    }

    /// Makes `accept` return `WouldBlock` instead of waiting.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            Listener::Tcp(listener) => listener.set_nonblocking(nonblocking)?,
            Listener::Unix { listener, .. } => listener.set_nonblocking(nonblocking)?,
        }
        Ok(())
    }

    /// Opens and immediately drops a connection to this listener, waking up a
    /// loop that is blocked waiting for it to become readable.
    pub fn interrupt(&self) {
        if let Ok(location) = self.location() {
            let location = match location {
                Location::Tcp { host, port } if host == "0.0.0.0" => Location::tcp("127.0.0.1", port),
                Location::Tcp { host, port } if host == "::" => Location::tcp("::1", port),
                other => other,
            };
            let _ = Connection::connect(&location, Some(Duration::from_millis(500)));
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Unix { listener, .. } => listener.as_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_tcp_ephemeral_port() {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        match listener.location().unwrap() {
            Location::Tcp { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_ne!(port, 0);
            }
            other => panic!("Expected tcp location, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_tcp() {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        let location = listener.location().unwrap();
        let client = std::thread::spawn(move || {
            let conn = Connection::connect(&location, None).unwrap();
            conn.send(b"ping").unwrap();
            conn
        });
        let server_side = listener.accept(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(server_side.recv(4).unwrap(), b"ping");
        assert_eq!(server_side.timeout(), Some(Duration::from_secs(5)));
        client.join().unwrap();
    }

    #[test]
    fn test_unix_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        {
            let listener = Listener::bind(&Location::Unix(path.clone())).unwrap();
            assert!(path.exists());
            let conn = Connection::connect(&listener.location().unwrap(), None).unwrap();
            let accepted = listener.accept(None).unwrap();
            conn.send(b"x").unwrap();
            assert_eq!(accepted.recv(1).unwrap(), b"x");
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_nonblocking_accept() {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        match listener.accept(None) {
            Err(RemotoError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            other => panic!("Expected WouldBlock, got {:?}", other),
        }
    }
}
