//! Transport servers
//!
//! A daemon serves its connections with one of two strategies:
//!
//! - [`threadpool`]: every connection is handed to a worker of an elastic
//!   pool, which runs the handshake and then serves requests on it until the
//!   client goes away
//! - [`multiplex`]: a single thread polls the listener and every client
//!   socket and answers one request per readable connection
//!
//! Both implement [`SocketServer`] on top of the shared dispatcher.

pub mod multiplex;
pub mod threadpool;

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use remoto_common::transport::Listener;
use remoto_common::{Location, RemotoError, Result, ServerType};

use crate::daemon::Dispatcher;

/// Something whose sockets can be watched by another server's loop.
pub trait EventSource: Send + Sync {
    /// Descriptors to watch for readability.
    fn sockets(&self) -> Vec<RawFd>;

    /// Handles the descriptors that became readable.
    fn events(&self, ready: &[RawFd]) -> Result<()>;
}

/// A daemon's connection-serving strategy.
pub trait SocketServer: EventSource {
    fn location(&self) -> &Location;

    fn server_type(&self) -> ServerType;

    /// Serves connections while `condition` holds and the daemon is not
    /// shutting down.
    fn request_loop(&self, condition: &dyn Fn() -> bool) -> Result<()>;

    /// Serves `other`'s sockets from this server's loop.
    fn combine_loop(&self, other: Arc<dyn EventSource>) -> Result<()>;

    /// Wakes a loop blocked in `poll`.
    fn wakeup(&self);

    /// Closes every client connection and stops background threads.
    fn close(&self);
}

pub(crate) fn create(
    server_type: ServerType,
    dispatcher: Arc<Dispatcher>,
    listener: Listener,
) -> Result<Box<dyn SocketServer>> {
    Ok(match server_type {
        ServerType::Thread => Box::new(threadpool::ThreadPoolServer::new(dispatcher, listener)?),
        ServerType::Multiplex => Box::new(multiplex::MultiplexServer::new(dispatcher, listener)?),
    })
}

/// Waits until any of `fds` is readable; returns the readable ones, or
/// nothing on timeout or interruption.
///
/// Hangups and socket errors count as readable so the next read reports them.
/// A descriptor that is not open fails the wait.
pub(crate) fn wait_readable(fds: &[RawFd], timeout: Duration) -> Result<Vec<RawFd>> {
    // SAFETY: callers only pass descriptors of sockets they keep open for the
    // duration of this call.
    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| unsafe { BorrowedFd::borrow_raw(*fd) }).collect();
    let mut poll_fds: Vec<PollFd<'_>> = borrowed.iter().map(|fd| PollFd::new(*fd, PollFlags::POLLIN)).collect();

    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    match poll(&mut poll_fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(Vec::new()),
        Ok(_) => {
            let invalid = poll_fds
                .iter()
                .zip(fds)
                .find(|(p, _)| p.revents().is_some_and(|r| r.contains(PollFlags::POLLNVAL)));
            if let Some((_, fd)) = invalid {
                return Err(RemotoError::closed(format!("polling: descriptor {} is not open", fd)));
            }
            let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            Ok(poll_fds
                .iter()
                .zip(fds)
                .filter(|(p, _)| p.revents().map(|r| r.intersects(wanted)).unwrap_or(false))
                .map(|(_, fd)| *fd)
                .collect())
        }
        Err(Errno::EINTR) => Ok(Vec::new()),
        Err(e) => Err(RemotoError::Io(std::io::Error::from(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_readable_timeout() {
        let (a, _b) = UnixStream::pair().unwrap();
        let ready = wait_readable(&[a.as_raw_fd()], Duration::from_millis(20)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_wait_readable_reports_ready_fd() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        let ready = wait_readable(&[c.as_raw_fd(), a.as_raw_fd()], Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![a.as_raw_fd()]);
    }

    #[test]
    fn test_hangup_counts_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let ready = wait_readable(&[a.as_raw_fd()], Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![a.as_raw_fd()]);
    }

    #[test]
    fn test_invalid_descriptor_fails_the_wait() {
        let (a, _b) = UnixStream::pair().unwrap();
        let missing: RawFd = i32::MAX - 1;
        let started = std::time::Instant::now();
        match wait_readable(&[a.as_raw_fd(), missing], Duration::from_secs(5)) {
            Err(RemotoError::ConnectionClosed { message, .. }) => assert!(message.contains("not open")),
            other => panic!("Expected ConnectionClosed, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
