//! Multiplexed server
//!
//! One thread polls the listener, every connected client and the sockets of
//! any combined event sources. A readable listener means a new connection,
//! which is accepted and handshaken inline; a readable client means exactly
//! one request is read and answered. Requests are therefore handled one at a
//! time, in readiness order.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use remoto_common::transport::{Connection, Listener};
use remoto_common::{Location, RemotoError, Result, ServerType};

use super::{wait_readable, EventSource, SocketServer};
use crate::daemon::Dispatcher;

pub(crate) struct MultiplexServer {
    dispatcher: Arc<Dispatcher>,
    listener: Listener,
    clients: Mutex<HashMap<RawFd, Arc<Connection>>>,
    combined: Mutex<Vec<Arc<dyn EventSource>>>,
    last_housekeeping: Mutex<Instant>,
}

impl MultiplexServer {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, listener: Listener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            dispatcher,
            listener,
            clients: Mutex::new(HashMap::new()),
            combined: Mutex::new(Vec::new()),
            last_housekeeping: Mutex::new(Instant::now()),
        })
    }

    fn listener_fd(&self) -> RawFd {
        self.listener.as_fd().as_raw_fd()
    }

    fn accept_one(&self) {
        let conn = match self.listener.accept(self.dispatcher.config().comm_timeout) {
            Ok(conn) => conn,
            Err(RemotoError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                if !self.dispatcher.is_shutting_down() {
                    tracing::warn!("accept failed: {}", e);
                }
                return;
            }
        };
        if self.dispatcher.is_shutting_down() {
            conn.close();
            return;
        }
        if self.dispatcher.handshake(&conn) {
            self.clients.lock().insert(conn.fileno(), Arc::new(conn));
        }
    }

    fn serve_client(&self, conn: Arc<Connection>) {
        if let Err(e) = self.dispatcher.handle_request(&conn) {
            match &e {
                RemotoError::ConnectionClosed { .. } => {
                    tracing::debug!(connection = conn.id(), "connection closed by peer")
                }
                RemotoError::Timeout(_) => {
                    tracing::warn!(connection = conn.id(), "timeout talking to client, disconnecting")
                }
                _ => tracing::warn!(connection = conn.id(), "error during request handling: {}", e),
            }
            self.drop_client(&conn);
        }
    }

    fn drop_client(&self, conn: &Connection) {
        self.clients.lock().remove(&conn.fileno());
        self.dispatcher.client_disconnected(conn);
        conn.close();
    }

    fn housekeeping_due(&self) -> bool {
        let mut last = self.last_housekeeping.lock();
        if last.elapsed() >= self.dispatcher.config().housekeeping_interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    pub(crate) fn num_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

impl EventSource for MultiplexServer {
    fn sockets(&self) -> Vec<RawFd> {
        let mut fds = vec![self.listener_fd()];
        fds.extend(self.clients.lock().keys().copied());
        fds
    }

    fn events(&self, ready: &[RawFd]) -> Result<()> {
        let listener_fd = self.listener_fd();
        for fd in ready {
            if *fd == listener_fd {
                self.accept_one();
                continue;
            }
            let conn = self.clients.lock().get(fd).cloned();
            if let Some(conn) = conn {
                self.serve_client(conn);
            }
        }
        Ok(())
    }
}

impl SocketServer for MultiplexServer {
    fn location(&self) -> &Location {
        self.dispatcher.location()
    }

    fn server_type(&self) -> ServerType {
        ServerType::Multiplex
    }

    fn request_loop(&self, condition: &dyn Fn() -> bool) -> Result<()> {
        let poll_timeout = self.dispatcher.config().poll_timeout;
        while !self.dispatcher.is_shutting_down() && condition() {
            let others: Vec<Arc<dyn EventSource>> = self.combined.lock().clone();
            let mut fds = self.sockets();
            for other in &others {
                fds.extend(other.sockets());
            }

            let ready = wait_readable(&fds, poll_timeout)?;
            if self.dispatcher.is_shutting_down() {
                break;
            }
            if !ready.is_empty() {
                self.events(&ready)?;
                for other in &others {
                    let theirs = other.sockets();
                    let mine: Vec<RawFd> = ready.iter().copied().filter(|fd| theirs.contains(fd)).collect();
                    if !mine.is_empty() {
                        other.events(&mine)?;
                    }
                }
            }

            if self.housekeeping_due() {
                self.dispatcher.housekeeping();
            }
        }
        Ok(())
    }

    fn combine_loop(&self, other: Arc<dyn EventSource>) -> Result<()> {
        self.combined.lock().push(other);
        Ok(())
    }

    fn wakeup(&self) {
        self.listener.interrupt();
    }

    fn close(&self) {
        let clients: Vec<Arc<Connection>> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for conn in clients {
            self.dispatcher.client_disconnected(&conn);
            conn.close();
        }
        self.combined.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoto_common::{Config, Flags, JsonSerializer, Message, MessageType, Serializer, WireConfig};
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn server() -> Arc<MultiplexServer> {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        let location = listener.location().unwrap();
        let config = Config::default()
            .with_server_type(ServerType::Multiplex)
            .with_poll_timeout(Duration::from_millis(50));
        let dispatcher = Dispatcher::new(Arc::new(config), location);
        Arc::new(MultiplexServer::new(dispatcher, listener).unwrap())
    }

    fn connect(location: &Location) -> Connection {
        let conn = Connection::connect(location, Some(Duration::from_secs(5))).unwrap();
        Message::new(
            MessageType::Connect,
            JsonSerializer.dumps(&json!({"handshake": null})).unwrap(),
            JsonSerializer.id(),
            Flags::NONE,
            0,
        )
        .send(&conn, &WireConfig::default())
        .unwrap();
        let reply = Message::recv(&conn, None, &WireConfig::default()).unwrap();
        assert_eq!(reply.msg_type, MessageType::ConnectOk);
        conn
    }

    fn ping(conn: &Connection, seq: u16) -> u16 {
        Message::new(MessageType::Ping, vec![], JsonSerializer.id(), Flags::NONE, seq)
            .send(conn, &WireConfig::default())
            .unwrap();
        Message::recv(conn, None, &WireConfig::default()).unwrap().seq
    }

    #[test]
    fn test_interleaved_clients() {
        let server = server();
        let looping = Arc::clone(&server);
        let handle = thread::spawn(move || looping.request_loop(&|| true));

        let location = server.location().clone();
        let a = connect(&location);
        let b = connect(&location);
        assert_eq!(ping(&a, 1), 1);
        assert_eq!(ping(&b, 7), 7);
        assert_eq!(ping(&a, 2), 2);
        assert_eq!(server.num_clients(), 2);

        drop(a);
        assert_eq!(ping(&b, 8), 8);

        server.dispatcher.shutdown();
        server.wakeup();
        handle.join().unwrap().unwrap();
        server.close();
        assert_eq!(server.num_clients(), 0);
    }

    #[test]
    fn test_combined_source_is_served() {
        let host = server();
        let guest = server();
        host.combine_loop(Arc::clone(&guest) as Arc<dyn EventSource>).unwrap();

        let looping = Arc::clone(&host);
        let handle = thread::spawn(move || looping.request_loop(&|| true));

        let conn = connect(guest.location());
        assert_eq!(ping(&conn, 3), 3);

        host.dispatcher.shutdown();
        host.wakeup();
        handle.join().unwrap().unwrap();
        host.close();
        guest.close();
    }
}
