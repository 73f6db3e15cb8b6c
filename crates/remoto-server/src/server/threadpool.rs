//! Thread-pool server
//!
//! The accept loop polls the listener and hands every new connection to the
//! [`WorkerPool`]. The worker performs the handshake and then serves requests
//! on that connection until the client disconnects, a communication error
//! occurs or the daemon closes.
//!
//! When no worker is free the connection is refused with a `CONNECTFAIL`
//! instead of being left waiting.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use remoto_common::context;
use remoto_common::transport::{Connection, Listener};
use remoto_common::{Location, RemotoError, Result, ServerType};

use super::{wait_readable, EventSource, SocketServer};
use crate::daemon::Dispatcher;
use crate::worker_pool::{PoolConfig, WorkerPool};

const NO_FREE_WORKERS: &str = "no free workers, increase server threadpool size";

type ClientMap = Arc<Mutex<HashMap<u64, Arc<Connection>>>>;

/// Removes a served connection from the client map when dropped, also when
/// serving it panicked.
struct ClientEntry {
    clients: ClientMap,
    id: u64,
}

impl Drop for ClientEntry {
    fn drop(&mut self) {
        self.clients.lock().remove(&self.id);
    }
}

pub(crate) struct ThreadPoolServer {
    dispatcher: Arc<Dispatcher>,
    listener: Listener,
    pool: WorkerPool,
    clients: ClientMap,
    housekeeper_stop: Mutex<Option<Sender<()>>>,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPoolServer {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, listener: Listener) -> Result<Self> {
        let pool = WorkerPool::new(PoolConfig::from(dispatcher.config().as_ref()))?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = dispatcher.config().housekeeping_interval;
        let housekeeping = Arc::clone(&dispatcher);
        let housekeeper = thread::Builder::new()
            .name("remoto-housekeeper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => housekeeping.housekeeping(),
                    _ => break,
                }
            })?;

        Ok(Self {
            dispatcher,
            listener,
            pool,
            clients: Arc::new(Mutex::new(HashMap::new())),
            housekeeper_stop: Mutex::new(Some(stop_tx)),
            housekeeper: Mutex::new(Some(housekeeper)),
        })
    }

    fn accept_one(&self) {
        let timeout = self.dispatcher.config().comm_timeout;
        let conn = match self.listener.accept(timeout) {
            Ok(conn) => Arc::new(conn),
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

        self.clients.lock().insert(conn.id(), Arc::clone(&conn));
        let dispatcher = Arc::clone(&self.dispatcher);
        let clients = Arc::clone(&self.clients);
        let worker_conn = Arc::clone(&conn);
        let job = Box::new(move || {
            let _entry = ClientEntry {
                clients,
                id: worker_conn.id(),
            };
            serve_connection(&dispatcher, &worker_conn);
        });

        match self.pool.process(job) {
            Ok(()) => {}
            Err(RemotoError::NoFreeWorkers(reason)) => {
                tracing::debug!("{}", reason);
                self.clients.lock().remove(&conn.id());
                self.dispatcher.deny_connection(&conn, NO_FREE_WORKERS);
            }
            Err(e) => {
                tracing::error!("could not hand connection to a worker: {}", e);
                self.clients.lock().remove(&conn.id());
                conn.close();
            }
        }
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

/// Handshake, then requests until the connection ends.
fn serve_connection(dispatcher: &Dispatcher, conn: &Connection) {
    if !dispatcher.handshake(conn) {
        context::reset();
        return;
    }

    loop {
        match dispatcher.handle_request(conn) {
            Ok(()) => {}
            Err(e) => {
                match &e {
                    RemotoError::ConnectionClosed { .. } => {
                        tracing::debug!(connection = conn.id(), "connection closed by peer")
                    }
                    RemotoError::Timeout(_) => {
                        tracing::warn!(connection = conn.id(), "timeout talking to client, disconnecting")
                    }
                    RemotoError::Security(_) => {
                        tracing::warn!(connection = conn.id(), peer = %conn.peer(), "{}", e)
                    }
                    _ if conn.is_closed() => {}
                    _ => tracing::error!(connection = conn.id(), "error during request handling: {}", e),
                }
                break;
            }
        }
    }

    dispatcher.client_disconnected(conn);
    conn.close();
    context::reset();
}

impl EventSource for ThreadPoolServer {
    fn sockets(&self) -> Vec<RawFd> {
        vec![self.listener.as_fd().as_raw_fd()]
    }

    fn events(&self, _ready: &[RawFd]) -> Result<()> {
        Err(RemotoError::Unsupported(
            "the thread pool server cannot be driven by another event loop".to_string(),
        ))
    }
}

impl SocketServer for ThreadPoolServer {
    fn location(&self) -> &Location {
        self.dispatcher.location()
    }

    fn server_type(&self) -> ServerType {
        ServerType::Thread
    }

    fn request_loop(&self, condition: &dyn Fn() -> bool) -> Result<()> {
        let listener_fd = self.listener.as_fd().as_raw_fd();
        let poll_timeout = self.dispatcher.config().poll_timeout;
        while !self.dispatcher.is_shutting_down() && condition() {
            let ready = wait_readable(&[listener_fd], poll_timeout)?;
            if ready.is_empty() {
                continue;
            }
            if self.dispatcher.is_shutting_down() {
                break;
            }
            self.accept_one();
        }
        Ok(())
    }

    fn combine_loop(&self, _other: Arc<dyn EventSource>) -> Result<()> {
        Err(RemotoError::Unsupported(
            "combining event loops needs the multiplex server".to_string(),
        ))
    }

    fn wakeup(&self) {
        self.listener.interrupt();
    }

    fn close(&self) {
        if let Some(stop) = self.housekeeper_stop.lock().take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.housekeeper.lock().take() {
            let _ = handle.join();
        }
        let clients: Vec<Arc<Connection>> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for conn in clients {
            conn.close();
        }
        self.pool.close();
    }
}

impl Drop for ThreadPoolServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoto_common::{Config, Flags, JsonSerializer, Message, MessageType, Serializer, WireConfig};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn server(config: Config) -> Arc<ThreadPoolServer> {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        let location = listener.location().unwrap();
        let dispatcher = Dispatcher::new(Arc::new(config), location);
        Arc::new(ThreadPoolServer::new(dispatcher, listener).unwrap())
    }

    fn connect(server: &ThreadPoolServer) -> (Connection, Message) {
        let conn = Connection::connect(server.location(), Some(Duration::from_secs(5))).unwrap();
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
        (conn, reply)
    }

    #[test]
    fn test_serves_ping_then_stops() {
        let server = server(Config::default().with_poll_timeout(Duration::from_millis(50)));
        let looping = Arc::clone(&server);
        let handle = thread::spawn(move || looping.request_loop(&|| true));

        let (conn, reply) = connect(&server);
        assert_eq!(reply.msg_type, MessageType::ConnectOk);
        Message::new(MessageType::Ping, vec![], JsonSerializer.id(), Flags::NONE, 5)
            .send(&conn, &WireConfig::default())
            .unwrap();
        let pong = Message::recv(&conn, None, &WireConfig::default()).unwrap();
        assert_eq!(pong.seq, 5);
        assert_eq!(JsonSerializer.loads(&pong.payload).unwrap(), Value::String("pong".into()));

        server.dispatcher.shutdown();
        server.wakeup();
        handle.join().unwrap().unwrap();
        server.close();
    }

    #[test]
    fn test_refuses_when_pool_is_full() {
        let server = server(
            Config::default()
                .with_threadpool(1, 1)
                .with_poll_timeout(Duration::from_millis(50)),
        );
        let looping = Arc::clone(&server);
        let handle = thread::spawn(move || looping.request_loop(&|| true));

        let (_first, reply) = connect(&server);
        assert_eq!(reply.msg_type, MessageType::ConnectOk);
        assert_eq!(server.pool().num_busy(), 1);

        let (_second, reply) = connect(&server);
        assert_eq!(reply.msg_type, MessageType::ConnectFail);
        let reason = JsonSerializer.loads(&reply.payload).unwrap();
        assert_eq!(reason, json!(NO_FREE_WORKERS));

        server.dispatcher.shutdown();
        server.wakeup();
        handle.join().unwrap().unwrap();
        server.close();
    }

    #[test]
    fn test_client_entry_removed_after_panic() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let conn = Arc::new(Connection::new(remoto_common::transport::Stream::Unix(a)));
        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        clients.lock().insert(conn.id(), Arc::clone(&conn));

        let entry = ClientEntry {
            clients: Arc::clone(&clients),
            id: conn.id(),
        };
        let served = thread::spawn(move || {
            let _entry = entry;
            panic!("serving failed");
        });
        assert!(served.join().is_err());
        assert!(clients.lock().is_empty());
    }

    #[test]
    fn test_events_unsupported() {
        let server = server(Config::default());
        assert!(matches!(server.events(&[]), Err(RemotoError::Unsupported(_))));
        assert_eq!(server.sockets().len(), 1);
        server.close();
    }
}
