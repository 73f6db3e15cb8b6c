//! Daemon
//!
//! The [`Daemon`] owns a listening socket, the registry of exposed objects and
//! one of the two transport servers. Request handling itself lives in the
//! [`Dispatcher`], which both servers share:
//!
//! - `handshake` answers a new connection's `CONNECT` with `CONNECTOK` or
//!   `CONNECTFAIL`
//! - `handle_request` reads one `INVOKE` or `PING` from a connection and
//!   answers it
//!
//! # Example
//!
//! ```no_run
//! use remoto_common::Config;
//! use remoto_server::{CallArgs, Daemon, Exposed, ExposedTable};
//! use std::sync::Arc;
//!
//! struct Greeter;
//!
//! impl Exposed for Greeter {
//!     fn expose(table: &mut ExposedTable<Self>) {
//!         table.method("greet", |_, args: &CallArgs| {
//!             let name: String = args.get(0, "name")?;
//!             Ok(format!("hello, {}", name).into())
//!         });
//!     }
//! }
//!
//! let daemon = Daemon::new(Config::default().with_port(9090)).unwrap();
//! let uri = daemon.register(Arc::new(Greeter), Some("greeter")).unwrap();
//! println!("serving {}", uri);
//! daemon.request_loop().unwrap();
//! ```

use std::any::{Any, TypeId};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Mutex, RwLock};
use remoto_common::context::{self, random_hex, ClientInfo, CorrelationId};
use remoto_common::transport::{Connection, Listener};
use remoto_common::{
    serializer_for_id, Annotations, JsonSerializer, Config, Flags, Location, Message, MessageType, ObjectMetadata,
    RemoteError, RemotoError, Result, Serializer, ServerType, Uri, WireConfig,
    ANNOTATION_CORRELATION, ANNOTATION_STREAM, DAEMON_OBJECT_ID,
};
use serde_json::{json, Map, Value};

use crate::expose::{build_table, Bound, CallArgs, Exposed, ExposedTable, RemoteObject, Reply};
use crate::registry::{ObjectRef, Registry};
use crate::server::{self, EventSource, SocketServer};
use crate::streams::StreamTable;
use crate::worker_pool::panic_message;

/// Decides whether a client may connect. Receives the client's handshake
/// data; the returned value is sent back, an `Err` rejects the connection.
pub type HandshakeValidator =
    Arc<dyn Fn(&Connection, &Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Called after a client connection is gone.
pub type DisconnectHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Produces extra annotations attached to every response.
pub type AnnotationsHook = Arc<dyn Fn() -> Annotations + Send + Sync>;

#[derive(Default)]
struct Hooks {
    validate_handshake: RwLock<Option<HandshakeValidator>>,
    client_disconnect: RwLock<Option<DisconnectHook>>,
    annotations: RwLock<Option<AnnotationsHook>>,
}

/// Request handling shared by the transport servers.
pub(crate) struct Dispatcher {
    config: Arc<Config>,
    wire: WireConfig,
    location: Location,
    registry: Mutex<Registry>,
    tables: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    streams: StreamTable,
    hooks: Hooks,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(config: Arc<Config>, location: Location) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Dispatcher>| {
            let mut registry = Registry::default();
            let daemon_object = Bound::new(
                Arc::new(DaemonObject {
                    dispatcher: weak.clone(),
                }),
                Arc::new(build_table::<DaemonObject>()),
            );
            if let Err(e) = registry.insert(DAEMON_OBJECT_ID.to_string(), Arc::new(daemon_object)) {
                tracing::error!("cannot register daemon object: {}", e);
            }

            Self {
                wire: WireConfig::from(config.as_ref()),
                streams: StreamTable::new(config.iter_stream_lifetime, config.iter_stream_linger),
                config,
                location,
                registry: Mutex::new(registry),
                tables: Mutex::new(HashMap::new()),
                hooks: Hooks::default(),
                shutting_down: AtomicBool::new(false),
            }
        })
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn location(&self) -> &Location {
        &self.location
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// The capability table of `T`, built once per type.
    fn table_for<T: Exposed>(&self) -> Arc<ExposedTable<T>> {
        let cached = self
            .tables
            .lock()
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(build_table::<T>()) as Arc<dyn Any + Send + Sync>)
            .clone();
        match cached.downcast::<ExposedTable<T>>() {
            Ok(table) => table,
            Err(_) => Arc::new(build_table::<T>()),
        }
    }

    fn register<T: Exposed>(&self, instance: Arc<T>, id: Option<&str>) -> Result<Uri> {
        let id = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("obj_{}", random_hex(16)),
        };
        let object: Arc<dyn RemoteObject> = Arc::new(Bound::new(instance, self.table_for::<T>()));
        let type_name = object.type_name();
        self.registry.lock().insert(id.clone(), object)?;
        tracing::debug!(object = %id, kind = type_name, "object registered");
        Ok(Uri::new(id, self.location.clone()))
    }

    fn unregister(&self, target: ObjectRef) -> bool {
        let mut registry = self.registry.lock();
        let Some(id) = registry.resolve(&target) else {
            return false;
        };
        if id == DAEMON_OBJECT_ID {
            tracing::debug!("ignoring request to unregister the daemon object");
            return false;
        }
        let removed = registry.remove(&id).is_some();
        if removed {
            tracing::debug!(object = %id, "object unregistered");
        }
        removed
    }

    fn uri_for(&self, target: ObjectRef) -> Result<Uri> {
        let id = match target {
            ObjectRef::Id(id) => id,
            instance => self
                .registry
                .lock()
                .resolve(&instance)
                .ok_or_else(|| RemotoError::Daemon("object isn't registered".to_string()))?,
        };
        Ok(Uri::new(id, self.location.clone()))
    }

    fn registered_ids(&self) -> Vec<String> {
        self.registry.lock().ids()
    }

    fn metadata_for(&self, object_id: &str) -> std::result::Result<ObjectMetadata, RemoteError> {
        let object = self.registry.lock().get(object_id);
        object
            .map(|o| o.metadata())
            .ok_or_else(|| RemoteError::new("DaemonError", format!("unknown object '{}'", object_id)))
    }

    fn info(&self) -> String {
        format!(
            "Remoto daemon bound on {}, with {} objects registered. Servertype: {}",
            self.location,
            self.registry.lock().len(),
            self.config.server_type
        )
    }

    /// Drops every user object and all parked streams.
    fn clear(&self) {
        self.registry.lock().retain_only(&[DAEMON_OBJECT_ID]);
        self.streams.clear();
    }

    fn response_annotations(&self) -> Annotations {
        let mut annotations = match self.hooks.annotations.read().as_ref() {
            Some(hook) => hook(),
            None => Annotations::new(),
        };
        if let Some(id) = context::correlation_id() {
            annotations.insert(ANNOTATION_CORRELATION, id.as_bytes().to_vec());
        }
        annotations
    }

    #[allow(clippy::too_many_arguments)]
    fn reply(
        &self,
        conn: &Connection,
        msg_type: MessageType,
        seq: u16,
        serializer: &dyn Serializer,
        value: &Value,
        flags: Flags,
        extra: Annotations,
    ) -> Result<()> {
        let payload = serializer.dumps(value)?;
        let mut annotations = self.response_annotations();
        annotations.extend(extra);
        Message::new(msg_type, payload, serializer.id(), flags, seq)
            .with_annotations(annotations)
            .send(conn, &self.wire)
    }

    fn reply_error(&self, conn: &Connection, seq: u16, serializer: &dyn Serializer, err: &RemoteError) -> Result<()> {
        self.reply(
            conn,
            MessageType::Result,
            seq,
            serializer,
            &err.to_value(),
            Flags::EXCEPTION,
            Annotations::new(),
        )
    }

    fn install_context(&self, conn: &Connection, msg: &Message) {
        if let Some(id) = msg.annotation(ANNOTATION_CORRELATION).and_then(CorrelationId::from_bytes) {
            context::set_correlation_id(Some(id));
        }
        context::set_client(Some(ClientInfo {
            connection_id: conn.id(),
            peer: conn.peer().to_string(),
        }));
    }

    /// Performs the connection handshake. Returns whether the connection was
    /// accepted; a rejected connection has been closed.
    pub(crate) fn handshake(&self, conn: &Connection) -> bool {
        let msg = match Message::recv(conn, Some(&[MessageType::Connect]), &self.wire) {
            Ok(msg) => msg,
            Err(e) => {
                match &e {
                    RemotoError::ConnectionClosed { .. } => tracing::debug!(peer = %conn.peer(), "client went away during handshake"),
                    _ => tracing::warn!(peer = %conn.peer(), "handshake failed: {}", e),
                }
                conn.close();
                return false;
            }
        };

        let correlation = msg
            .annotation(ANNOTATION_CORRELATION)
            .and_then(CorrelationId::from_bytes)
            .unwrap_or_else(CorrelationId::random);
        context::set_correlation_id(Some(correlation));
        self.install_context(conn, &msg);

        let serializer = match serializer_for_id(msg.serializer_id) {
            Ok(s) => s,
            Err(e) => {
                self.deny(conn, msg.seq, &e.to_string());
                return false;
            }
        };

        match self.handshake_response(conn, &msg, serializer) {
            Ok((response, flags)) => {
                match self.reply(conn, MessageType::ConnectOk, msg.seq, serializer, &response, flags, Annotations::new()) {
                    Ok(()) => {
                        tracing::debug!(connection = conn.id(), peer = %conn.peer(), "client connected");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(peer = %conn.peer(), "could not complete handshake: {}", e);
                        conn.close();
                        false
                    }
                }
            }
            Err(reason) => {
                tracing::warn!(peer = %conn.peer(), "connection refused: {}", reason);
                if let Err(e) = self.reply(
                    conn,
                    MessageType::ConnectFail,
                    msg.seq,
                    serializer,
                    &Value::String(reason),
                    Flags::NONE,
                    Annotations::new(),
                ) {
                    tracing::debug!("could not send CONNECTFAIL: {}", e);
                }
                conn.close();
                false
            }
        }
    }

    fn handshake_response(
        &self,
        conn: &Connection,
        msg: &Message,
        serializer: &dyn Serializer,
    ) -> std::result::Result<(Value, Flags), String> {
        let data = serializer.loads(&msg.payload).map_err(|e| e.to_string())?;
        let handshake = data.get("handshake").cloned().unwrap_or(Value::Null);

        let validator = self.hooks.validate_handshake.read().clone();
        let response = match validator {
            Some(validate) => {
                catch_unwind(AssertUnwindSafe(|| validate(conn, &handshake)))
                    .map_err(|panic| format!("handshake validation panicked: {}", panic_message(panic.as_ref())))??
            }
            None => Value::String("hello".to_string()),
        };

        if !msg.flags.contains(Flags::META_ON_CONNECT) {
            return Ok((response, Flags::NONE));
        }
        let object_id = data
            .get("object")
            .and_then(Value::as_str)
            .ok_or_else(|| "metadata requested without an object id".to_string())?;
        let meta = self.metadata_for(object_id).map_err(|e| e.message)?;
        let meta = serde_json::to_value(meta).map_err(|e| e.to_string())?;
        Ok((json!({ "handshake": response, "meta": meta }), Flags::META_ON_CONNECT))
    }

    /// Refuses a connection whose handshake has not been read yet.
    pub(crate) fn deny_connection(&self, conn: &Connection, reason: &str) {
        let _ = conn.set_timeout(Some(std::time::Duration::from_secs(1)));
        let seq = match Message::recv(conn, Some(&[MessageType::Connect]), &self.wire) {
            Ok(msg) => msg.seq,
            Err(_) => 0,
        };
        self.deny(conn, seq, reason);
    }

    fn deny(&self, conn: &Connection, seq: u16, reason: &str) {
        tracing::warn!(peer = %conn.peer(), "connection refused: {}", reason);
        let serializer = self.default_serializer();
        let _ = self.reply(
            conn,
            MessageType::ConnectFail,
            seq,
            serializer,
            &Value::String(reason.to_string()),
            Flags::NONE,
            Annotations::new(),
        );
        conn.close();
    }

    fn default_serializer(&self) -> &'static dyn Serializer {
        self.config.serializer().unwrap_or(&JsonSerializer)
    }

    /// Reads and answers one request.
    ///
    /// # Errors
    ///
    /// Returns communication errors; the caller must then drop the
    /// connection. Errors raised by the invoked method are sent to the client
    /// and do not surface here.
    pub(crate) fn handle_request(&self, conn: &Connection) -> Result<()> {
        let msg = Message::recv(conn, Some(&[MessageType::Invoke, MessageType::Ping]), &self.wire)?;
        self.install_context(conn, &msg);

        let serializer = match serializer_for_id(msg.serializer_id) {
            Ok(s) => s,
            Err(e) => return self.reply_error(conn, msg.seq, self.default_serializer(), &e.to_remote()),
        };

        if msg.msg_type == MessageType::Ping {
            return self.reply(
                conn,
                MessageType::Result,
                msg.seq,
                serializer,
                &Value::String("pong".to_string()),
                Flags::NONE,
                Annotations::new(),
            );
        }

        let oneway = msg.flags.contains(Flags::ONEWAY);
        let call = match serializer.loads_call(&msg.payload) {
            Ok(call) => call,
            Err(e) if oneway => {
                tracing::warn!("undecodable one-way call: {}", e);
                return Ok(());
            }
            Err(e) => return self.reply_error(conn, msg.seq, serializer, &e.to_remote()),
        };

        let Some(object) = self.registry.lock().get(&call.object_id) else {
            let err = RemoteError::new("DaemonError", format!("unknown object '{}'", call.object_id));
            if oneway {
                tracing::warn!("one-way call failed: {}", err);
                return Ok(());
            }
            return self.reply_error(conn, msg.seq, serializer, &err);
        };

        if msg.flags.contains(Flags::BATCH) {
            let entries = call.args;
            if oneway {
                let object_id = call.object_id;
                let run = move || {
                    run_batch(&object, &object_id, &entries);
                };
                if self.config.oneway_threaded {
                    self.run_detached(run);
                } else {
                    run();
                }
                return Ok(());
            }
            let results = run_batch(&object, &call.object_id, &entries);
            return self.reply(
                conn,
                MessageType::Result,
                msg.seq,
                serializer,
                &Value::Array(results),
                Flags::NONE,
                Annotations::new(),
            );
        }

        let args = CallArgs::new(call.args, call.kwargs);
        if oneway {
            let object_id = call.object_id;
            let method = call.method;
            let run = move || {
                if let Err(err) = invoke_guarded(&object, &object_id, &method, &args) {
                    tracing::warn!(object = %object_id, method = %method, "one-way call failed: {}", err);
                }
            };
            if self.config.oneway_threaded {
                self.run_detached(run);
            } else {
                run();
            }
            return Ok(());
        }

        match invoke_guarded(&object, &call.object_id, &call.method, &args) {
            Ok(Reply::Value(value)) => {
                match self.reply(conn, MessageType::Result, msg.seq, serializer, &value, Flags::NONE, Annotations::new()) {
                    Err(RemotoError::Serialize(e)) => {
                        let err = RemoteError::new("SerializeError", format!("cannot serialize result: {}", e));
                        self.reply_error(conn, msg.seq, serializer, &err)
                    }
                    other => other,
                }
            }
            Ok(Reply::Stream(stream)) if !self.config.iter_streaming => {
                let items: Vec<Value> = stream.collect();
                self.reply(
                    conn,
                    MessageType::Result,
                    msg.seq,
                    serializer,
                    &Value::Array(items),
                    Flags::NONE,
                    Annotations::new(),
                )
            }
            Ok(Reply::Stream(stream)) => {
                let stream_id = self.streams.insert(conn.id(), stream);
                let mut extra = Annotations::new();
                extra.insert(ANNOTATION_STREAM, stream_id.as_bytes().to_vec());
                self.reply(
                    conn,
                    MessageType::Result,
                    msg.seq,
                    serializer,
                    &Value::String(stream_id),
                    Flags::ITEM_STREAM_RESULT,
                    extra,
                )
            }
            Err(err) => self.reply_error(conn, msg.seq, serializer, &err),
        }
    }

    /// Runs a one-way call on its own thread, carrying the call context.
    fn run_detached(&self, job: impl FnOnce() + Send + 'static) {
        let correlation = context::correlation_id();
        let client = context::client();
        let spawned = thread::Builder::new()
            .name("remoto-oneway".to_string())
            .spawn(move || {
                context::set_correlation_id(correlation);
                context::set_client(client);
                job();
            });
        if let Err(e) = spawned {
            tracing::error!("could not start one-way call thread: {}", e);
        }
    }

    /// Cleans up after a client connection ended.
    pub(crate) fn client_disconnected(&self, conn: &Connection) {
        self.streams.client_disconnected(conn.id());
        let hook = self.hooks.client_disconnect.read().clone();
        if let Some(hook) = hook {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(conn))) {
                tracing::error!("client disconnect hook panicked: {}", panic_message(panic.as_ref()));
            }
        }
        tracing::debug!(connection = conn.id(), peer = %conn.peer(), "client disconnected");
    }

    /// Periodic maintenance run by the servers.
    pub(crate) fn housekeeping(&self) {
        let expired = self.streams.housekeeping();
        if expired > 0 {
            tracing::debug!(expired = expired, "expired item streams removed");
        }
    }
}

/// Invokes a method, turning a panic into a remote error.
fn invoke_guarded(
    object: &Arc<dyn RemoteObject>,
    object_id: &str,
    method: &str,
    args: &CallArgs,
) -> std::result::Result<Reply, RemoteError> {
    let outcome = catch_unwind(AssertUnwindSafe(|| object.invoke(method, args)));
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let mut err = RemoteError::new("PanicError", panic_message(panic.as_ref()));
            for line in Backtrace::force_capture().to_string().lines() {
                err = err.with_trace_line(line);
            }
            Err(err)
        }
    };
    result.map_err(|mut err| {
        err.remote_trace
            .push(format!("in method '{}' of object '{}' ({})", method, object_id, object.type_name()));
        tracing::debug!(object = %object_id, method = %method, "call raised {}", err);
        err
    })
}

/// Runs batch entries in order, stopping at the first error, which becomes
/// the last result.
fn run_batch(object: &Arc<dyn RemoteObject>, object_id: &str, entries: &[Value]) -> Vec<Value> {
    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let outcome = parse_batch_entry(entry)
            .and_then(|(method, args)| invoke_guarded(object, object_id, &method, &args));
        match outcome {
            Ok(Reply::Value(value)) => results.push(value),
            Ok(Reply::Stream(_)) => {
                let err = RemoteError::new("StreamError", "item streams cannot be returned from a batch call");
                results.push(err.to_value());
                break;
            }
            Err(err) => {
                results.push(err.to_value());
                break;
            }
        }
    }
    results
}

fn parse_batch_entry(entry: &Value) -> std::result::Result<(String, CallArgs), RemoteError> {
    let invalid = || RemoteError::new("ProtocolError", "invalid batch entry");
    let parts = entry.as_array().ok_or_else(invalid)?;
    let method = parts.first().and_then(Value::as_str).ok_or_else(invalid)?;
    let args = match parts.get(1) {
        Some(Value::Array(args)) => args.clone(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(invalid()),
    };
    let kwargs = match parts.get(2) {
        Some(Value::Object(kwargs)) => kwargs.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(_) => return Err(invalid()),
    };
    Ok((method.to_string(), CallArgs::new(args, kwargs)))
}

/// The reserved object every daemon serves under [`DAEMON_OBJECT_ID`].
struct DaemonObject {
    dispatcher: Weak<Dispatcher>,
}

impl DaemonObject {
    fn dispatcher(&self) -> std::result::Result<Arc<Dispatcher>, RemoteError> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| RemoteError::new("DaemonError", "daemon is gone"))
    }
}

impl Exposed for DaemonObject {
    fn expose(table: &mut ExposedTable<Self>) {
        table
            .method("ping", |_, _| Ok(Value::Null))
            .method("registered", |d, _| Ok(json!(d.dispatcher()?.registered_ids())))
            .method("info", |d, _| Ok(Value::String(d.dispatcher()?.info())))
            .method("get_metadata", |d, args| {
                let object_id: String = args.get(0, "object_id")?;
                let meta = d.dispatcher()?.metadata_for(&object_id)?;
                serde_json::to_value(meta).map_err(|e| RemoteError::new("SerializeError", e.to_string()))
            })
            .method("get_next_stream_item", |d, args| {
                let stream_id: String = args.get(0, "stream_id")?;
                let client = context::client().map(|c| c.connection_id);
                match d.dispatcher()?.streams.next_item(&stream_id, client)? {
                    Some(item) => Ok(item),
                    None => Err(RemoteError::new("StopIteration", "item stream exhausted")),
                }
            })
            .method("close_stream", |d, args| {
                let stream_id: String = args.get(0, "stream_id")?;
                d.dispatcher()?.streams.close(&stream_id);
                Ok(Value::Null)
            });
    }
}

/// A remote-object server.
///
/// Dropping the daemon closes it.
pub struct Daemon {
    dispatcher: Arc<Dispatcher>,
    server: Box<dyn SocketServer>,
}

impl Daemon {
    /// Binds the configured location and starts the configured server type.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for an invalid configuration and an I/O or
    /// connection error if the socket cannot be bound.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let location = match &config.unix_socket {
            Some(path) => Location::Unix(path.clone()),
            None => Location::tcp(config.host.clone(), config.port),
        };
        let listener = Listener::bind(&location)?;
        let location = listener.location()?;
        let dispatcher = Dispatcher::new(Arc::clone(&config), location);
        let server = server::create(config.server_type, Arc::clone(&dispatcher), listener)?;
        tracing::info!(location = %dispatcher.location(), server_type = %config.server_type, "daemon started");
        Ok(Self { dispatcher, server })
    }

    pub fn location(&self) -> &Location {
        self.dispatcher.location()
    }

    pub fn config(&self) -> &Config {
        self.dispatcher.config()
    }

    pub fn server_type(&self) -> ServerType {
        self.server.server_type()
    }

    /// Registers an object, under `id` or a generated `obj_<hex>` id.
    ///
    /// # Errors
    ///
    /// Returns a `Daemon` error if the instance is already registered or the
    /// id is taken.
    pub fn register<T: Exposed>(&self, instance: Arc<T>, id: Option<&str>) -> Result<Uri> {
        self.dispatcher.register(instance, id)
    }

    /// Removes an object by id or instance. Unknown objects and the daemon's
    /// own object are ignored; returns whether something was removed.
    pub fn unregister(&self, target: impl Into<ObjectRef>) -> bool {
        self.dispatcher.unregister(target.into())
    }

    /// The URI of an object id, or of a registered instance.
    pub fn uri_for(&self, target: impl Into<ObjectRef>) -> Result<Uri> {
        self.dispatcher.uri_for(target.into())
    }

    /// Ids of all registered objects, the daemon's own included.
    pub fn registered(&self) -> Vec<String> {
        self.dispatcher.registered_ids()
    }

    pub fn set_handshake_validator(
        &self,
        validator: impl Fn(&Connection, &Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    ) {
        *self.dispatcher.hooks.validate_handshake.write() = Some(Arc::new(validator));
    }

    pub fn set_client_disconnect_hook(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        *self.dispatcher.hooks.client_disconnect.write() = Some(Arc::new(hook));
    }

    pub fn set_annotations_hook(&self, hook: impl Fn() -> Annotations + Send + Sync + 'static) {
        *self.dispatcher.hooks.annotations.write() = Some(Arc::new(hook));
    }

    /// Serves requests until [`Daemon::shutdown`] is called.
    pub fn request_loop(&self) -> Result<()> {
        self.request_loop_while(|| true)
    }

    /// Serves requests while `condition` holds; it is checked at least once
    /// per poll timeout.
    pub fn request_loop_while(&self, condition: impl Fn() -> bool) -> Result<()> {
        tracing::info!(location = %self.location(), "daemon entering request loop");
        let result = self.server.request_loop(&condition);
        tracing::info!("daemon request loop finished");
        result
    }

    /// Lets `other` be served from this daemon's loop. Only the multiplexed
    /// server supports this.
    pub fn combine(&self, other: Arc<dyn EventSource>) -> Result<()> {
        self.server.combine_loop(other)
    }

    /// Makes the request loop return.
    pub fn shutdown(&self) {
        if !self.dispatcher.is_shutting_down() {
            tracing::info!("daemon shutting down");
        }
        self.dispatcher.shutdown();
        self.server.wakeup();
    }

    /// Shuts down and releases clients, objects and streams.
    pub fn close(&self) {
        self.shutdown();
        self.server.close();
        self.dispatcher.clear();
    }

    pub fn info(&self) -> String {
        self.dispatcher.info()
    }
}

impl EventSource for Daemon {
    fn sockets(&self) -> Vec<RawFd> {
        self.server.sockets()
    }

    fn events(&self, ready: &[RawFd]) -> Result<()> {
        self.server.events(ready)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Calc {
        calls: AtomicUsize,
    }

    impl Exposed for Calc {
        fn expose(table: &mut ExposedTable<Self>) {
            table
                .method("multiply", |c, args| {
                    c.calls.fetch_add(1, Ordering::SeqCst);
                    let a: i64 = args.get(0, "a")?;
                    let b: i64 = args.get(1, "b")?;
                    Ok(json!(a * b))
                })
                .method("fail", |_, _| Err(RemoteError::new("ValueError", "bad")))
                .method("explode", |_, _| panic!("kaboom"))
                .stream("range", |_, args| {
                    let n: i64 = args.get(0, "n")?;
                    Ok((0..n).map(Value::from))
                });
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(Arc::new(Config::default()), Location::tcp("127.0.0.1", 1))
    }

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Connection::new(remoto_common::transport::Stream::Unix(a)),
            Connection::new(remoto_common::transport::Stream::Unix(b)),
        )
    }

    fn send_call(client: &Connection, object: &str, method: &str, args: Vec<Value>, flags: Flags, seq: u16) {
        let payload = JsonSerializer.dumps_call(object, method, &args, &Map::new()).unwrap();
        Message::new(MessageType::Invoke, payload, JsonSerializer.id(), flags, seq)
            .send(client, &WireConfig::default())
            .unwrap();
    }

    fn read_reply(client: &Connection) -> (Message, Value) {
        let reply = Message::recv(client, Some(&[MessageType::Result]), &WireConfig::default()).unwrap();
        let value = JsonSerializer.loads(&reply.payload).unwrap();
        (reply, value)
    }

    #[test]
    fn test_daemon_object_registered() {
        let d = dispatcher();
        assert_eq!(d.registered_ids(), vec![DAEMON_OBJECT_ID.to_string()]);
        assert!(!d.unregister(ObjectRef::from(DAEMON_OBJECT_ID)));
        assert_eq!(d.registered_ids().len(), 1);
    }

    #[test]
    fn test_register_generates_id() {
        let d = dispatcher();
        let uri = d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), None).unwrap();
        assert!(uri.object_id.starts_with("obj_"));
        assert_eq!(uri.object_id.len(), 4 + 32);
    }

    #[test]
    fn test_register_twice_fails() {
        let d = dispatcher();
        let calc = Arc::new(Calc { calls: AtomicUsize::new(0) });
        d.register(Arc::clone(&calc), Some("calc")).unwrap();
        assert!(matches!(d.register(Arc::clone(&calc), Some("other")), Err(RemotoError::Daemon(_))));
        assert!(d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), Some("calc")).is_err());

        assert_eq!(d.uri_for(ObjectRef::from(&calc)).unwrap().object_id, "calc");
        assert!(d.unregister(ObjectRef::from(&calc)));
        assert!(!d.unregister(ObjectRef::from("calc")));
        assert!(d.uri_for(ObjectRef::from(&calc)).is_err());
    }

    #[test]
    fn test_tables_cached_per_type() {
        let d = dispatcher();
        let a = d.table_for::<Calc>();
        let b = d.table_for::<Calc>();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_invoke_and_reply_seq() {
        let d = dispatcher();
        d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), Some("calc")).unwrap();
        let (client, server) = pair();

        send_call(&client, "calc", "multiply", vec![json!(6), json!(7)], Flags::NONE, 41);
        d.handle_request(&server).unwrap();
        let (reply, value) = read_reply(&client);
        assert_eq!(reply.seq, 41);
        assert_eq!(value, json!(42));
        assert!(!reply.flags.contains(Flags::EXCEPTION));
    }

    #[test]
    fn test_ping() {
        let d = dispatcher();
        let (client, server) = pair();
        Message::new(MessageType::Ping, b"ping".to_vec(), JsonSerializer.id(), Flags::NONE, 9)
            .send(&client, &WireConfig::default())
            .unwrap();
        d.handle_request(&server).unwrap();
        let (reply, value) = read_reply(&client);
        assert_eq!(reply.seq, 9);
        assert_eq!(value, json!("pong"));
    }

    #[test]
    fn test_remote_error_reply() {
        let d = dispatcher();
        d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), Some("calc")).unwrap();
        let (client, server) = pair();

        send_call(&client, "calc", "fail", vec![], Flags::NONE, 1);
        d.handle_request(&server).unwrap();
        let (reply, value) = read_reply(&client);
        assert!(reply.flags.contains(Flags::EXCEPTION));
        let err = RemoteError::from_value(&value).unwrap();
        assert_eq!(err.kind, "ValueError");
        assert!(err.remote_trace.iter().any(|l| l.contains("'fail'")));
    }

    #[test]
    fn test_panic_becomes_error() {
        let d = dispatcher();
        d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), Some("calc")).unwrap();
        let (client, server) = pair();

        send_call(&client, "calc", "explode", vec![], Flags::NONE, 1);
        d.handle_request(&server).unwrap();
        let (_, value) = read_reply(&client);
        let err = RemoteError::from_value(&value).unwrap();
        assert_eq!(err.kind, "PanicError");
        assert_eq!(err.message, "kaboom");
    }

    #[test]
    fn test_unknown_object() {
        let d = dispatcher();
        let (client, server) = pair();
        send_call(&client, "nope", "x", vec![], Flags::NONE, 1);
        d.handle_request(&server).unwrap();
        let (_, value) = read_reply(&client);
        assert_eq!(RemoteError::from_value(&value).unwrap().kind, "DaemonError");
    }

    #[test]
    fn test_oneway_sends_nothing() {
        let d = Dispatcher::new(
            Arc::new(Config::default().with_oneway_threaded(false)),
            Location::tcp("127.0.0.1", 1),
        );
        let calc = Arc::new(Calc { calls: AtomicUsize::new(0) });
        d.register(Arc::clone(&calc), Some("calc")).unwrap();
        let (client, server) = pair();

        send_call(&client, "calc", "multiply", vec![json!(2), json!(3)], Flags::ONEWAY, 1);
        d.handle_request(&server).unwrap();
        assert_eq!(calc.calls.load(Ordering::SeqCst), 1);

        // the next reply on the wire belongs to the ping
        Message::new(MessageType::Ping, vec![], JsonSerializer.id(), Flags::NONE, 2)
            .send(&client, &WireConfig::default())
            .unwrap();
        d.handle_request(&server).unwrap();
        let (reply, _) = read_reply(&client);
        assert_eq!(reply.seq, 2);
    }

    #[test]
    fn test_batch_stops_at_first_error() {
        let d = dispatcher();
        let calc = Arc::new(Calc { calls: AtomicUsize::new(0) });
        d.register(Arc::clone(&calc), Some("calc")).unwrap();
        let (client, server) = pair();

        let entries = vec![
            json!(["multiply", [2, 3], {}]),
            json!(["fail", [], {}]),
            json!(["multiply", [4, 5], {}]),
        ];
        send_call(&client, "calc", remoto_common::BATCH_METHOD, entries, Flags::BATCH, 3);
        d.handle_request(&server).unwrap();
        let (reply, value) = read_reply(&client);
        assert!(!reply.flags.contains(Flags::EXCEPTION));
        let results = value.as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], json!(6));
        assert_eq!(RemoteError::from_value(&results[1]).unwrap().kind, "ValueError");
        assert_eq!(calc.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_result_and_pull() {
        let d = dispatcher();
        d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), Some("calc")).unwrap();
        let (client, server) = pair();

        send_call(&client, "calc", "range", vec![json!(2)], Flags::NONE, 1);
        d.handle_request(&server).unwrap();
        let (reply, value) = read_reply(&client);
        assert!(reply.flags.contains(Flags::ITEM_STREAM_RESULT));
        let stream_id = value.as_str().unwrap().to_string();
        assert_eq!(reply.annotation(ANNOTATION_STREAM), Some(stream_id.as_bytes()));

        let mut items = Vec::new();
        for seq in 2..5 {
            send_call(&client, DAEMON_OBJECT_ID, "get_next_stream_item", vec![json!(stream_id)], Flags::NONE, seq);
            d.handle_request(&server).unwrap();
            items.push(read_reply(&client));
        }
        assert_eq!(items[0].1, json!(0));
        assert_eq!(items[1].1, json!(1));
        assert!(items[2].0.flags.contains(Flags::EXCEPTION));
        assert_eq!(RemoteError::from_value(&items[2].1).unwrap().kind, "StopIteration");
    }

    #[test]
    fn test_stream_collected_when_streaming_disabled() {
        let d = Dispatcher::new(
            Arc::new(Config::default().with_iter_streaming(false)),
            Location::tcp("127.0.0.1", 1),
        );
        d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), Some("calc")).unwrap();
        let (client, server) = pair();
        send_call(&client, "calc", "range", vec![json!(3)], Flags::NONE, 1);
        d.handle_request(&server).unwrap();
        let (_, value) = read_reply(&client);
        assert_eq!(value, json!([0, 1, 2]));
    }

    fn send_connect(client: &Connection, data: Value, flags: Flags) {
        Message::new(
            MessageType::Connect,
            JsonSerializer.dumps(&data).unwrap(),
            JsonSerializer.id(),
            flags,
            0,
        )
        .send(client, &WireConfig::default())
        .unwrap();
    }

    #[test]
    fn test_handshake_with_metadata() {
        let d = dispatcher();
        d.register(Arc::new(Calc { calls: AtomicUsize::new(0) }), Some("calc")).unwrap();
        let (client, server) = pair();

        send_connect(&client, json!({"handshake": null, "object": "calc"}), Flags::META_ON_CONNECT);
        assert!(d.handshake(&server));
        let reply = Message::recv(&client, None, &WireConfig::default()).unwrap();
        assert_eq!(reply.msg_type, MessageType::ConnectOk);
        let value = JsonSerializer.loads(&reply.payload).unwrap();
        assert_eq!(value["handshake"], json!("hello"));
        let meta: ObjectMetadata = serde_json::from_value(value["meta"].clone()).unwrap();
        assert!(meta.methods.contains("multiply"));
    }

    #[test]
    fn test_handshake_rejected_by_validator() {
        let d = dispatcher();
        *d.hooks.validate_handshake.write() = Some(Arc::new(|_: &Connection, data: &Value| {
            if data == &json!("let me in") {
                Ok(json!("welcome"))
            } else {
                Err("go away".to_string())
            }
        }));
        let (client, server) = pair();
        send_connect(&client, json!({"handshake": "knock"}), Flags::NONE);
        assert!(!d.handshake(&server));
        let reply = Message::recv(&client, None, &WireConfig::default()).unwrap();
        assert_eq!(reply.msg_type, MessageType::ConnectFail);
        assert_eq!(JsonSerializer.loads(&reply.payload).unwrap(), json!("go away"));
        assert!(server.is_closed());
    }

    #[test]
    fn test_handshake_unknown_object_metadata() {
        let d = dispatcher();
        let (client, server) = pair();
        send_connect(&client, json!({"handshake": null, "object": "ghost"}), Flags::META_ON_CONNECT);
        assert!(!d.handshake(&server));
        let reply = Message::recv(&client, None, &WireConfig::default()).unwrap();
        assert_eq!(reply.msg_type, MessageType::ConnectFail);
    }

    #[test]
    fn test_disconnect_hook_called() {
        let d = dispatcher();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        *d.hooks.client_disconnect.write() = Some(Arc::new(move |_: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let (_client, server) = pair();
        d.client_disconnected(&server);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_client_is_communication_error() {
        let d = dispatcher();
        let (client, server) = pair();
        drop(client);
        server.set_timeout(Some(Duration::from_secs(1))).unwrap();
        let err = d.handle_request(&server).unwrap_err();
        assert!(err.is_communication_error());
    }

    #[test]
    fn test_info_mentions_location() {
        let d = dispatcher();
        assert!(d.info().contains("127.0.0.1:1"));
    }
}
