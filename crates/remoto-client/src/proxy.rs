//! Proxies
//!
//! A [`Proxy`] stands in for one remote object. It connects lazily on the
//! first call, performs the handshake (optionally fetching the object's
//! metadata), and then sends one `INVOKE` per call over its connection,
//! waiting for the `RESULT` with the matching sequence number.
//!
//! Calls made through the same proxy are serialized; share a proxy between
//! threads only if that is acceptable, or clone it to get an independent
//! connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use remoto_common::context;
use remoto_common::transport::Connection;
use remoto_common::{
    serializer_for_id, Annotations, Config, Flags, Message, MessageType, ObjectMetadata, RemoteError,
    RemotoError, Result, Serializer, Uri, WireConfig, ANNOTATION_CORRELATION, ANNOTATION_STREAM,
    BATCH_METHOD, DAEMON_OBJECT_ID, GETATTR_METHOD, SETATTR_METHOD,
};
use serde_json::{Map, Value};

/// Delay between attempts of [`Proxy::reconnect`].
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// What one invocation produced.
pub(crate) enum Outcome {
    Value(Value),
    /// Id of an item stream parked on the daemon
    Stream(String),
    /// One-way call; nothing came back
    Sent,
}

struct ProxyState {
    conn: Option<Connection>,
    seq: u16,
    timeout: Option<Duration>,
    metadata: Option<ObjectMetadata>,
    handshake_response: Option<Value>,
    response_annotations: Annotations,
}

impl ProxyState {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            conn: None,
            seq: 0,
            timeout,
            metadata: None,
            handshake_response: None,
            response_annotations: Annotations::new(),
        }
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }
}

/// Client-side stand-in for a remote object.
///
/// # Example
///
/// ```no_run
/// use remoto_client::Proxy;
/// use remoto_common::Config;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let proxy = Proxy::parse("REMOTO:calc@localhost:9090", Arc::new(Config::default())).unwrap();
/// let product = proxy.call("multiply", vec![json!(6), json!(7)]).unwrap();
/// assert_eq!(product, json!(42));
/// ```
pub struct Proxy {
    uri: Uri,
    config: Arc<Config>,
    wire: WireConfig,
    serializer: &'static dyn Serializer,
    state: Mutex<ProxyState>,
    oneway: RwLock<HashSet<String>>,
    annotations: RwLock<Annotations>,
    handshake: RwLock<Value>,
}

impl Proxy {
    /// Creates an unconnected proxy.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the configured serializer is unknown.
    pub fn new(uri: Uri, config: Arc<Config>) -> Result<Self> {
        let serializer = config.serializer()?;
        Ok(Self {
            wire: WireConfig::from(config.as_ref()),
            state: Mutex::new(ProxyState::new(config.comm_timeout)),
            uri,
            config,
            serializer,
            oneway: RwLock::new(HashSet::new()),
            annotations: RwLock::new(Annotations::new()),
            handshake: RwLock::new(Value::Null),
        })
    }

    /// Creates a proxy from URI text.
    pub fn parse(uri: &str, config: Arc<Config>) -> Result<Self> {
        Self::new(uri.parse()?, config)
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Connects now instead of on the first call.
    pub fn bind(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.connect_locked(&mut state)
    }

    /// Closes the connection; the next call reconnects.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.conn.is_some() {
            tracing::debug!(uri = %self.uri, "releasing connection");
        }
        state.release();
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().conn.is_some()
    }

    /// Drops the connection and tries to connect again, `tries` times with
    /// [`RECONNECT_DELAY`] in between.
    pub fn reconnect(&self, tries: u32) -> Result<()> {
        self.reconnect_with_delay(tries, RECONNECT_DELAY)
    }

    pub fn reconnect_with_delay(&self, tries: u32, delay: Duration) -> Result<()> {
        self.release();
        for attempt in 1..=tries {
            match self.bind() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_communication_error() => {
                    tracing::debug!(uri = %self.uri, attempt = attempt, "reconnect failed: {}", e);
                    if attempt < tries {
                        thread::sleep(delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(RemotoError::closed("failed to reconnect"))
    }

    /// Socket timeout for connecting and for every send and receive.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        state.timeout = timeout;
        if let Some(conn) = &state.conn {
            conn.set_timeout(timeout)?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.state.lock().timeout
    }

    /// Data sent with the next handshake.
    pub fn set_handshake(&self, data: Value) {
        *self.handshake.write() = data;
    }

    /// What the daemon answered to the last handshake.
    pub fn handshake_response(&self) -> Option<Value> {
        self.state.lock().handshake_response.clone()
    }

    /// Marks methods as one-way; calling them returns as soon as the request
    /// is sent.
    pub fn set_oneway<I, S>(&self, methods: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.oneway.write().extend(methods.into_iter().map(Into::into));
    }

    pub fn oneway_methods(&self) -> HashSet<String> {
        self.oneway.read().clone()
    }

    /// Extra annotations sent with every message.
    pub fn set_annotations(&self, annotations: Annotations) {
        *self.annotations.write() = annotations;
    }

    /// Annotations of the last response.
    pub fn response_annotations(&self) -> Annotations {
        self.state.lock().response_annotations.clone()
    }

    /// Metadata received during the handshake, if it was requested.
    pub fn metadata(&self) -> Option<ObjectMetadata> {
        self.state.lock().metadata.clone()
    }

    /// Calls a remote method.
    ///
    /// One-way methods return `Value::Null`. A method that produces an item
    /// stream has its items collected into an array; use
    /// [`Proxy::call_stream`] to iterate them instead.
    ///
    /// # Errors
    ///
    /// - `Remote` if the method raised an error
    /// - `Attribute` if the metadata says the object has no such method
    /// - a communication error, after which the connection is released
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_kwargs(method, args, Map::new())
    }

    pub fn call_with_kwargs(&self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        match self.invoke(&self.uri.object_id, method, &args, &kwargs, Flags::NONE)? {
            Outcome::Value(value) => Ok(value),
            Outcome::Sent => Ok(Value::Null),
            Outcome::Stream(id) => ItemStream::remote(self, id)
                .collect::<Result<Vec<Value>>>()
                .map(Value::Array),
        }
    }

    /// Calls a method that produces an item stream and iterates its items.
    ///
    /// An ordinary array result is iterated locally.
    pub fn call_stream(&self, method: &str, args: Vec<Value>) -> Result<ItemStream<'_>> {
        match self.invoke(&self.uri.object_id, method, &args, &Map::new(), Flags::NONE)? {
            Outcome::Stream(id) => Ok(ItemStream::remote(self, id)),
            Outcome::Value(Value::Array(items)) => Ok(ItemStream::local(self, items)),
            Outcome::Value(_) | Outcome::Sent => Err(RemotoError::Protocol(format!(
                "method '{}' did not return an item stream",
                method
            ))),
        }
    }

    /// Reads an exposed attribute.
    pub fn get_attr(&self, name: &str) -> Result<Value> {
        self.check_attribute(name)?;
        self.call(GETATTR_METHOD, vec![Value::String(name.to_string())])
    }

    /// Writes an exposed attribute.
    pub fn set_attr(&self, name: &str, value: Value) -> Result<()> {
        self.check_attribute(name)?;
        self.call(SETATTR_METHOD, vec![Value::String(name.to_string()), value])
            .map(|_| ())
    }

    fn check_attribute(&self, name: &str) -> Result<()> {
        match self.metadata() {
            Some(meta) if !meta.attrs.contains(name) => Err(RemotoError::Attribute(format!(
                "remote object '{}' has no exposed attribute '{}'",
                self.uri, name
            ))),
            _ => Ok(()),
        }
    }

    /// Round trip to the daemon without invoking anything.
    pub fn ping(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.connect_locked(&mut state)?;
        state.seq = state.seq.wrapping_add(1);
        let msg = Message::new(MessageType::Ping, Vec::new(), self.serializer.id(), Flags::NONE, state.seq)
            .with_annotations(self.outgoing_annotations());
        match self.exchange(&state, &msg, true) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_communication_error() {
                    state.release();
                }
                Err(e)
            }
        }
    }

    /// Sends buffered batch entries; `None` for a one-way batch.
    pub(crate) fn invoke_batch(&self, entries: &[Value], oneway: bool) -> Result<Option<Vec<Value>>> {
        let mut flags = Flags::BATCH;
        if oneway {
            flags |= Flags::ONEWAY;
        }
        match self.invoke(&self.uri.object_id, BATCH_METHOD, entries, &Map::new(), flags)? {
            Outcome::Value(Value::Array(results)) => Ok(Some(results)),
            Outcome::Sent => Ok(None),
            _ => Err(RemotoError::Protocol("invalid batch result".to_string())),
        }
    }

    pub(crate) fn invoke(
        &self,
        object_id: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        flags: Flags,
    ) -> Result<Outcome> {
        let mut attempt = 0;
        loop {
            match self.invoke_once(object_id, method, args, kwargs, flags) {
                Err(e @ RemotoError::ConnectionClosed { .. }) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(uri = %self.uri, attempt = attempt, "retrying call of '{}': {}", method, e);
                }
                other => return other,
            }
        }
    }

    fn invoke_once(
        &self,
        object_id: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        flags: Flags,
    ) -> Result<Outcome> {
        let mut state = self.state.lock();
        self.connect_locked(&mut state)?;

        if object_id == self.uri.object_id && !flags.contains(Flags::BATCH) {
            if let Some(meta) = &state.metadata {
                if !meta.allows(method) {
                    return Err(RemotoError::Attribute(format!(
                        "remote object '{}' has no exposed attribute or method '{}'",
                        self.uri, method
                    )));
                }
            }
        }

        let mut flags = flags;
        if object_id == self.uri.object_id && self.oneway.read().contains(method) {
            flags |= Flags::ONEWAY;
        }

        state.seq = state.seq.wrapping_add(1);
        let payload = self.serializer.dumps_call(object_id, method, args, kwargs)?;
        let msg = Message::new(MessageType::Invoke, payload, self.serializer.id(), flags, state.seq)
            .with_annotations(self.outgoing_annotations());

        let reply = match self.exchange(&state, &msg, !flags.contains(Flags::ONEWAY)) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(Outcome::Sent),
            Err(e) => {
                if e.is_communication_error() {
                    tracing::debug!(uri = %self.uri, "dropping connection after error: {}", e);
                    state.release();
                }
                return Err(e);
            }
        };
        state.response_annotations = reply.annotations.clone();
        drop(state);

        decode_reply(&reply)
    }

    /// Sends `msg` and, if asked to, reads the matching reply.
    fn exchange(&self, state: &ProxyState, msg: &Message, expect_reply: bool) -> Result<Option<Message>> {
        let conn = state
            .conn
            .as_ref()
            .ok_or_else(|| RemotoError::closed("proxy is not connected"))?;
        msg.send(conn, &self.wire)?;
        if !expect_reply {
            return Ok(None);
        }
        let reply = Message::recv(conn, Some(&[MessageType::Result]), &self.wire)?;
        if reply.seq != msg.seq {
            return Err(RemotoError::Protocol("invoke: reply sequence out of sync".to_string()));
        }
        Ok(Some(reply))
    }

    fn outgoing_annotations(&self) -> Annotations {
        let mut annotations = self.annotations.read().clone();
        if let Some(id) = context::correlation_id() {
            annotations.insert(ANNOTATION_CORRELATION, id.as_bytes().to_vec());
        }
        annotations
    }

    fn connect_locked(&self, state: &mut ProxyState) -> Result<()> {
        if state.conn.is_some() {
            return Ok(());
        }

        let conn = Connection::connect(&self.uri.location, state.timeout)?
            .with_object_id(self.uri.object_id.clone());

        let mut data = Map::new();
        data.insert("handshake".to_string(), self.handshake.read().clone());
        let mut flags = Flags::NONE;
        if self.config.metadata {
            data.insert("object".to_string(), Value::String(self.uri.object_id.clone()));
            flags |= Flags::META_ON_CONNECT;
        }
        let msg = Message::new(
            MessageType::Connect,
            self.serializer.dumps(&Value::Object(data))?,
            self.serializer.id(),
            flags,
            0,
        )
        .with_annotations(self.outgoing_annotations());

        let reply = msg.send(&conn, &self.wire).and_then(|()| {
            Message::recv(
                &conn,
                Some(&[MessageType::ConnectOk, MessageType::ConnectFail]),
                &self.wire,
            )
        });
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };
        let value = serializer_for_id(reply.serializer_id)?.loads(&reply.payload)?;

        if reply.msg_type == MessageType::ConnectFail {
            conn.close();
            let reason = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            return Err(RemotoError::ConnectionRejected(format!(
                "connection to {} rejected: {}",
                self.uri.location, reason
            )));
        }

        if reply.flags.contains(Flags::META_ON_CONNECT) {
            let meta: ObjectMetadata = serde_json::from_value(value.get("meta").cloned().unwrap_or_default())?;
            self.oneway.write().extend(meta.oneway.iter().cloned());
            state.handshake_response = value.get("handshake").cloned();
            state.metadata = Some(meta);
        } else {
            state.handshake_response = Some(value);
        }
        state.response_annotations = reply.annotations;
        state.conn = Some(conn);
        tracing::debug!(uri = %self.uri, "connected");
        Ok(())
    }
}

fn decode_reply(reply: &Message) -> Result<Outcome> {
    let value = serializer_for_id(reply.serializer_id)?.loads(&reply.payload)?;
    if reply.flags.contains(Flags::EXCEPTION) {
        let err = RemoteError::from_value(&value).unwrap_or_else(|| RemoteError::new("RemoteError", value.to_string()));
        return Err(RemotoError::Remote(err));
    }
    if reply.flags.contains(Flags::ITEM_STREAM_RESULT) {
        let id = reply
            .annotation(ANNOTATION_STREAM)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .or_else(|| value.as_str().map(str::to_string))
            .ok_or_else(|| RemotoError::Protocol("item stream result without a stream id".to_string()))?;
        return Ok(Outcome::Stream(id));
    }
    Ok(Outcome::Value(value))
}

impl Clone for Proxy {
    /// A copy with the same settings and its own, not yet opened, connection.
    fn clone(&self) -> Self {
        Self {
            uri: self.uri.clone(),
            config: Arc::clone(&self.config),
            wire: self.wire.clone(),
            serializer: self.serializer,
            state: Mutex::new(ProxyState::new(self.timeout())),
            oneway: RwLock::new(self.oneway.read().clone()),
            annotations: RwLock::new(self.annotations.read().clone()),
            handshake: RwLock::new(self.handshake.read().clone()),
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("uri", &self.uri)
            .field("connected", &self.is_connected())
            .finish()
    }
}

enum StreamSource {
    Remote { id: String, done: bool },
    Local(std::vec::IntoIter<Value>),
}

/// Items of a stream produced by a remote method, fetched one per call over
/// the proxy's connection.
///
/// Dropping an unfinished stream asks the daemon to discard it.
pub struct ItemStream<'a> {
    proxy: &'a Proxy,
    source: StreamSource,
}

impl<'a> ItemStream<'a> {
    fn remote(proxy: &'a Proxy, id: String) -> Self {
        Self {
            proxy,
            source: StreamSource::Remote { id, done: false },
        }
    }

    fn local(proxy: &'a Proxy, items: Vec<Value>) -> Self {
        Self {
            proxy,
            source: StreamSource::Local(items.into_iter()),
        }
    }

    /// Daemon-side id, for remote streams.
    pub fn id(&self) -> Option<&str> {
        match &self.source {
            StreamSource::Remote { id, .. } => Some(id),
            StreamSource::Local(_) => None,
        }
    }
}

impl Iterator for ItemStream<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, done) = match &mut self.source {
            StreamSource::Local(items) => return items.next().map(Ok),
            StreamSource::Remote { id, done } => (id, done),
        };
        if *done {
            return None;
        }
        let args = [Value::String(id.clone())];
        match self
            .proxy
            .invoke(DAEMON_OBJECT_ID, "get_next_stream_item", &args, &Map::new(), Flags::NONE)
        {
            Ok(Outcome::Value(item)) => Some(Ok(item)),
            Ok(_) => {
                *done = true;
                Some(Err(RemotoError::Protocol("unexpected reply to an item request".to_string())))
            }
            Err(RemotoError::Remote(err)) if err.kind == "StopIteration" => {
                *done = true;
                None
            }
            Err(e) => {
                *done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for ItemStream<'_> {
    fn drop(&mut self) {
        if let StreamSource::Remote { id, done: false } = &self.source {
            let args = [Value::String(id.clone())];
            if let Err(e) = self
                .proxy
                .invoke(DAEMON_OBJECT_ID, "close_stream", &args, &Map::new(), Flags::NONE)
            {
                tracing::debug!(stream = %id, "could not close item stream: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoto_common::transport::Listener;
    use remoto_common::{JsonSerializer, Location};
    use serde_json::json;

    /// Accepts one connection, completes the handshake, then answers each
    /// request with `respond`.
    fn fake_daemon(
        respond: impl Fn(&Message) -> Option<Message> + Send + 'static,
    ) -> (Location, thread::JoinHandle<()>) {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        let location = listener.location().unwrap();
        let handle = thread::spawn(move || {
            let wire = WireConfig::default();
            let conn = listener.accept(Some(Duration::from_secs(5))).unwrap();
            let connect = Message::recv(&conn, Some(&[MessageType::Connect]), &wire).unwrap();
            Message::new(
                MessageType::ConnectOk,
                JsonSerializer.dumps(&json!("hello")).unwrap(),
                JsonSerializer.id(),
                Flags::NONE,
                connect.seq,
            )
            .send(&conn, &wire)
            .unwrap();
            while let Ok(request) = Message::recv(&conn, None, &wire) {
                match respond(&request) {
                    Some(reply) => reply.send(&conn, &wire).unwrap(),
                    None => break,
                }
            }
        });
        (location, handle)
    }

    fn no_metadata() -> Arc<Config> {
        Arc::new(Config::default().with_metadata(false))
    }

    fn result(value: Value, seq: u16) -> Message {
        Message::new(
            MessageType::Result,
            JsonSerializer.dumps(&value).unwrap(),
            JsonSerializer.id(),
            Flags::NONE,
            seq,
        )
    }

    #[test]
    fn test_call_returns_value() {
        let (location, handle) = fake_daemon(|req| {
            let call = JsonSerializer.loads_call(&req.payload).unwrap();
            assert_eq!(call.object_id, "calc");
            assert_eq!(call.method, "multiply");
            Some(result(json!(42), req.seq))
        });
        let proxy = Proxy::new(Uri::new("calc", location), no_metadata()).unwrap();
        assert_eq!(proxy.call("multiply", vec![json!(6), json!(7)]).unwrap(), json!(42));
        assert_eq!(proxy.handshake_response(), Some(json!("hello")));
        proxy.release();
        handle.join().unwrap();
    }

    #[test]
    fn test_sequence_mismatch_releases_connection() {
        let (location, handle) = fake_daemon(|req| Some(result(json!(1), req.seq.wrapping_add(5))));
        let proxy = Proxy::new(Uri::new("calc", location), no_metadata()).unwrap();
        match proxy.call("anything", vec![]) {
            Err(RemotoError::Protocol(msg)) => assert!(msg.contains("out of sync")),
            other => panic!("Expected protocol error, got {:?}", other),
        }
        assert!(!proxy.is_connected());
        handle.join().unwrap();
    }

    #[test]
    fn test_remote_error_is_raised() {
        let (location, handle) = fake_daemon(|req| {
            let err = RemoteError::new("ValueError", "nope");
            Some(
                Message::new(
                    MessageType::Result,
                    JsonSerializer.dumps(&err.to_value()).unwrap(),
                    JsonSerializer.id(),
                    Flags::EXCEPTION,
                    req.seq,
                ),
            )
        });
        let proxy = Proxy::new(Uri::new("calc", location), no_metadata()).unwrap();
        match proxy.call("fail", vec![]) {
            Err(RemotoError::Remote(err)) => assert_eq!(err.kind, "ValueError"),
            other => panic!("Expected remote error, got {:?}", other),
        }
        // a remote error keeps the connection
        assert!(proxy.is_connected());
        proxy.release();
        handle.join().unwrap();
    }

    #[test]
    fn test_connection_refused() {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        let location = listener.location().unwrap();
        drop(listener);
        let proxy = Proxy::new(Uri::new("calc", location), no_metadata()).unwrap();
        let err = proxy.call("x", vec![]).unwrap_err();
        assert!(err.is_communication_error());
    }

    #[test]
    fn test_reconnect_gives_up() {
        let listener = Listener::bind(&Location::tcp("127.0.0.1", 0)).unwrap();
        let location = listener.location().unwrap();
        drop(listener);
        let proxy = Proxy::new(Uri::new("calc", location), no_metadata()).unwrap();
        match proxy.reconnect_with_delay(2, Duration::from_millis(10)) {
            Err(RemotoError::ConnectionClosed { message, .. }) => assert_eq!(message, "failed to reconnect"),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_clone_is_unconnected() {
        let proxy = Proxy::parse("REMOTO:calc@localhost:1", no_metadata()).unwrap();
        proxy.set_oneway(["fire"]);
        proxy.set_timeout(Some(Duration::from_secs(3))).unwrap();
        let copy = proxy.clone();
        assert!(!copy.is_connected());
        assert!(copy.oneway_methods().contains("fire"));
        assert_eq!(copy.timeout(), Some(Duration::from_secs(3)));
        assert_eq!(copy.uri(), proxy.uri());
    }

    #[test]
    fn test_stream_ids_from_reply() {
        let mut annotations = Annotations::new();
        annotations.insert(ANNOTATION_STREAM, b"abc".to_vec());
        let reply = Message::new(
            MessageType::Result,
            JsonSerializer.dumps(&json!("abc")).unwrap(),
            JsonSerializer.id(),
            Flags::ITEM_STREAM_RESULT,
            1,
        )
        .with_annotations(annotations);
        match decode_reply(&reply).unwrap() {
            Outcome::Stream(id) => assert_eq!(id, "abc"),
            _ => panic!("Expected a stream"),
        }
    }
}
