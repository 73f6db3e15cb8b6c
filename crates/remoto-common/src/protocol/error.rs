use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Marker key identifying a serialized [`RemoteError`] inside a payload value.
pub const EXCEPTION_MARKER: &str = "__exception__";

#[derive(Error, Debug)]
pub enum RemotoError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Connection closed: {message}")]
    ConnectionClosed {
        message: String,
        /// Bytes that were read before the stream ended.
        partial: Vec<u8>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("No free workers: {0}")]
    NoFreeWorkers(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Remote(RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemotoError {
    /// Shorthand for a `ConnectionClosed` error without partial data.
    pub fn closed(message: impl Into<String>) -> Self {
        RemotoError::ConnectionClosed {
            message: message.into(),
            partial: Vec::new(),
        }
    }

    /// Whether this error belongs to the communication class.
    ///
    /// A proxy must discard its connection after any of these, because the
    /// stream position can no longer be trusted.
    pub fn is_communication_error(&self) -> bool {
        matches!(
            self,
            RemotoError::Protocol(_)
                | RemotoError::Security(_)
                | RemotoError::ConnectionClosed { .. }
                | RemotoError::Timeout(_)
                | RemotoError::ConnectionRejected(_)
                | RemotoError::Io(_)
        )
    }

    /// Converts a local error into the tagged form sent back to a caller.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            RemotoError::Remote(err) => err.clone(),
            other => RemoteError::new(other.kind_name(), other.to_string()),
        }
    }

    /// Stable name of the error kind, as carried over the wire.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RemotoError::Protocol(_) => "ProtocolError",
            RemotoError::Security(_) => "SecurityError",
            RemotoError::ConnectionClosed { .. } => "ConnectionClosedError",
            RemotoError::Timeout(_) => "TimeoutError",
            RemotoError::ConnectionRejected(_) => "ConnectionRejectedError",
            RemotoError::Daemon(_) => "DaemonError",
            RemotoError::Attribute(_) => "AttributeError",
            RemotoError::NoFreeWorkers(_) => "NoFreeWorkersError",
            RemotoError::Serialize(_) => "SerializeError",
            RemotoError::Config(_) => "ConfigError",
            RemotoError::Unsupported(_) => "UnsupportedError",
            RemotoError::Remote(_) => "RemoteError",
            RemotoError::Io(_) => "IOError",
        }
    }
}

// Needed so a finished future can hand its error out more than once.
impl Clone for RemotoError {
    fn clone(&self) -> Self {
        match self {
            RemotoError::Protocol(m) => RemotoError::Protocol(m.clone()),
            RemotoError::Security(m) => RemotoError::Security(m.clone()),
            RemotoError::ConnectionClosed { message, partial } => RemotoError::ConnectionClosed {
                message: message.clone(),
                partial: partial.clone(),
            },
            RemotoError::Timeout(m) => RemotoError::Timeout(m.clone()),
            RemotoError::ConnectionRejected(m) => RemotoError::ConnectionRejected(m.clone()),
            RemotoError::Daemon(m) => RemotoError::Daemon(m.clone()),
            RemotoError::Attribute(m) => RemotoError::Attribute(m.clone()),
            RemotoError::NoFreeWorkers(m) => RemotoError::NoFreeWorkers(m.clone()),
            RemotoError::Serialize(m) => RemotoError::Serialize(m.clone()),
            RemotoError::Config(m) => RemotoError::Config(m.clone()),
            RemotoError::Unsupported(m) => RemotoError::Unsupported(m.clone()),
            RemotoError::Remote(e) => RemotoError::Remote(e.clone()),
            RemotoError::Io(e) => RemotoError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<serde_json::Error> for RemotoError {
    fn from(err: serde_json::Error) -> Self {
        RemotoError::Serialize(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RemotoError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RemotoError::Serialize(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RemotoError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RemotoError::Serialize(err.to_string())
    }
}

impl From<RemoteError> for RemotoError {
    fn from(err: RemoteError) -> Self {
        RemotoError::Remote(err)
    }
}

pub type Result<T> = std::result::Result<T, RemotoError>;

/// An error raised by a remotely invoked method.
///
/// This is the tagged `Err(kind, message, attributes, remote_trace)` half of a
/// call result. It is what travels in a `RESULT` message flagged as an
/// exception, and what a proxy hands back to its caller.
///
/// # Example
///
/// ```
/// use remoto_common::protocol::RemoteError;
///
/// let err = RemoteError::new("ZeroDivisionError", "division by zero")
///     .with_attribute("numerator", 7);
/// assert_eq!(err.kind, "ZeroDivisionError");
/// assert_eq!(err.attributes["numerator"], 7);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub remote_trace: Vec<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            attributes: Map::new(),
            remote_trace: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_trace_line(mut self, line: impl Into<String>) -> Self {
        self.remote_trace.push(line.into());
        self
    }

    /// The error as a payload value, tagged with [`EXCEPTION_MARKER`].
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(EXCEPTION_MARKER.to_string(), Value::Bool(true));
        map.insert("kind".to_string(), Value::String(self.kind.clone()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        map.insert("attributes".to_string(), Value::Object(self.attributes.clone()));
        map.insert(
            "remote_trace".to_string(),
            Value::Array(self.remote_trace.iter().cloned().map(Value::String).collect()),
        );
        Value::Object(map)
    }

    /// Recovers an error from a payload value, if it carries the marker.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get(EXCEPTION_MARKER) != Some(&Value::Bool(true)) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Renders the remote trace the way it is shown to a user.
    pub fn format_remote_trace(&self) -> String {
        let mut out = String::from(" +--- This exception occurred remotely:\n");
        for line in &self.remote_trace {
            out.push_str(" | ");
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&format!(" | {}: {}\n +--- End of remote trace", self.kind, self.message));
        out
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_error_value_round_trip() {
        let err = RemoteError::new("ValueError", "bad input")
            .with_attribute("field", "x")
            .with_trace_line("in method 'parse'");
        let value = err.to_value();
        assert_eq!(value[EXCEPTION_MARKER], json!(true));
        assert_eq!(RemoteError::from_value(&value), Some(err));
    }

    #[test]
    fn test_plain_value_is_not_an_error() {
        assert!(RemoteError::from_value(&json!({"kind": "x", "message": "y"})).is_none());
        assert!(RemoteError::from_value(&json!(42)).is_none());
    }

    #[test]
    fn test_communication_class() {
        assert!(RemotoError::Protocol("x".into()).is_communication_error());
        assert!(RemotoError::closed("gone").is_communication_error());
        assert!(!RemotoError::Daemon("x".into()).is_communication_error());
        assert!(!RemotoError::Remote(RemoteError::new("E", "m")).is_communication_error());
    }

    #[test]
    fn test_to_remote_keeps_kind() {
        let remote = RemotoError::Attribute("no such method".into()).to_remote();
        assert_eq!(remote.kind, "AttributeError");
        assert!(remote.message.contains("no such method"));
    }

    #[test]
    fn test_clone_io_error() {
        let err = RemotoError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
