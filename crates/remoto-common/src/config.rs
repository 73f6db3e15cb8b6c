//! Configuration
//!
//! A [`Config`] is built once and handed to every daemon, pool and proxy that
//! needs it. There is no global settings object.
//!
//! # Example
//!
//! ```
//! use remoto_common::config::{Config, ServerType};
//! use std::time::Duration;
//!
//! let config = Config::default()
//!     .with_server_type(ServerType::Multiplex)
//!     .with_comm_timeout(Duration::from_secs(5))
//!     .with_auth_secret("shared-secret");
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::AuthKey;
use crate::protocol::error::{RemotoError, Result};
use crate::protocol::serializer::{serializer_for_name, Serializer};

/// Prefix of environment variables read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "REMOTO_";

/// Concurrency strategy a daemon uses for its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    /// One pooled worker thread per connection.
    Thread,
    /// A single thread multiplexing all connections with `poll`.
    Multiplex,
}

impl FromStr for ServerType {
    type Err = RemotoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "thread" => Ok(ServerType::Thread),
            "multiplex" => Ok(ServerType::Multiplex),
            other => Err(RemotoError::Config(format!("invalid server type: {}", other))),
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerType::Thread => f.write_str("thread"),
            ServerType::Multiplex => f.write_str("multiplex"),
        }
    }
}

/// Settings shared by every component of a daemon or client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host name or address a daemon binds to
    pub host: String,
    /// Port a daemon binds to, 0 picks a free one
    pub port: u16,
    /// Bind on this Unix socket path instead of TCP
    pub unix_socket: Option<PathBuf>,
    pub server_type: ServerType,
    /// Socket timeout for all send/recv calls, `None` blocks forever
    pub comm_timeout: Option<Duration>,
    /// How long the multiplex loop waits for readiness before re-checking its loop condition
    pub poll_timeout: Duration,
    pub threadpool_size: usize,
    pub threadpool_size_min: usize,
    pub threadpool_idle_timeout: Duration,
    /// Queue connections when the pool is saturated instead of refusing them
    pub threadpool_queue: bool,
    /// Maximum payload plus annotation size of a message, 0 means unlimited
    pub max_message_size: usize,
    pub auth_key: Option<AuthKey>,
    /// Run one-way calls on their own thread
    pub oneway_threaded: bool,
    /// Transparent retries of a call whose connection was closed
    pub max_retries: u32,
    pub iter_streaming: bool,
    /// Maximum age of an item stream, zero means unlimited
    pub iter_stream_lifetime: Duration,
    /// How long an item stream survives its client disconnecting
    pub iter_stream_linger: Duration,
    pub compression: bool,
    pub serializer: String,
    /// Ask for object metadata during the handshake
    pub metadata: bool,
    pub housekeeping_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            unix_socket: None,
            server_type: ServerType::Thread,
            comm_timeout: None,
            poll_timeout: Duration::from_secs(2),
            threadpool_size: 40,
            threadpool_size_min: 4,
            threadpool_idle_timeout: Duration::from_secs(2),
            threadpool_queue: false,
            max_message_size: 0,
            auth_key: None,
            oneway_threaded: true,
            max_retries: 0,
            iter_streaming: true,
            iter_stream_lifetime: Duration::ZERO,
            iter_stream_linger: Duration::from_secs(30),
            compression: false,
            serializer: "json".to_string(),
            metadata: true,
            housekeeping_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from the defaults overridden by `REMOTO_*`
    /// environment variables (`REMOTO_HOST`, `REMOTO_THREADPOOL_SIZE`, ...).
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a variable holds an unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse_setting("PORT", &port)?;
        }
        if let Some(path) = lookup("UNIX_SOCKET") {
            config.unix_socket = Some(PathBuf::from(path));
        }
        if let Some(kind) = lookup("SERVERTYPE") {
            config.server_type = kind.parse()?;
        }
        if let Some(secs) = lookup("COMMTIMEOUT") {
            let timeout = parse_secs("COMMTIMEOUT", &secs)?;
            config.comm_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(secs) = lookup("POLLTIMEOUT") {
            config.poll_timeout = parse_secs("POLLTIMEOUT", &secs)?;
        }
        if let Some(size) = lookup("THREADPOOL_SIZE") {
            config.threadpool_size = parse_setting("THREADPOOL_SIZE", &size)?;
        }
        if let Some(size) = lookup("THREADPOOL_SIZE_MIN") {
            config.threadpool_size_min = parse_setting("THREADPOOL_SIZE_MIN", &size)?;
        }
        if let Some(secs) = lookup("THREADPOOL_IDLETIMEOUT") {
            config.threadpool_idle_timeout = parse_secs("THREADPOOL_IDLETIMEOUT", &secs)?;
        }
        if let Some(flag) = lookup("THREADPOOL_QUEUE") {
            config.threadpool_queue = parse_bool("THREADPOOL_QUEUE", &flag)?;
        }
        if let Some(size) = lookup("MAX_MESSAGE_SIZE") {
            config.max_message_size = parse_setting("MAX_MESSAGE_SIZE", &size)?;
        }
        if let Some(secret) = lookup("AUTH_KEY") {
            config.auth_key = (!secret.is_empty()).then(|| AuthKey::new(secret.as_bytes()));
        }
        if let Some(flag) = lookup("ONEWAY_THREADED") {
            config.oneway_threaded = parse_bool("ONEWAY_THREADED", &flag)?;
        }
        if let Some(retries) = lookup("MAX_RETRIES") {
            config.max_retries = parse_setting("MAX_RETRIES", &retries)?;
        }
        if let Some(flag) = lookup("ITER_STREAMING") {
            config.iter_streaming = parse_bool("ITER_STREAMING", &flag)?;
        }
        if let Some(secs) = lookup("ITER_STREAM_LIFETIME") {
            config.iter_stream_lifetime = parse_secs("ITER_STREAM_LIFETIME", &secs)?;
        }
        if let Some(secs) = lookup("ITER_STREAM_LINGER") {
            config.iter_stream_linger = parse_secs("ITER_STREAM_LINGER", &secs)?;
        }
        if let Some(flag) = lookup("COMPRESSION") {
            config.compression = parse_bool("COMPRESSION", &flag)?;
        }
        if let Some(name) = lookup("SERIALIZER") {
            config.serializer = name;
        }
        if let Some(flag) = lookup("METADATA") {
            config.metadata = parse_bool("METADATA", &flag)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_socket = Some(path.into());
        self
    }

    pub fn with_server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    pub fn with_comm_timeout(mut self, timeout: Duration) -> Self {
        self.comm_timeout = Some(timeout);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the minimum and maximum number of pool workers.
    pub fn with_threadpool(mut self, min: usize, max: usize) -> Self {
        self.threadpool_size_min = min;
        self.threadpool_size = max;
        self
    }

    pub fn with_threadpool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.threadpool_idle_timeout = timeout;
        self
    }

    pub fn with_threadpool_queue(mut self, queue: bool) -> Self {
        self.threadpool_queue = queue;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_auth_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.auth_key = Some(AuthKey::new(secret));
        self
    }

    pub fn with_oneway_threaded(mut self, threaded: bool) -> Self {
        self.oneway_threaded = threaded;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_iter_streaming(mut self, enabled: bool) -> Self {
        self.iter_streaming = enabled;
        self
    }

    pub fn with_iter_stream_lifetime(mut self, lifetime: Duration) -> Self {
        self.iter_stream_lifetime = lifetime;
        self
    }

    pub fn with_iter_stream_linger(mut self, linger: Duration) -> Self {
        self.iter_stream_linger = linger;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_serializer(mut self, name: impl Into<String>) -> Self {
        self.serializer = name.into();
        self
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.metadata = enabled;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    /// The serializer selected by name.
    pub fn serializer(&self) -> Result<&'static dyn Serializer> {
        serializer_for_name(&self.serializer)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if:
    /// - either pool size is zero
    /// - the minimum pool size exceeds the maximum
    /// - the serializer name is unknown
    pub fn validate(&self) -> Result<()> {
        if self.threadpool_size == 0 || self.threadpool_size_min == 0 {
            return Err(RemotoError::Config("threadpool sizes must be greater than zero".to_string()));
        }
        if self.threadpool_size_min > self.threadpool_size {
            return Err(RemotoError::Config(format!(
                "threadpool min size {} exceeds max size {}",
                self.threadpool_size_min, self.threadpool_size
            )));
        }
        serializer_for_name(&self.serializer)
            .map_err(|e| RemotoError::Config(e.to_string()))?;
        Ok(())
    }
}

fn parse_setting<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        RemotoError::Config(format!("invalid value for {}{}: {}", ENV_PREFIX, name, value))
    })
}

/// Parses fractional seconds; negative or non-finite values are rejected.
fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse_setting(name, value)?;
    Duration::try_from_secs_f64(secs).map_err(|_| {
        RemotoError::Config(format!("invalid value for {}{}: {}", ENV_PREFIX, name, value))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RemotoError::Config(format!("invalid value for {}{}: {}", ENV_PREFIX, name, value))),
    }
}
