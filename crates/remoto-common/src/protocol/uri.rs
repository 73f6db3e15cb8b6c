use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::protocol::error::{RemotoError, Result};

/// Protocol tag at the start of every object URI.
pub const URI_PROTOCOL: &str = "REMOTO";

/// Where a daemon listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Location {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Location::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `[ipv6]:port` or `./u:path`.
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(path) = text.strip_prefix("./u:") {
            if path.is_empty() {
                return Err(RemotoError::Protocol("invalid uri: empty socket name".to_string()));
            }
            return Ok(Location::Unix(PathBuf::from(path)));
        }

        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| RemotoError::Protocol(format!("invalid uri location: {}", text)))?;
            (host, port)
        } else {
            text.rsplit_once(':')
                .ok_or_else(|| RemotoError::Protocol(format!("invalid uri location: {}", text)))?
        };

        if host.is_empty() {
            return Err(RemotoError::Protocol(format!("invalid uri location: {}", text)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| RemotoError::Protocol(format!("invalid port in uri: {}", port)))?;
        Ok(Location::tcp(host, port))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Location::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Location::Unix(path) => write!(f, "./u:{}", path.display()),
        }
    }
}

/// Identifies one remote object: `REMOTO:<object id>@<location>`.
///
/// # Example
///
/// ```
/// use remoto_common::protocol::Uri;
///
/// let uri: Uri = "REMOTO:obj_1@localhost:9090".parse().unwrap();
/// assert_eq!(uri.object_id, "obj_1");
/// assert_eq!(uri.to_string(), "REMOTO:obj_1@localhost:9090");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub protocol: String,
    pub object_id: String,
    pub location: Location,
}

impl Uri {
    pub fn new(object_id: impl Into<String>, location: Location) -> Self {
        Self {
            protocol: URI_PROTOCOL.to_string(),
            object_id: object_id.into(),
            location,
        }
    }
}

impl FromStr for Uri {
    type Err = RemotoError;

    fn from_str(text: &str) -> Result<Self> {
        let (protocol, rest) = text
            .split_once(':')
            .ok_or_else(|| RemotoError::Protocol(format!("invalid uri: {}", text)))?;
        if !protocol.eq_ignore_ascii_case(URI_PROTOCOL) {
            return Err(RemotoError::Protocol(format!("invalid uri protocol: {}", protocol)));
        }
        let (object_id, location) = rest
            .split_once('@')
            .ok_or_else(|| RemotoError::Protocol(format!("invalid uri: {}", text)))?;
        if object_id.is_empty() {
            return Err(RemotoError::Protocol(format!("invalid uri: missing object id in {}", text)));
        }

        Ok(Self {
            protocol: URI_PROTOCOL.to_string(),
            object_id: object_id.to_string(),
            location: Location::parse(location)?,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.protocol, self.object_id, self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_uri() {
        let uri: Uri = "REMOTO:thing@example.com:4000".parse().unwrap();
        assert_eq!(uri.object_id, "thing");
        assert_eq!(uri.location, Location::tcp("example.com", 4000));
    }

    #[test]
    fn test_parse_ipv6_uri() {
        let uri: Uri = "REMOTO:thing@[::1]:4000".parse().unwrap();
        assert_eq!(uri.location, Location::tcp("::1", 4000));
        assert_eq!(uri.to_string(), "REMOTO:thing@[::1]:4000");
    }

    #[test]
    fn test_parse_unix_uri() {
        let uri: Uri = "remoto:thing@./u:/tmp/remoto.sock".parse().unwrap();
        assert_eq!(uri.location, Location::Unix(PathBuf::from("/tmp/remoto.sock")));
        assert_eq!(uri.to_string(), "REMOTO:thing@./u:/tmp/remoto.sock");
    }

    #[test]
    fn test_invalid_uris() {
        assert!("REMOTO:thing".parse::<Uri>().is_err());
        assert!("HTTP:thing@host:1".parse::<Uri>().is_err());
        assert!("REMOTO:@host:1".parse::<Uri>().is_err());
        assert!("REMOTO:thing@host:notaport".parse::<Uri>().is_err());
        assert!("REMOTO:thing@./u:".parse::<Uri>().is_err());
    }

    #[test]
    fn test_uri_equality() {
        let a = Uri::new("x", Location::tcp("localhost", 1));
        let b: Uri = "REMOTO:x@localhost:1".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Uri::new("x", Location::tcp("localhost", 2)));
    }
}
