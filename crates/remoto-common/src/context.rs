//! Per-thread call context
//!
//! Holds the correlation id of the call being processed (or issued) on the
//! current thread, and on the server side the connection it arrived on. A
//! proxy attaches the current correlation id to every outgoing message; the
//! daemon installs the id it receives before dispatching.

use std::cell::RefCell;
use std::fmt;

use rand::RngCore;

/// A 16-byte identifier correlating calls across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub [u8; 16]);

impl CorrelationId {
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Builds an id from annotation bytes; anything but 16 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let id: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The connection a server-side call arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub connection_id: u64,
    pub peer: String,
}

#[derive(Debug, Default, Clone)]
struct CallContext {
    correlation_id: Option<CorrelationId>,
    client: Option<ClientInfo>,
}

thread_local! {
    static CURRENT: RefCell<CallContext> = RefCell::new(CallContext::default());
}

pub fn correlation_id() -> Option<CorrelationId> {
    CURRENT.with(|ctx| ctx.borrow().correlation_id)
}

pub fn set_correlation_id(id: Option<CorrelationId>) {
    CURRENT.with(|ctx| ctx.borrow_mut().correlation_id = id);
}

pub fn client() -> Option<ClientInfo> {
    CURRENT.with(|ctx| ctx.borrow().client.clone())
}

pub fn set_client(client: Option<ClientInfo>) {
    CURRENT.with(|ctx| ctx.borrow_mut().client = client);
}

/// Clears everything; called when a worker is done with a connection.
pub fn reset() {
    CURRENT.with(|ctx| *ctx.borrow_mut() = CallContext::default());
}

/// Random lowercase hex string of `bytes * 2` characters.
pub fn random_hex(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}
