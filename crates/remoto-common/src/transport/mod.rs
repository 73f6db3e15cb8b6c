//! Remoto Transport Layer
//!
//! Blocking stream sockets for daemons and proxies.
//!
//! # Components
//!
//! - **[`Connection`]**: exact-size send/receive over a TCP or Unix stream,
//!   retrying transient errors with a bounded backoff
//! - **[`Listener`]**: the listening socket a daemon accepts connections on
//!
//! Framing lives one level up, in [`crate::protocol::message`].

pub mod connection;
pub mod listener;

pub use connection::{Connection, Stream};
pub use listener::Listener;
