//! Remoto Common Types and Transport
//!
//! This crate provides the wire protocol, configuration and connection layer
//! shared by the Remoto daemon and client crates.
//!
//! # Overview
//!
//! Remoto is a remote-object middleware: a daemon hosts objects, and proxies in
//! other processes call their methods over a binary message protocol. This
//! crate contains everything both sides have to agree on:
//!
//! - **Protocol Layer**: message framing, annotations, authentication tags,
//!   URIs, the serializer boundary and the error taxonomy
//! - **Transport Layer**: blocking TCP and Unix-socket connections
//! - **Configuration**: the explicit [`Config`] passed to every component
//! - **Call context**: per-thread correlation ids
//!
//! # Architecture
//!
//! - **Transport**: TCP or Unix stream sockets, one connection per proxy
//! - **Serialization**: JSON by default, MessagePack optionally, chosen per
//!   message by a numeric id
//! - **Message Format**: `[24-byte header] + [annotations] + [payload]`
//! - **Authentication**: keyed BLAKE3 tag over payload and annotations
//!
//! # Example
//!
//! ```
//! use remoto_common::{Config, Flags, Message, MessageType, WireConfig};
//!
//! let config = Config::default().with_auth_secret("secret");
//! let wire = WireConfig::from(&config);
//! let msg = Message::new(MessageType::Ping, b"ping".to_vec(), 2, Flags::NONE, 1);
//! let bytes = msg.encode(&wire).unwrap();
//! assert!(Message::decode(&bytes, &wire).is_ok());
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod protocol;
pub mod transport;

pub use config::{Config, ServerType};
pub use protocol::*;
