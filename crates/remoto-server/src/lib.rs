//! Remoto Server
//!
//! This crate provides the daemon side of Remoto: objects are registered with
//! a [`Daemon`], which listens on a TCP or Unix socket and dispatches incoming
//! calls to them.
//!
//! # Architecture
//!
//! - **Exposure**: a type implements [`Exposed`] to declare its remotely
//!   callable methods, one-way methods, item streams and attributes
//! - **Registry**: object ids map to registered instances; the daemon's own
//!   object is always present under `Remoto.Daemon`
//! - **Dispatch**: handshake, invocation, batches, one-way calls and item
//!   streams
//! - **Servers**: a thread-pool server backed by an elastic [`WorkerPool`], or
//!   a single-threaded multiplexed server that can also drive other daemons
//!
//! # Example
//!
//! ```no_run
//! use remoto_common::{Config, ServerType};
//! use remoto_server::{CallArgs, Daemon, Exposed, ExposedTable};
//! use std::sync::Arc;
//!
//! struct Calculator;
//!
//! impl Exposed for Calculator {
//!     fn expose(table: &mut ExposedTable<Self>) {
//!         table.method("multiply", |_, args: &CallArgs| {
//!             let a: f64 = args.get(0, "a")?;
//!             let b: f64 = args.get(1, "b")?;
//!             Ok((a * b).into())
//!         });
//!     }
//! }
//!
//! let config = Config::default().with_server_type(ServerType::Multiplex);
//! let daemon = Daemon::new(config).unwrap();
//! daemon.register(Arc::new(Calculator), Some("calc")).unwrap();
//! daemon.request_loop().unwrap();
//! ```

pub mod daemon;
pub mod expose;
pub mod registry;
pub mod server;
mod streams;
pub mod worker_pool;

pub use daemon::{AnnotationsHook, Daemon, DisconnectHook, HandshakeValidator};
pub use expose::{CallArgs, Exposed, ExposedTable, MethodResult, Reply, ValueStream};
pub use registry::ObjectRef;
pub use server::{EventSource, SocketServer};
pub use streams::StreamState;
pub use worker_pool::{PoolConfig, WorkerPool};
