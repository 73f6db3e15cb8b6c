//! Remoto Client
//!
//! Proxies for calling objects hosted by a Remoto daemon.
//!
//! # Components
//!
//! - **[`Proxy`]**: blocking calls on one remote object over one connection,
//!   with one-way methods, attribute access and item streams
//! - **[`BatchProxy`]**: many calls in a single round trip
//! - **[`AsyncProxy`]**: calls that return a [`FutureResult`] immediately
//! - **[`Future`]**: a deferred local call with continuations
//!
//! # Example
//!
//! ```no_run
//! use remoto_client::{AsyncProxy, Proxy};
//! use remoto_common::Config;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let config = Arc::new(Config::default());
//! let proxy = Proxy::parse("REMOTO:calc@localhost:9090", config).unwrap();
//! assert_eq!(proxy.call("multiply", vec![json!(6), json!(7)]).unwrap(), json!(42));
//!
//! let asynchronous = AsyncProxy::from(proxy);
//! let pending = asynchronous.call("multiply", vec![json!(2), json!(3)]);
//! pending.then(|v| Ok(json!(v.as_i64().unwrap_or(0) + 1)));
//! assert_eq!(pending.value().unwrap(), json!(7));
//! ```

pub mod async_proxy;
pub mod batch;
pub mod future;
pub mod proxy;

pub use async_proxy::AsyncProxy;
pub use batch::{BatchProxy, BatchResults};
pub use future::{Future, FutureResult};
pub use proxy::{ItemStream, Proxy, RECONNECT_DELAY};
