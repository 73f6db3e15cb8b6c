//! Batched calls
//!
//! A [`BatchProxy`] records calls instead of sending them. `invoke` ships all
//! of them in one message; the daemon runs them in order and stops at the
//! first failure. The results come back as a [`BatchResults`] iterator that
//! yields each value, then the error of the failed call (if any), then ends.

use std::ops::Deref;
use std::sync::Arc;

use remoto_common::{RemoteError, RemotoError, Result};
use serde_json::{Map, Value};

use crate::future::{spawn_result, FutureResult};
use crate::proxy::Proxy;

/// Records calls for a single round trip.
///
/// `P` is anything that derefs to a [`Proxy`]: a plain reference for
/// synchronous batches, an `Arc` when the batch is invoked asynchronously.
///
/// # Example
///
/// ```no_run
/// # use remoto_client::{BatchProxy, Proxy};
/// # use remoto_common::Config;
/// # use serde_json::json;
/// # use std::sync::Arc;
/// let proxy = Proxy::parse("REMOTO:calc@localhost:9090", Arc::new(Config::default())).unwrap();
/// let mut batch = BatchProxy::new(&proxy);
/// batch.call("multiply", vec![json!(2), json!(3)]);
/// batch.call("multiply", vec![json!(4), json!(5)]);
/// for result in batch.invoke().unwrap() {
///     println!("{}", result.unwrap());
/// }
/// ```
pub struct BatchProxy<P: Deref<Target = Proxy>> {
    proxy: P,
    calls: Vec<Value>,
}

impl<P: Deref<Target = Proxy>> BatchProxy<P> {
    pub fn new(proxy: P) -> Self {
        Self {
            proxy,
            calls: Vec::new(),
        }
    }

    pub fn call(&mut self, method: &str, args: Vec<Value>) -> &mut Self {
        self.call_with_kwargs(method, args, Map::new())
    }

    pub fn call_with_kwargs(&mut self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> &mut Self {
        self.calls.push(Value::Array(vec![
            Value::String(method.to_string()),
            Value::Array(args),
            Value::Object(kwargs),
        ]));
        self
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Sends the recorded calls and waits for their results.
    pub fn invoke(self) -> Result<BatchResults> {
        if self.calls.is_empty() {
            return Ok(BatchResults::new(Vec::new()));
        }
        match self.proxy.invoke_batch(&self.calls, false)? {
            Some(results) => Ok(BatchResults::new(results)),
            None => Err(RemotoError::Protocol("batch returned no results".to_string())),
        }
    }

    /// Sends the recorded calls without waiting for anything.
    pub fn invoke_oneway(self) -> Result<()> {
        if self.calls.is_empty() {
            return Ok(());
        }
        self.proxy.invoke_batch(&self.calls, true).map(|_| ())
    }
}

impl BatchProxy<Arc<Proxy>> {
    /// Sends the recorded calls from a background thread.
    pub fn invoke_async(self) -> FutureResult<BatchResults> {
        spawn_result("remoto-batch", move || self.invoke())
    }
}

/// Results of a batch, in call order.
#[derive(Debug, Clone)]
pub struct BatchResults {
    results: std::vec::IntoIter<Value>,
    failed: bool,
}

impl BatchResults {
    fn new(results: Vec<Value>) -> Self {
        Self {
            results: results.into_iter(),
            failed: false,
        }
    }
}

impl Iterator for BatchResults {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let value = self.results.next()?;
        match RemoteError::from_value(&value) {
            Some(err) => {
                self.failed = true;
                Some(Err(RemotoError::Remote(err)))
            }
            None => Some(Ok(value)),
        }
    }
}
