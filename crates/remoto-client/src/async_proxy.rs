//! Asynchronous calls
//!
//! [`AsyncProxy`] turns every call into a background thread that performs the
//! ordinary blocking call and delivers the outcome through a
//! [`FutureResult`]. The wrapped proxy still serializes calls on its
//! connection.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::batch::BatchProxy;
use crate::future::{spawn_result, FutureResult};
use crate::proxy::Proxy;

#[derive(Debug, Clone)]
pub struct AsyncProxy {
    proxy: Arc<Proxy>,
}

impl AsyncProxy {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> FutureResult<Value> {
        self.call_with_kwargs(method, args, Map::new())
    }

    pub fn call_with_kwargs(&self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> FutureResult<Value> {
        let proxy = Arc::clone(&self.proxy);
        let method = method.to_string();
        spawn_result("remoto-async", move || proxy.call_with_kwargs(&method, args, kwargs))
    }

    /// A batch on the same proxy; finish it with `invoke_async`.
    pub fn batch(&self) -> BatchProxy<Arc<Proxy>> {
        BatchProxy::new(Arc::clone(&self.proxy))
    }
}

impl From<Proxy> for AsyncProxy {
    fn from(proxy: Proxy) -> Self {
        Self::new(Arc::new(proxy))
    }
}
