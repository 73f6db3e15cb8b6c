//! Capability tables
//!
//! An object becomes remotely callable by implementing [`Exposed`], which
//! fills an [`ExposedTable`] with the methods, one-way methods, item streams
//! and attributes a proxy may reach. Nothing that is not in the table can be
//! called; there is no name-based reflection.
//!
//! # Example
//!
//! ```
//! use remoto_server::expose::{CallArgs, Exposed, ExposedTable};
//! use std::sync::atomic::{AtomicI64, Ordering};
//!
//! struct Calculator {
//!     memory: AtomicI64,
//! }
//!
//! impl Exposed for Calculator {
//!     fn expose(table: &mut ExposedTable<Self>) {
//!         table
//!             .method("multiply", |_, args: &CallArgs| {
//!                 let a: i64 = args.get(0, "a")?;
//!                 let b: i64 = args.get(1, "b")?;
//!                 Ok((a * b).into())
//!             })
//!             .attribute_mut(
//!                 "memory",
//!                 |calc| calc.memory.load(Ordering::SeqCst).into(),
//!                 |calc, value| {
//!                     let v = value.as_i64().unwrap_or_default();
//!                     calc.memory.store(v, Ordering::SeqCst);
//!                     Ok(())
//!                 },
//!             );
//!     }
//! }
//! ```

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;

use remoto_common::{ObjectMetadata, RemoteError, GETATTR_METHOD, SETATTR_METHOD};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Result of an exposed method.
pub type MethodResult = std::result::Result<Value, RemoteError>;

/// A lazily produced sequence of values, pulled by the client item by item.
pub type ValueStream = Box<dyn Iterator<Item = Value> + Send>;

/// What an invocation produced.
pub enum Reply {
    Value(Value),
    Stream(ValueStream),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Fetches an argument by position, falling back to its keyword name.
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` if the argument is missing or has the wrong type.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, RemoteError> {
        let value = self
            .args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .ok_or_else(|| RemoteError::new("TypeError", format!("missing required argument '{}'", name)))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            RemoteError::new("TypeError", format!("invalid argument '{}': {}", name, e))
        })
    }

    /// Like [`CallArgs::get`], but a missing argument yields `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>, RemoteError> {
        if self.args.get(index).is_none() && !self.kwargs.contains_key(name) {
            return Ok(None);
        }
        self.get(index, name).map(Some)
    }

    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Thunk<T> = Arc<dyn Fn(&T, &CallArgs) -> Result<Reply, RemoteError> + Send + Sync>;
type Getter<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;
type Setter<T> = Arc<dyn Fn(&T, Value) -> Result<(), RemoteError> + Send + Sync>;

struct MethodEntry<T> {
    thunk: Thunk<T>,
    oneway: bool,
}

struct AttributeEntry<T> {
    getter: Getter<T>,
    setter: Option<Setter<T>>,
}

/// The methods and attributes of `T` reachable from proxies.
pub struct ExposedTable<T> {
    methods: HashMap<String, MethodEntry<T>>,
    attributes: HashMap<String, AttributeEntry<T>>,
}

impl<T> Default for ExposedTable<T> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            attributes: HashMap::new(),
        }
    }
}

impl<T: 'static> ExposedTable<T> {
    /// Exposes a method returning a single value.
    pub fn method<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&T, &CallArgs) -> MethodResult + Send + Sync + 'static,
    {
        self.insert_method(name, false, Arc::new(move |obj: &T, args: &CallArgs| f(obj, args).map(Reply::Value)))
    }

    /// Exposes a method whose callers never wait for a result.
    pub fn oneway<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&T, &CallArgs) -> MethodResult + Send + Sync + 'static,
    {
        self.insert_method(name, true, Arc::new(move |obj: &T, args: &CallArgs| f(obj, args).map(Reply::Value)))
    }

    /// Exposes a method producing an item stream.
    pub fn stream<F, I>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&T, &CallArgs) -> Result<I, RemoteError> + Send + Sync + 'static,
        I: Iterator<Item = Value> + Send + 'static,
    {
        self.insert_method(
            name,
            false,
            Arc::new(move |obj: &T, args: &CallArgs| {
                f(obj, args).map(|iter| Reply::Stream(Box::new(iter) as ValueStream))
            }),
        )
    }

    /// Exposes a read-only attribute.
    pub fn attribute<G>(&mut self, name: &str, getter: G) -> &mut Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.attributes.insert(
            name.to_string(),
            AttributeEntry {
                getter: Arc::new(getter),
                setter: None,
            },
        );
        self
    }

    /// Exposes a writable attribute.
    pub fn attribute_mut<G, S>(&mut self, name: &str, getter: G, setter: S) -> &mut Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&T, Value) -> Result<(), RemoteError> + Send + Sync + 'static,
    {
        self.attributes.insert(
            name.to_string(),
            AttributeEntry {
                getter: Arc::new(getter),
                setter: Some(Arc::new(setter)),
            },
        );
        self
    }

    fn insert_method(&mut self, name: &str, oneway: bool, thunk: Thunk<T>) -> &mut Self {
        self.methods.insert(name.to_string(), MethodEntry { thunk, oneway });
        self
    }

    pub fn metadata(&self) -> ObjectMetadata {
        let mut meta = ObjectMetadata::default();
        for (name, entry) in &self.methods {
            meta.methods.insert(name.clone());
            if entry.oneway {
                meta.oneway.insert(name.clone());
            }
        }
        meta.attrs.extend(self.attributes.keys().cloned());
        meta
    }

    pub fn is_oneway(&self, method: &str) -> bool {
        self.methods.get(method).map(|m| m.oneway).unwrap_or(false)
    }

    /// Runs `method` on `obj`, resolving attribute access through the
    /// reserved getter and setter names.
    pub fn invoke(&self, obj: &T, method: &str, args: &CallArgs) -> Result<Reply, RemoteError> {
        match method {
            GETATTR_METHOD => {
                let name: String = args.get(0, "name")?;
                let attr = self.attributes.get(&name).ok_or_else(|| no_such(type_name::<T>(), &name))?;
                Ok(Reply::Value((attr.getter)(obj)))
            }
            SETATTR_METHOD => {
                let name: String = args.get(0, "name")?;
                let value: Value = args.get(1, "value")?;
                let attr = self.attributes.get(&name).ok_or_else(|| no_such(type_name::<T>(), &name))?;
                let setter = attr.setter.as_ref().ok_or_else(|| {
                    RemoteError::new("AttributeError", format!("attribute '{}' is read-only", name))
                })?;
                setter(obj, value)?;
                Ok(Reply::Value(Value::Null))
            }
            _ => {
                let entry = self.methods.get(method).ok_or_else(|| no_such(type_name::<T>(), method))?;
                (entry.thunk)(obj, args)
            }
        }
    }
}

fn no_such(type_name: &str, name: &str) -> RemoteError {
    let short = type_name.rsplit("::").next().unwrap_or(type_name);
    RemoteError::new(
        "AttributeError",
        format!("remote object '{}' has no exposed attribute or method '{}'", short, name),
    )
}

/// Implemented by types that can be registered with a daemon.
pub trait Exposed: Send + Sync + 'static {
    /// Declares what proxies may call.
    fn expose(table: &mut ExposedTable<Self>)
    where
        Self: Sized;
}

/// Type-erased registered object.
pub(crate) trait RemoteObject: Send + Sync {
    fn invoke(&self, method: &str, args: &CallArgs) -> Result<Reply, RemoteError>;
    fn metadata(&self) -> ObjectMetadata;
    fn is_oneway(&self, method: &str) -> bool;
    /// Address of the instance, used to find the id it is registered under.
    fn instance_key(&self) -> usize;
    fn type_name(&self) -> &'static str;
}

/// An instance paired with the table of its type.
pub(crate) struct Bound<T> {
    instance: Arc<T>,
    table: Arc<ExposedTable<T>>,
}

impl<T: Exposed> Bound<T> {
    pub(crate) fn new(instance: Arc<T>, table: Arc<ExposedTable<T>>) -> Self {
        Self { instance, table }
    }
}

impl<T: Exposed> RemoteObject for Bound<T> {
    fn invoke(&self, method: &str, args: &CallArgs) -> Result<Reply, RemoteError> {
        self.table.invoke(&self.instance, method, args)
    }

    fn metadata(&self) -> ObjectMetadata {
        self.table.metadata()
    }

    fn is_oneway(&self, method: &str) -> bool {
        self.table.is_oneway(method)
    }

    fn instance_key(&self) -> usize {
        instance_key(&self.instance)
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

pub(crate) fn instance_key<T>(instance: &Arc<T>) -> usize {
    Arc::as_ptr(instance) as *const () as usize
}

/// Builds the table of `T`.
pub(crate) fn build_table<T: Exposed>() -> ExposedTable<T> {
    let mut table = ExposedTable::default();
    T::expose(&mut table);
    table
}
