//! Futures
//!
//! [`FutureResult`] is a one-shot slot for a value that another thread will
//! produce, with continuations that transform the value once it arrives.
//! [`Future`] wraps a function so that calling it runs the function on a
//! background thread and hands back a `FutureResult`.
//!
//! Continuations run in order. The first one that fails short-circuits the
//! rest, and the error becomes the final value. An error handler registered
//! with `iferror` sees that error.
//!
//! # Example
//!
//! ```
//! use remoto_client::Future;
//!
//! let result = Future::new(|| Ok(5))
//!     .then(|v| Ok(v + 1))
//!     .then(|v| Ok(v * 2))
//!     .call();
//! assert_eq!(result.value().unwrap(), 12);
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use remoto_common::{RemotoError, Result};

type Continuation<T> = Box<dyn FnOnce(T) -> Result<T> + Send>;
type ErrorHandler = Arc<dyn Fn(&RemotoError) + Send + Sync>;

struct FutureState<T> {
    value: Option<Result<T>>,
    chain: Vec<Continuation<T>>,
    error_handler: Option<ErrorHandler>,
}

struct Shared<T> {
    state: Mutex<FutureState<T>>,
    ready: Condvar,
}

/// The eventual result of an asynchronous call.
///
/// Clones share the same slot.
pub struct FutureResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FutureResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for FutureResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn run_chain<T>(value: Result<T>, chain: Vec<Continuation<T>>) -> Result<T> {
    chain.into_iter().fold(value, |current, next| current.and_then(next))
}

impl<T: Send + 'static> FutureResult<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FutureState {
                    value: None,
                    chain: Vec::new(),
                    error_handler: None,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Whether the value has been set.
    pub fn ready(&self) -> bool {
        self.shared.state.lock().value.is_some()
    }

    /// Blocks until the value is set or `timeout` passes; returns whether it
    /// is set.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.shared.state.lock();
        match timeout {
            None => {
                while state.value.is_none() {
                    self.shared.ready.wait(&mut state);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.value.is_none() {
                    if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                state.value.is_some()
            }
        }
    }

    /// Blocks for the value. An error value is returned on every call.
    pub fn value(&self) -> Result<T>
    where
        T: Clone,
    {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = state.value.as_ref() {
                return value.clone();
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// Sets the value, running pending continuations first. Only the first
    /// call has any effect.
    pub fn set_value(&self, value: Result<T>) {
        let mut state = self.shared.state.lock();
        if state.value.is_some() {
            tracing::warn!("future value already set, ignoring");
            return;
        }
        let chain = std::mem::take(&mut state.chain);
        let value = run_chain(value, chain);
        if let (Err(e), Some(handler)) = (&value, &state.error_handler) {
            handler(e);
        }
        state.value = Some(value);
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Adds a continuation. On a value that is already set it runs right
    /// away, on the caller's thread.
    ///
    /// Continuations run while the slot is locked and must not touch this
    /// future.
    pub fn then<F>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> Result<T> + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        match state.value.take() {
            Some(Ok(current)) => {
                let next = f(current);
                if let (Err(e), Some(handler)) = (&next, &state.error_handler) {
                    handler(e);
                }
                state.value = Some(next);
            }
            Some(Err(e)) => state.value = Some(Err(e)),
            None => state.chain.push(Box::new(f)),
        }
        self
    }

    /// Like [`FutureResult::then`], passing `extra` along with the value.
    pub fn then_with<A, F>(&self, f: F, extra: A) -> &Self
    where
        A: Send + 'static,
        F: FnOnce(T, A) -> Result<T> + Send + 'static,
    {
        self.then(move |value| f(value, extra))
    }

    /// Registers a handler for an error outcome. If the value is already an
    /// error the handler is called immediately.
    pub fn iferror<H>(&self, handler: H) -> &Self
    where
        H: Fn(&RemotoError) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        if let Some(Err(e)) = &state.value {
            handler(e);
        }
        state.error_handler = Some(Arc::new(handler));
        self
    }
}

/// Runs `f` on a named background thread and delivers its outcome.
pub(crate) fn spawn_result<T, F>(name: &str, f: F) -> FutureResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let result = FutureResult::new();
    let slot = result.clone();
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || slot.set_value(f()));
    if let Err(e) = spawned {
        result.set_value(Err(RemotoError::Io(e)));
    }
    result
}

/// A deferred function call with continuations.
pub struct Future<T> {
    func: Box<dyn FnOnce() -> Result<T> + Send>,
    chain: Vec<Continuation<T>>,
    error_handler: Option<ErrorHandler>,
}

impl<T: Send + 'static> Future<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self {
            func: Box::new(f),
            chain: Vec::new(),
            error_handler: None,
        }
    }

    pub fn then<F>(mut self, f: F) -> Self
    where
        F: FnOnce(T) -> Result<T> + Send + 'static,
    {
        self.chain.push(Box::new(f));
        self
    }

    pub fn then_with<A, F>(self, f: F, extra: A) -> Self
    where
        A: Send + 'static,
        F: FnOnce(T, A) -> Result<T> + Send + 'static,
    {
        self.then(move |value| f(value, extra))
    }

    pub fn iferror<H>(mut self, handler: H) -> Self
    where
        H: Fn(&RemotoError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Starts the function on a background thread.
    pub fn call(self) -> FutureResult<T> {
        let Future {
            func,
            chain,
            error_handler,
        } = self;
        let result = spawn_result("remoto-future", move || run_chain(func(), chain));
        if let Some(handler) = error_handler {
            result.iferror(move |e| handler(e));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_future_chain() {
        let result = Future::new(|| Ok(5)).then(|v| Ok(v + 1)).then(|v| Ok(v * 2)).call();
        assert!(result.wait(Some(Duration::from_secs(5))));
        assert_eq!(result.value().unwrap(), 12);
    }

    #[test]
    fn test_then_with_extra_argument() {
        let result = Future::new(|| Ok(5))
            .then_with(|v, extra: i32| Ok(v + extra), 10)
            .call();
        assert_eq!(result.value().unwrap(), 15);
    }

    #[test]
    fn test_error_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handled = Arc::new(AtomicUsize::new(0));
        let handler_count = Arc::clone(&handled);
        let result = Future::new(|| Ok(1))
            .then(|_| Err(RemotoError::Daemon("broken".to_string())))
            .then(move |v| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            })
            .iferror(move |_| {
                handler_count.fetch_add(1, Ordering::SeqCst);
            })
            .call();
        assert!(matches!(result.value(), Err(RemotoError::Daemon(_))));
        assert!(matches!(result.value(), Err(RemotoError::Daemon(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_continuations_before_and_after_value() {
        let result: FutureResult<i32> = FutureResult::new();
        result.then(|v| Ok(v + 1));
        assert!(!result.ready());
        result.set_value(Ok(5));
        assert_eq!(result.value().unwrap(), 6);

        result.then(|v| Ok(v * 2));
        assert_eq!(result.value().unwrap(), 12);
    }

    #[test]
    fn test_set_value_once() {
        let result: FutureResult<i32> = FutureResult::new();
        result.set_value(Ok(1));
        result.set_value(Ok(2));
        assert_eq!(result.value().unwrap(), 1);
    }

    #[test]
    fn test_wait_times_out() {
        let result: FutureResult<i32> = FutureResult::new();
        assert!(!result.wait(Some(Duration::from_millis(20))));
        assert!(!result.ready());
    }

    #[test]
    fn test_iferror_on_completed_error() {
        let result: FutureResult<i32> = FutureResult::new();
        result.set_value(Err(RemotoError::Timeout("slow".to_string())));
        let handled = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&handled);
        result.iferror(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_from_other_thread() {
        let result: FutureResult<String> = FutureResult::new();
        let setter = result.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set_value(Ok("done".to_string()));
        });
        assert_eq!(result.value().unwrap(), "done");
        handle.join().unwrap();
    }
}
