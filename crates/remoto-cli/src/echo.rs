//! Built-in test echo server
//!
//! [`EchoServer`] is a small object for trying out clients: it echoes its
//! argument, raises an error on request, has a one-way and a slow method, and
//! produces an item stream. Calling `shutdown` makes [`serve`] return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use remoto_common::{Config, RemoteError, Result, Uri};
use remoto_server::{Daemon, Exposed, ExposedTable};
use serde_json::Value;

/// Id the echo object is registered under.
pub const ECHO_OBJECT_ID: &str = "test.echoserver";

const SLOW_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct EchoServer {
    verbose: bool,
    must_shutdown: AtomicBool,
}

impl EchoServer {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            must_shutdown: AtomicBool::new(false),
        }
    }

    pub fn must_shutdown(&self) -> bool {
        self.must_shutdown.load(Ordering::SeqCst)
    }

    fn trace(&self, what: &str, value: &Value) {
        if self.verbose {
            tracing::info!("{}: {}", what, value);
        }
    }
}

impl Exposed for EchoServer {
    fn expose(table: &mut ExposedTable<Self>) {
        table
            .method("echo", |echo, args| {
                let value: Value = args.get_opt(0, "message")?.unwrap_or_default();
                echo.trace("echo", &value);
                Ok(value)
            })
            .method("error", |echo, _| {
                echo.trace("error", &Value::String("generating exception".to_string()));
                Err(RemoteError::new("ZeroDivisionError", "integer division or modulo by zero"))
            })
            .oneway("oneway_echo", |echo, args| {
                let value: Value = args.get_opt(0, "message")?.unwrap_or_default();
                echo.trace("oneway_echo", &value);
                Ok(value)
            })
            .method("slow", |echo, _| {
                echo.trace("slow", &Value::Null);
                thread::sleep(SLOW_DELAY);
                Ok(Value::String("slow".to_string()))
            })
            .stream("generator", |echo, _| {
                echo.trace("generator", &Value::Null);
                Ok(["one", "two", "three"]
                    .into_iter()
                    .map(|s| Value::String(s.to_string())))
            })
            .method("shutdown", |echo, _| {
                echo.trace("shutdown", &Value::Null);
                echo.must_shutdown.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .attribute("verbose", |echo| Value::Bool(echo.verbose));
    }
}

/// Starts a daemon with a registered [`EchoServer`] without serving yet.
pub fn start(config: Config, verbose: bool) -> Result<(Daemon, Arc<EchoServer>, Uri)> {
    let daemon = Daemon::new(config)?;
    let echo = Arc::new(EchoServer::new(verbose));
    let uri = daemon.register(Arc::clone(&echo), Some(ECHO_OBJECT_ID))?;
    Ok((daemon, echo, uri))
}

/// Serves until a client calls `shutdown`, then closes the daemon.
pub fn serve(daemon: &Daemon, echo: &EchoServer) -> Result<()> {
    daemon.request_loop_while(|| !echo.must_shutdown())?;
    daemon.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoto_client::Proxy;
    use remoto_common::{RemotoError, ServerType};
    use serde_json::json;

    fn config() -> Config {
        Config::default()
            .with_host("127.0.0.1")
            .with_server_type(ServerType::Multiplex)
            .with_poll_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_echo_roundtrip_and_shutdown() {
        let (daemon, echo, uri) = start(config(), false).unwrap();
        assert_eq!(uri.object_id, ECHO_OBJECT_ID);
        let daemon = Arc::new(daemon);
        let serving = Arc::clone(&daemon);
        let serving_echo = Arc::clone(&echo);
        let handle = thread::spawn(move || serve(&serving, &serving_echo));

        let proxy = Proxy::new(uri, Arc::new(Config::default())).unwrap();
        assert_eq!(proxy.call("echo", vec![json!({"a": [1, 2]})]).unwrap(), json!({"a": [1, 2]}));
        assert_eq!(proxy.call("oneway_echo", vec![json!("x")]).unwrap(), Value::Null);
        assert_eq!(
            proxy.call("generator", vec![]).unwrap(),
            json!(["one", "two", "three"])
        );
        match proxy.call("error", vec![]) {
            Err(RemotoError::Remote(err)) => assert_eq!(err.kind, "ZeroDivisionError"),
            other => panic!("Expected remote error, got {:?}", other),
        }

        proxy.call("shutdown", vec![]).unwrap();
        handle.join().unwrap().unwrap();
        assert!(echo.must_shutdown());
    }

    #[test]
    fn test_echo_without_argument() {
        let (daemon, echo, uri) = start(config(), true).unwrap();
        let daemon = Arc::new(daemon);
        let serving = Arc::clone(&daemon);
        let handle = thread::spawn(move || serve(&serving, &echo));

        let proxy = Proxy::new(uri, Arc::new(Config::default())).unwrap();
        assert_eq!(proxy.call("echo", vec![]).unwrap(), Value::Null);
        assert_eq!(proxy.get_attr("verbose").unwrap(), json!(true));
        proxy.call("shutdown", vec![]).unwrap();
        handle.join().unwrap().unwrap();
    }
}
