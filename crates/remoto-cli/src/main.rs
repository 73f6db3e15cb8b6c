//! # Remoto CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start the test echo server
//! remoto echoserver -H 0.0.0.0 -p 9090
//!
//! # Call a method (outputs raw JSON)
//! remoto call REMOTO:test.echoserver@localhost:9090 echo -a '["hello"]'
//!
//! # Check that a daemon answers
//! remoto ping REMOTO:test.echoserver@localhost:9090
//! ```
//!
//! Settings not given on the command line come from `REMOTO_*` environment
//! variables.

use anyhow::{Context, Result};
use argh::FromArgs;
use remoto_client::Proxy;
use remoto_common::{Config, RemotoError, ServerType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(FromArgs)]
/// Remoto - remote objects over sockets
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    EchoServer(EchoServerArgs),
    Call(CallArgs),
    Ping(PingArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "echoserver")]
/// run the built-in test echo server
struct EchoServerArgs {
    /// hostname to bind the server on
    #[argh(option, short = 'H', default = "\"localhost\".into()")]
    host: String,

    /// port to bind the server on (0 picks a free one)
    #[argh(option, short = 'p', default = "0")]
    port: u16,

    /// unix socket path to bind instead of a TCP port
    #[argh(option, long = "unix")]
    unix: Option<String>,

    /// server type: "thread" or "multiplex"
    #[argh(option, long = "server-type", default = "ServerType::Multiplex")]
    server_type: ServerType,

    /// shared secret for message authentication
    #[argh(option, short = 'k', long = "key")]
    key: Option<String>,

    /// log every call
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a remote object
struct CallArgs {
    /// object URI, e.g. REMOTO:test.echoserver@localhost:9090
    #[argh(positional)]
    uri: String,

    /// method to call
    #[argh(positional)]
    method: String,

    /// JSON array of positional arguments
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// shared secret for message authentication
    #[argh(option, short = 'k', long = "key")]
    key: Option<String>,

    /// socket timeout in seconds
    #[argh(option, short = 't', long = "timeout")]
    timeout: Option<f64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// check that a daemon answers
struct PingArgs {
    /// object URI
    #[argh(positional)]
    uri: String,

    /// shared secret for message authentication
    #[argh(option, short = 'k', long = "key")]
    key: Option<String>,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and ping print raw JSON; keep logs out of their output
    if matches!(cli.command, Commands::EchoServer(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::EchoServer(args) => run_echoserver(args),
        Commands::Call(args) => run_call(args),
        Commands::Ping(args) => run_ping(args),
    }
}

fn client_config(key: Option<&str>) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(key) = key {
        config = config.with_auth_secret(key);
    }
    Ok(config)
}

fn run_echoserver(args: EchoServerArgs) -> Result<()> {
    let mut config = Config::from_env()?
        .with_host(args.host)
        .with_port(args.port)
        .with_server_type(args.server_type);
    if let Some(path) = args.unix {
        config = config.with_unix_socket(path);
    }
    if let Some(key) = &args.key {
        config = config.with_auth_secret(key);
    }

    let (daemon, echo, uri) = remoto_cli::echo::start(config, args.verbose)?;
    tracing::info!("object name: {}", remoto_cli::echo::ECHO_OBJECT_ID);
    tracing::info!("echo uri: {}", uri);
    println!("{}", uri);
    remoto_cli::echo::serve(&daemon, &echo)?;
    tracing::info!("echoserver stopped");
    Ok(())
}

/// Positional arguments from the `--args` JSON; a non-array value is a
/// single argument.
fn parse_call_args(text: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(text).context("Invalid JSON in args")?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

fn run_call(args: CallArgs) -> Result<()> {
    let call_args = parse_call_args(&args.args)?;
    let mut config = client_config(args.key.as_deref())?;
    if let Some(secs) = args.timeout {
        let timeout = Duration::try_from_secs_f64(secs).context("Invalid timeout")?;
        config = config.with_comm_timeout(timeout);
    }

    let proxy = Proxy::parse(&args.uri, Arc::new(config))?;
    match proxy.call(&args.method, call_args) {
        Ok(result) => {
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Err(RemotoError::Remote(err)) => {
            if !err.remote_trace.is_empty() {
                eprint!("{}", err.format_remote_trace());
            }
            Err(RemotoError::Remote(err).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_ping(args: PingArgs) -> Result<()> {
    let config = client_config(args.key.as_deref())?;
    let proxy = Proxy::parse(&args.uri, Arc::new(config))?;
    proxy.ping()?;
    println!("\"pong\"");
    Ok(())
}
