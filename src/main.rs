//! ayon-rpc - invoke a pipeline tool on the Ayon server from the command line.
//!
//! Opens the same connection the editor uses, sends one call, prints the
//! reply and closes. Endpoint and timeouts come from `AYON_RPC_*`
//! environment variables.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::timeout;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ayon_rpc::{ClientConfig, Connection, ConnectionState};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

const USAGE: &str = "\
Usage: ayon-rpc METHOD [ARGS...]

Call METHOD on the Ayon pipeline server and print the result.

Environment:
  AYON_RPC_URL                   Server endpoint (default ws://localhost:8765)
  AYON_RPC_RECONNECT_ATTEMPTS    Reconnects after a drop (default 5, 0 disables)
  AYON_RPC_RECONNECT_BASE_MS     First reconnect delay (default 100)
  AYON_RPC_PENDING_TIMEOUT_SECS  Abandon unanswered calls after (default 300)
  RUST_LOG                       Log filter (default ayon_rpc=info)";

/// Parsed command line.
struct Invocation {
    method: String,
    args: Vec<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Invocation>> {
    let Some(method) = args.next() else {
        bail!("Missing METHOD\n\n{}", USAGE);
    };

    if method == "-h" || method == "--help" {
        return Ok(None);
    }
    if method.starts_with('-') {
        bail!("Unknown option '{}'\n\n{}", method, USAGE);
    }

    Ok(Some(Invocation {
        method,
        args: args.collect(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ayon_rpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let Some(invocation) = parse_args(std::env::args().skip(1))? else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config = ClientConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(url = %config.url, "ayon-rpc v{}", env!("CARGO_PKG_VERSION"));

    let connection = Connection::create(config);
    let result = run(&connection, invocation).await;

    if let Err(e) = connection.shutdown().await {
        tracing::warn!(error = %e, "Connection did not shut down cleanly");
    }

    let output = result?;
    println!("{}", output);
    Ok(())
}

async fn run(connection: &Connection, invocation: Invocation) -> Result<String> {
    let mut state = connection.watch_state();
    let mut replies = connection.subscribe();

    connection.connect()?;
    timeout(
        CONNECT_TIMEOUT,
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .with_context(|| {
        format!(
            "Timed out connecting after {}s (state: {})",
            CONNECT_TIMEOUT.as_secs(),
            connection.state()
        )
    })?
    .context("Connection service stopped while connecting")?;

    connection.call_method(invocation.method.as_str(), invocation.args)?;

    let reply = timeout(REPLY_TIMEOUT, replies.recv())
        .await
        .with_context(|| format!("No reply to '{}' within {}s", invocation.method, REPLY_TIMEOUT.as_secs()))?
        .context("Connection service stopped before a reply arrived")?;

    Ok(reply.into_result()?)
}
