use std::time::Duration;

use browser_relay_agent::executor::{RetryPolicy, DEFAULT_UPSTREAM};
use browser_relay_agent::{run_agent, AgentConfig};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "browser-relay-agent")]
#[command(about = "Connects to a browser-relay server and executes its requests", version)]
struct Cli {
    /// Relay tunnel endpoint (ws, wss, http or https).
    #[arg(long, env = "BROWSER_RELAY_ENDPOINT")]
    endpoint: Url,

    #[arg(long, env = "BROWSER_RELAY_ACCOUNT")]
    account: String,

    #[arg(long, default_value = DEFAULT_UPSTREAM)]
    upstream: Url,

    #[arg(long, default_value_t = 5000)]
    reconnect_ms: u64,

    #[arg(long, default_value_t = 3)]
    attempts: u32,

    #[arg(long, default_value_t = 2000)]
    retry_delay_ms: u64,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "browser-relay-agent failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        signal.cancel();
    });

    run_agent(
        AgentConfig {
            endpoint: cli.endpoint,
            account: cli.account,
            upstream: cli.upstream,
            reconnect_delay: Duration::from_millis(cli.reconnect_ms),
            retry: RetryPolicy {
                attempts: cli.attempts.max(1),
                delay: Duration::from_millis(cli.retry_delay_ms),
            },
        },
        shutdown,
    )
    .await?;
    Ok(())
}
