use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use executor::{RemoteExecutor, RetryPolicy};
use relay::FrameSink;
use transport::{connection_url, spawn_transport, TransportError, TransportEvent};

pub mod executor;
pub mod relay;
pub mod transport;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay tunnel endpoint, e.g. `wss://relay.example/`.
    pub endpoint: Url,
    pub account: String,
    /// Vendor API origin the agent calls on the relay's behalf.
    pub upstream: Url,
    pub reconnect_delay: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("tunnel task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Keeps the tunnel up and executes every envelope the relay sends until
/// `shutdown` fires. In-flight requests are aborted whenever the tunnel drops.
pub async fn run_agent(config: AgentConfig, shutdown: CancellationToken) -> Result<(), AgentError> {
    let url = connection_url(&config.endpoint, &config.account)?;
    let executor = Arc::new(RemoteExecutor::new(config.upstream.clone(), config.retry)?);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (transport, task) = spawn_transport(url, config.reconnect_delay, events_tx, shutdown);

    tracing::info!(
        endpoint = %config.endpoint,
        account = %config.account,
        upstream = %config.upstream,
        "agent started"
    );

    serve_events(&executor, &mut events, |connection| transport.sink(connection), &config.account)
        .await;
    task.await?;
    Ok(())
}

/// Consumes transport events until the channel closes. Each request is
/// registered with the executor before the next event is looked at, so a
/// `Disconnected` that follows a message always aborts that message's work.
/// `sink_for` yields the sink answers go to for a given connection.
pub async fn serve_events<S, F>(
    executor: &Arc<RemoteExecutor>,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    sink_for: F,
    account: &str,
) where
    S: FrameSink + Send + Sync + 'static,
    F: Fn(u64) -> S,
{
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                tracing::info!(account = %account, "connected to relay");
            }
            TransportEvent::Disconnected => {
                let aborted = executor.cancel_all();
                tracing::warn!(account = %account, aborted, "disconnected from relay");
            }
            TransportEvent::Message { connection, text } => {
                let sink = sink_for(connection);
                let Some((envelope, pending)) = relay::accept_message(executor, &sink, &text)
                else {
                    continue;
                };
                let executor = executor.clone();
                tokio::spawn(async move {
                    relay::run_envelope(&executor, &sink, envelope, pending).await;
                });
            }
        }
    }

    executor.cancel_all();
}
