use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use browser_relay_protocol::{tunnel_schema, StreamingMode};
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{build_router_with_state, shutdown_relay, AppState, AuthConfig, RelayConfig};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7860;

#[derive(Parser, Debug)]
#[command(name = "browser-relay", bin_name = "browser-relay")]
#[command(about = "Relay OpenAI and Gemini API calls through a connected browser agent", version)]
#[command(arg_required_else_help = true)]
pub struct BrowserRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP and tunnel server.
    Server(ServerArgs),
    /// Print the JSON Schema of the tunnel frames.
    Schema,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Streaming discipline at startup; switchable at runtime via /admin/set-mode.
    #[arg(long, default_value = "real", value_parser = parse_mode)]
    mode: StreamingMode,

    /// Static secret accepted in place of a per-account key.
    #[arg(long, env = "BROWSER_RELAY_SHARED_KEY")]
    shared_key: Option<String>,

    /// Bearer token required for /admin/* and key lookup.
    #[arg(long, env = "BROWSER_RELAY_ADMIN_TOKEN")]
    admin_token: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    #[arg(long, default_value_t = 1000)]
    keepalive_ms: u64,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_browser_relay() -> Result<(), CliError> {
    let cli = BrowserRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Schema => print_schema(),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let mut auth = AuthConfig::disabled();
    if let Some(token) = server.admin_token.clone() {
        auth = auth.with_admin_token(token);
    }
    if let Some(key) = server.shared_key.clone() {
        tracing::warn!("shared key enabled; callers using it are routed by header or to the only connected account");
        auth = auth.with_shared_key(key);
    }

    let config = RelayConfig {
        mode: server.mode,
        heartbeat_interval: Duration::from_secs(server.heartbeat_secs.max(1)),
        keepalive_interval: Duration::from_millis(server.keepalive_ms.max(1)),
    };
    let state = Arc::new(AppState::new(auth, config));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, mode = %state.mode(), "server listening");
        let shutdown_state = state.clone();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_relay(&shutdown_state).await;
        })
        .await
        .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn print_schema() -> Result<(), CliError> {
    let schema = serde_json::to_string_pretty(&tunnel_schema())?;
    println!("{schema}");
    Ok(())
}

fn parse_mode(value: &str) -> Result<StreamingMode, String> {
    value.parse().map_err(|err: browser_relay_protocol::ProtocolError| err.to_string())
}

/// Permissive unless origins are given, matching browser callers that send
/// arbitrary origins.
fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    // Browser clients call from arbitrary pages, so no configured origins
    // means any origin rather than none.
    if origins.is_empty() {
        cors = cors.allow_origin(Any);
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
