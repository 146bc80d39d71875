use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use browser_relay_error::{ProblemDetails, RelayError};
use browser_relay_protocol::StreamingMode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::registry::{SessionRegistry, HEARTBEAT_INTERVAL};
use crate::tunnel;

mod dispatch;
mod support;
mod types;

use self::support::*;
pub use self::types::*;

/// Largest request body accepted on any route.
pub const BODY_LIMIT: usize = 100 * 1024 * 1024;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Names the target account when a caller authenticates with the shared key.
pub const ACCOUNT_HEADER: &str = "x-relay-account";

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    registry: Arc<SessionRegistry>,
    mode: RwLock<StreamingMode>,
    keepalive_interval: Duration,
}

impl AppState {
    pub fn new(auth: AuthConfig, config: RelayConfig) -> Self {
        Self {
            auth,
            registry: Arc::new(SessionRegistry::new(config.heartbeat_interval)),
            mode: RwLock::new(config.mode),
            keepalive_interval: config.keepalive_interval,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn mode(&self) -> StreamingMode {
        *self.mode.read().expect("mode lock")
    }

    pub fn set_mode(&self, mode: StreamingMode) {
        *self.mode.write().expect("mode lock") = mode;
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mode: StreamingMode,
    pub heartbeat_interval: Duration,
    pub keepalive_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: StreamingMode::Real,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Guards `/admin/*` and key lookup when set.
    pub admin_token: Option<String>,
    /// Static secret accepted in place of a per-account key.
    pub shared_key: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_admin_token(mut self, token: String) -> Self {
        self.admin_token = Some(token);
        self
    }

    pub fn with_shared_key(mut self, key: String) -> Self {
        self.shared_key = Some(key);
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut admin_router = Router::new()
        .route("/set-mode", get(set_mode))
        .route("/get-mode", get(get_mode))
        .with_state(shared.clone());

    if shared.auth.admin_token.is_some() {
        admin_router = admin_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_admin_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root).fallback(passthrough))
        .route("/favicon.ico", get(favicon))
        .route("/v1/models", get(list_models).fallback(passthrough))
        .route(
            "/v1/chat/completions",
            post(chat_completions).fallback(passthrough),
        )
        .route("/:account", get(get_account).fallback(passthrough))
        .nest("/admin", admin_router)
        .fallback(passthrough)
        .with_state(shared.clone())
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(axum::middleware::from_fn(answer_preflight));

    let http_logging = match std::env::var("BROWSER_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var("BROWSER_RELAY_LOG_HTTP_HEADERS").is_ok();
        // Access keys ride in the `key` query parameter, so logged URIs go
        // through `redact_key`.
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let mut headers = Vec::new();
                    for (name, value) in req.headers().iter() {
                        let name_str = name.as_str();
                        let display_value = if name_str.eq_ignore_ascii_case("authorization") {
                            "<redacted>".to_string()
                        } else {
                            value.to_str().unwrap_or("<binary>").to_string()
                        };
                        headers.push((name_str.to_string(), display_value));
                    }
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %redact_key(req.uri()),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %redact_key(req.uri())
                    )
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown_relay(state: &Arc<AppState>) {
    tracing::info!("closing agent tunnels");
    state.registry.shutdown();
}

/// Which client-facing API a call came through; decides how errors render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    OpenAi,
    Native,
    Admin,
}

#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ApiError {
    pub surface: Surface,
    #[source]
    pub error: RelayError,
}

impl ApiError {
    pub fn new(surface: Surface, error: RelayError) -> Self {
        Self { surface, error }
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        Self::new(Surface::Admin, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match self.surface {
            Surface::Admin => {
                let problem: ProblemDetails = self.error.to_problem_details();
                (
                    status,
                    [(header::CONTENT_TYPE, "application/problem+json")],
                    Json(problem),
                )
                    .into_response()
            }
            Surface::OpenAi => (
                status,
                Json(json!({ "error": { "message": self.error.to_string() } })),
            )
                .into_response(),
            Surface::Native => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                self.error.to_string(),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TunnelQuery {
    #[serde(default)]
    account: Option<String>,
}

async fn get_root(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<TunnelQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if let Some(ws) = ws {
        let registry = state.registry();
        let address = connect_info.map(|ConnectInfo(addr)| addr);
        return ws
            .on_upgrade(move |socket| {
                tunnel::serve_socket(socket, registry, query.account, address)
            })
            .into_response();
    }

    let accounts = state.registry.accounts();
    let online = !accounts.is_empty();
    let status = if online {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        status,
        Json(RelaySummary {
            online,
            accounts,
            mode: state.mode(),
        }),
    )
        .into_response()
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(segment): Path<String>,
    request: Request<axum::body::Body>,
) -> Result<Response, ApiError> {
    if !segment.contains('@') {
        return Ok(passthrough(State(state), request).await);
    }
    check_admin_token(&state, request.headers())?;

    let account = segment.trim().to_lowercase();
    let key = state
        .registry
        .live_session(&account)
        .and_then(|_| state.registry.key_for_account(&account));
    match key {
        Some(key) => {
            tracing::info!(account = %account, "access key requested");
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                key,
            )
                .into_response())
        }
        None => Ok((
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "account not connected",
        )
            .into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct SetModeQuery {
    #[serde(default)]
    mode: Option<String>,
}

async fn set_mode(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SetModeQuery>,
) -> Result<Json<ModeResponse>, ApiError> {
    let requested = query.mode.unwrap_or_default();
    let mode: StreamingMode = requested
        .parse()
        .map_err(|_| RelayError::ModeInvalid { mode: requested.clone() })?;
    state.set_mode(mode);
    tracing::info!(mode = %mode, "streaming mode changed");
    Ok(Json(ModeResponse { mode }))
}

async fn get_mode(State(state): State<Arc<AppState>>) -> Json<ModeResponse> {
    Json(ModeResponse { mode: state.mode() })
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Response, ApiError> {
    dispatch::relay_models(&state, &headers, &query).await
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    dispatch::relay_openai(&state, &headers, &query, &body).await
}

async fn passthrough(State(state): State<Arc<AppState>>, request: Request<axum::body::Body>) -> Response {
    match dispatch::relay_native(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn answer_preflight(request: Request<axum::body::Body>, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    check_admin_token(&state, request.headers())?;
    Ok(next.run(request).await)
}

fn check_admin_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.auth.admin_token.as_deref() else {
        return Ok(());
    };
    if extract_token(headers).as_deref() == Some(expected) {
        return Ok(());
    }
    Err(RelayError::TokenInvalid {
        message: Some("missing or invalid admin token".to_string()),
    }
    .into())
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            let value = value.trim();
            if let Some((scheme, rest)) = value.split_once(' ') {
                let scheme_lower = scheme.to_ascii_lowercase();
                let rest = rest.trim();
                match scheme_lower.as_str() {
                    "bearer" | "token" => {
                        return Some(rest.to_string());
                    }
                    "basic" => {
                        let engines = [
                            base64::engine::general_purpose::STANDARD,
                            base64::engine::general_purpose::STANDARD_NO_PAD,
                            base64::engine::general_purpose::URL_SAFE,
                            base64::engine::general_purpose::URL_SAFE_NO_PAD,
                        ];
                        for engine in engines {
                            if let Ok(decoded) = engine.decode(rest) {
                                if let Ok(decoded_str) = String::from_utf8(decoded) {
                                    // `user:` with an empty password carries the key
                                    // in the user slot.
                                    match decoded_str.split_once(':') {
                                        Some((_, password)) if !password.is_empty() => {
                                            return Some(password.to_string());
                                        }
                                        Some((user, _)) if !user.is_empty() => {
                                            return Some(user.to_string());
                                        }
                                        Some(_) => {}
                                        None if !decoded_str.is_empty() => {
                                            return Some(decoded_str);
                                        }
                                        None => {}
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    None
}
