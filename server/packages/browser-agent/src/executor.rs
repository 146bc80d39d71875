//! Performs the outbound vendor call for one envelope, with a fixed retry
//! budget and per-request cancellation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use browser_relay_protocol::{RequestEnvelope, StreamingMode};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DEFAULT_UPSTREAM: &str = "https://generativelanguage.googleapis.com";
/// Status reported to the relay for every failure the agent surfaces.
pub const FAILURE_STATUS: u16 = 504;
pub const FAILURE_TEXT_LIMIT: usize = 200;

const STREAM_ACTION: &str = ":streamGenerateContent";
const BUFFERED_ACTION: &str = ":generateContent";
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "origin",
    "referer",
    "user-agent",
];
const STRIPPED_HEADER_PREFIX: &str = "sec-fetch-";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("request aborted")]
    Cancelled,
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid method: {0}")]
    InvalidMethod(String),
}

/// Message carried by the error event sent back to the relay.
pub fn failure_message(error: &ExecutorError) -> String {
    match error {
        ExecutorError::Cancelled => "browser error: request aborted".to_string(),
        other => format!(
            "browser error: {}",
            truncate(&other.to_string(), FAILURE_TEXT_LIMIT)
        ),
    }
}

pub fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// The concrete call an envelope turns into.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl UpstreamRequest {
    pub fn from_envelope(upstream: &Url, envelope: &RequestEnvelope) -> Result<Self, ExecutorError> {
        let method = Method::from_bytes(envelope.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ExecutorError::InvalidMethod(envelope.method.clone()))?;

        let mut path = envelope.path.clone();
        let mut query = envelope.query_params.clone();
        if envelope.streaming_mode == StreamingMode::Fake {
            path = path.replace(STREAM_ACTION, BUFFERED_ACTION);
            query.remove("alt");
        }

        let body = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            envelope.body.clone()
        } else {
            None
        };

        Ok(Self {
            url: upstream_url(upstream, &path, &query)?,
            headers: forwarded_headers(&envelope.headers),
            method,
            body,
        })
    }
}

fn upstream_url(
    upstream: &Url,
    path: &str,
    query: &BTreeMap<String, String>,
) -> Result<Url, ExecutorError> {
    let mut url = Url::parse(&format!(
        "{}/{}",
        upstream.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    ))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

fn forwarded_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if STRIPPED_HEADERS.contains(&lower.as_str()) || lower.starts_with(STRIPPED_HEADER_PREFIX) {
            continue;
        }
        match (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                forwarded.append(name, value);
            }
            _ => tracing::debug!(header = %lower, "skipping unforwardable header"),
        }
    }
    forwarded
}

/// Executes envelopes and tracks one cancellation token per in-flight
/// operation.
#[derive(Debug)]
pub struct RemoteExecutor {
    client: reqwest::Client,
    upstream: Url,
    retry: RetryPolicy,
    pending: Arc<Mutex<PendingTable>>,
}

/// In-flight operations keyed by a per-executor sequence number, so a
/// repeated request id never shadows an earlier operation.
#[derive(Debug, Default)]
struct PendingTable {
    next: u64,
    entries: HashMap<u64, (String, CancellationToken)>,
}

impl RemoteExecutor {
    pub fn new(upstream: Url, retry: RetryPolicy) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            upstream,
            retry,
            pending: Arc::new(Mutex::new(PendingTable::default())),
        })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Registers a request as in flight. The entry is removed when the
    /// returned guard drops.
    pub fn track(&self, request_id: &str) -> PendingOperation {
        let token = CancellationToken::new();
        let mut table = self.pending.lock().expect("pending operations lock");
        let slot = table.next;
        table.next += 1;
        if table.entries.values().any(|(id, _)| id == request_id) {
            tracing::warn!(request_id = %request_id, "request id already in flight");
        }
        table
            .entries
            .insert(slot, (request_id.to_string(), token.clone()));
        PendingOperation {
            table: self.pending.clone(),
            slot,
            request_id: request_id.to_string(),
            token,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("pending operations lock")
            .entries
            .len()
    }

    /// Aborts every in-flight operation. Returns how many were aborted.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, CancellationToken)> = self
            .pending
            .lock()
            .expect("pending operations lock")
            .entries
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for (request_id, token) in &drained {
            tracing::debug!(request_id = %request_id, "aborting request");
            token.cancel();
        }
        drained.len()
    }

    /// Issues the call, retrying any non-cancellation failure until the
    /// budget is spent. Resolves once a 2xx response's headers arrive.
    pub async fn execute(
        &self,
        envelope: &RequestEnvelope,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, ExecutorError> {
        let request = UpstreamRequest::from_envelope(&self.upstream, envelope)?;
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(ExecutorError::Cancelled),
                outcome = self.attempt(&request) => outcome,
            };
            let error = match outcome {
                Ok(response) => {
                    tracing::debug!(
                        request_id = %envelope.request_id,
                        attempt,
                        status = response.status().as_u16(),
                        "upstream responded"
                    );
                    return Ok(response);
                }
                Err(error) => error,
            };

            tracing::warn!(
                request_id = %envelope.request_id,
                url = %request.url.path(),
                attempt,
                attempts,
                error = %truncate(&error.to_string(), FAILURE_TEXT_LIMIT),
                "upstream attempt failed"
            );
            if attempt >= attempts {
                return Err(error);
            }
            attempt += 1;
            tokio::select! {
                _ = token.cancelled() => return Err(ExecutorError::Cancelled),
                _ = tokio::time::sleep(self.retry.delay) => {}
            }
        }
    }

    async fn attempt(&self, request: &UpstreamRequest) -> Result<reqwest::Response, ExecutorError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExecutorError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// One in-flight request. Dropping it forgets the request. The guard owns
/// its registration, so it can move into the task that runs the request.
#[derive(Debug)]
pub struct PendingOperation {
    table: Arc<Mutex<PendingTable>>,
    slot: u64,
    request_id: String,
    token: CancellationToken,
}

impl PendingOperation {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        self.table
            .lock()
            .expect("pending operations lock")
            .entries
            .remove(&self.slot);
    }
}
