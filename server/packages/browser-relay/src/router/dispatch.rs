//! Turns client HTTP calls into tunnel envelopes and renders what the agent
//! sends back.
//!
//! Every call holds a [`QueueLease`] for its request id from the moment it is
//! authenticated until its response body is finished or dropped, so the
//! queue is released on every exit path.

use super::*;

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::http::response::Builder;
use axum::http::HeaderValue;
use browser_relay_protocol::{next_request_id, RequestEnvelope, ResponseEvent};
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::openai_compat::{self, ChatCompletionRequest, SseRefragmenter, DONE_FRAME};
use crate::queue::{EventQueue, QueueClosed};
use crate::registry::{normalize_account, QueueLease};

const MODELS_PATH: &str = "/v1beta/models";
const FAKE_STREAM_BUFFER: usize = 16;

/// An authenticated call bound to its account's live session.
struct Call {
    surface: Surface,
    wants_stream: bool,
    model: String,
    lease: QueueLease,
}

/// What the fake discipline collects: headers plus at most one body chunk.
struct BufferedPayload {
    status: u16,
    headers: BTreeMap<String, String>,
    data: Option<String>,
}

pub(super) async fn relay_openai(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let surface = Surface::OpenAi;
    let lease = open_call(state, surface, headers, query)?;
    let request: ChatCompletionRequest = if body.is_empty() {
        ChatCompletionRequest::default()
    } else {
        serde_json::from_slice(body).map_err(|err| {
            ApiError::new(
                surface,
                RelayError::InvalidRequest {
                    message: format!("invalid chat completion request: {err}"),
                },
            )
        })?
    };

    let envelope = openai_compat::from_openai_request(
        &request,
        lease.request_id(),
        sanitize_request_headers(headers),
        query,
        state.mode(),
    )
    .map_err(|err| {
        ApiError::new(
            surface,
            RelayError::ProtocolError {
                message: err.to_string(),
            },
        )
    })?;

    let call = Call {
        surface,
        wants_stream: request.stream,
        model: request.model().to_string(),
        lease,
    };
    call.run(state, envelope).await
}

pub(super) async fn relay_native(
    state: &Arc<AppState>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    let surface = Surface::Native;
    let (parts, body) = request.into_parts();
    let mut query = Query::<BTreeMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(query)| query)
        .unwrap_or_default();
    let lease = open_call(state, surface, &parts.headers, &query)?;

    let body = axum::body::to_bytes(body, BODY_LIMIT).await.map_err(|err| {
        ApiError::new(
            surface,
            RelayError::InvalidRequest {
                message: format!("failed to read request body: {err}"),
            },
        )
    })?;
    query.remove("key");

    let path = parts.uri.path().to_string();
    let envelope = RequestEnvelope {
        request_id: lease.request_id().to_string(),
        method: parts.method.as_str().to_string(),
        path: path.clone(),
        headers: sanitize_request_headers(&parts.headers),
        query_params: query,
        body: (!body.is_empty()).then(|| String::from_utf8_lossy(&body).into_owned()),
        streaming_mode: state.mode(),
        is_openai: false,
    };

    let call = Call {
        surface,
        wants_stream: path.contains("streamGenerateContent"),
        model: String::new(),
        lease,
    };
    call.run(state, envelope).await
}

pub(super) async fn relay_models(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
) -> Result<Response, ApiError> {
    let surface = Surface::OpenAi;
    let lease = open_call(state, surface, headers, query)?;
    let envelope = RequestEnvelope {
        request_id: lease.request_id().to_string(),
        method: "GET".to_string(),
        path: MODELS_PATH.to_string(),
        headers: BTreeMap::new(),
        query_params: BTreeMap::new(),
        body: None,
        streaming_mode: StreamingMode::Fake,
        is_openai: false,
    };
    tracing::info!(
        account = %lease.session().account(),
        request_id = %lease.request_id(),
        "model list requested"
    );
    lease
        .session()
        .forward(&envelope)
        .map_err(|err| ApiError::new(surface, err))?;

    let payload = collect_buffered(lease.queue())
        .await
        .map_err(|err| ApiError::new(surface, err))?;
    drop(lease);

    let Some(body) = payload.data.filter(|data| !data.is_empty()) else {
        return Err(ApiError::new(
            surface,
            RelayError::UpstreamFailure {
                status: 500,
                message: "unable to fetch model list".to_string(),
            },
        ));
    };
    let models = openai_compat::to_openai_models(&body).map_err(|err| {
        ApiError::new(
            surface,
            RelayError::UpstreamFailure {
                status: 500,
                message: format!("unable to fetch model list: {err}"),
            },
        )
    })?;
    Ok(Json(models).into_response())
}

fn open_call(
    state: &AppState,
    surface: Surface,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
) -> Result<QueueLease, ApiError> {
    let bind = || -> Result<QueueLease, RelayError> {
        let account = authenticate(state, headers, query)?;
        let session = state
            .registry
            .live_session(&account)
            .ok_or_else(|| RelayError::NoConnection {
                account: account.clone(),
            })?;
        session.open_queue(&next_request_id())
    };
    bind().map_err(|err| ApiError::new(surface, err))
}

/// Resolves the caller's key to an account. A shared key falls back to an
/// explicit account header, then to the only connected account.
fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
) -> Result<String, RelayError> {
    let key = query
        .get("key")
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .or_else(|| extract_token(headers).filter(|key| !key.is_empty()));
    let Some(key) = key else {
        return Err(RelayError::TokenInvalid {
            message: Some("missing key".to_string()),
        });
    };

    if let Some(account) = state.registry.account_for_key(&key) {
        return Ok(account);
    }
    if state.auth.shared_key.as_deref() == Some(key.as_str()) {
        return resolve_shared_account(state, headers);
    }
    Err(RelayError::TokenInvalid {
        message: Some("invalid key".to_string()),
    })
}

fn resolve_shared_account(state: &AppState, headers: &HeaderMap) -> Result<String, RelayError> {
    if let Some(account) = headers
        .get(ACCOUNT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize_account)
    {
        return Ok(account);
    }
    let accounts = state.registry.accounts();
    match accounts.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(RelayError::NoConnection {
            account: "any".to_string(),
        }),
        many => Err(RelayError::AmbiguousAccount {
            connected: many.len(),
        }),
    }
}

impl Call {
    async fn run(self, state: &AppState, envelope: RequestEnvelope) -> Result<Response, ApiError> {
        let mode = envelope.streaming_mode;
        tracing::info!(
            account = %self.lease.session().account(),
            request_id = %self.lease.request_id(),
            method = %envelope.method,
            path = %envelope.path,
            mode = %mode,
            stream = self.wants_stream,
            openai = envelope.is_openai,
            "relaying request"
        );
        self.lease
            .session()
            .forward(&envelope)
            .map_err(|err| ApiError::new(self.surface, err))?;

        match mode {
            StreamingMode::Real => self.relay_real().await,
            StreamingMode::Fake if self.wants_stream => {
                self.relay_fake_streaming(state.keepalive_interval)
            }
            StreamingMode::Fake => self.relay_fake_buffered().await,
        }
    }

    async fn relay_real(self) -> Result<Response, ApiError> {
        let surface = self.surface;
        let fail = |err: RelayError| ApiError::new(surface, err);
        let (status, headers) = match self.lease.queue().pop().await.map_err(|err| fail(err.into()))? {
            ResponseEvent::ResponseHeaders { status, headers } => (status, headers),
            ResponseEvent::Error { status, message } => {
                return Err(fail(RelayError::UpstreamFailure { status, message }));
            }
            other => return Err(fail(unexpected_event(&other))),
        };

        if surface == Surface::OpenAi && !self.wants_stream {
            let mut collected = String::new();
            loop {
                match self.lease.queue().pop().await.map_err(|err| fail(err.into()))? {
                    ResponseEvent::Chunk { data } => collected.push_str(&data),
                    ResponseEvent::StreamClose => break,
                    ResponseEvent::Error { status, message } => {
                        return Err(fail(RelayError::UpstreamFailure { status, message }));
                    }
                    ResponseEvent::ResponseHeaders { .. } => {
                        tracing::debug!(request_id = %self.lease.request_id(), "ignoring repeated response headers");
                    }
                }
            }
            let completion = openai_compat::to_openai_response(&collected, &self.model);
            let builder = with_json_content_type(relayed_response(status, &headers, false));
            return finish(surface, builder, Body::from(completion.to_string()));
        }

        let refragmenter = (surface == Surface::OpenAi && self.wants_stream)
            .then(|| SseRefragmenter::new(self.model.clone()));
        let builder = relayed_response(status, &headers, self.wants_stream);
        let body = RealBody {
            lease: self.lease,
            refragmenter,
            event_stream: self.wants_stream,
            finished: false,
        };
        finish(surface, builder, Body::from_stream(body.into_stream()))
    }

    async fn relay_fake_buffered(self) -> Result<Response, ApiError> {
        let surface = self.surface;
        let payload = collect_buffered(self.lease.queue())
            .await
            .map_err(|err| ApiError::new(surface, err))?;
        drop(self.lease);

        let data = payload.data.unwrap_or_default();
        if surface == Surface::OpenAi && !data.is_empty() {
            let completion = openai_compat::to_openai_response(&data, &self.model);
            let builder =
                with_json_content_type(relayed_response(payload.status, &payload.headers, false));
            return finish(surface, builder, Body::from(completion.to_string()));
        }
        let builder = relayed_response(payload.status, &payload.headers, false);
        finish(surface, builder, Body::from(data))
    }

    fn relay_fake_streaming(self, keepalive_interval: Duration) -> Result<Response, ApiError> {
        let (sender, receiver) = mpsc::channel::<Result<Bytes, Infallible>>(FAKE_STREAM_BUFFER);
        let Call {
            surface,
            model,
            lease,
            ..
        } = self;

        tokio::spawn(async move {
            let request_id = lease.request_id().to_string();
            let payload = collect_buffered(lease.queue());
            tokio::pin!(payload);
            let mut keepalive = tokio::time::interval_at(
                tokio::time::Instant::now() + keepalive_interval,
                keepalive_interval,
            );

            let outcome = loop {
                tokio::select! {
                    outcome = &mut payload => break outcome,
                    _ = keepalive.tick() => {
                        let frame = Bytes::from(keepalive_frame(surface));
                        if sender.send(Ok(frame)).await.is_err() {
                            tracing::debug!(request_id = %request_id, "client left before payload arrived");
                            return;
                        }
                    }
                }
            };

            let frames = match outcome {
                Ok(BufferedPayload {
                    data: Some(data), ..
                }) if !data.is_empty() => match surface {
                    Surface::OpenAi => vec![
                        openai_compat::to_openai_chunk(&data, &model),
                        DONE_FRAME.to_string(),
                    ],
                    _ => vec![format!("data: {data}\n\n")],
                },
                Ok(_) => Vec::new(),
                Err(err) => {
                    tracing::warn!(request_id = %request_id, error = %err, "fake stream failed");
                    vec![error_frame(&err.to_string())]
                }
            };
            for frame in frames {
                if sender.send(Ok(Bytes::from(frame))).await.is_err() {
                    break;
                }
            }
        });

        finish(
            surface,
            sse_response(),
            Body::from_stream(ReceiverStream::new(receiver)),
        )
    }
}

/// Pops the fake discipline's fixed sequence: headers, one data slot, then
/// the terminal event. A `stream_close` in the data slot means no payload.
async fn collect_buffered(queue: &EventQueue) -> Result<BufferedPayload, RelayError> {
    let (status, headers) = match queue.pop().await? {
        ResponseEvent::ResponseHeaders { status, headers } => (status, headers),
        ResponseEvent::Error { status, message } => {
            return Err(RelayError::UpstreamFailure { status, message });
        }
        other => return Err(unexpected_event(&other)),
    };

    let data = match queue.pop().await? {
        ResponseEvent::Chunk { data } => data,
        ResponseEvent::StreamClose => {
            return Ok(BufferedPayload {
                status,
                headers,
                data: None,
            });
        }
        ResponseEvent::Error { status, message } => {
            return Err(RelayError::UpstreamFailure { status, message });
        }
        other => return Err(unexpected_event(&other)),
    };

    match queue.pop().await? {
        ResponseEvent::StreamClose => {}
        ResponseEvent::Error { status, message } => {
            return Err(RelayError::UpstreamFailure { status, message });
        }
        other => {
            tracing::warn!(event_type = other.kind(), "ignoring event after buffered payload");
        }
    }

    Ok(BufferedPayload {
        status,
        headers,
        data: Some(data),
    })
}

/// Incremental response body for the real discipline.
struct RealBody {
    lease: QueueLease,
    refragmenter: Option<SseRefragmenter>,
    event_stream: bool,
    finished: bool,
}

impl RealBody {
    fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        stream::unfold(self, |mut body| async move {
            let frame = body.next_frame().await?;
            Some((Ok(Bytes::from(frame)), body))
        })
    }

    async fn next_frame(&mut self) -> Option<String> {
        while !self.finished {
            let frame = match self.lease.queue().pop().await {
                Ok(ResponseEvent::Chunk { data }) => match self.refragmenter.as_mut() {
                    Some(refragmenter) => refragmenter.push(&data),
                    None => data,
                },
                Ok(ResponseEvent::StreamClose) => {
                    self.finished = true;
                    match self.refragmenter.as_mut() {
                        Some(refragmenter) => {
                            let mut tail = refragmenter.finish();
                            tail.push_str(DONE_FRAME);
                            tail
                        }
                        None => String::new(),
                    }
                }
                Ok(ResponseEvent::Error { status, message }) => {
                    self.finished = true;
                    tracing::warn!(
                        request_id = %self.lease.request_id(),
                        status,
                        error = %message,
                        "upstream failed mid-stream"
                    );
                    self.failure_frame(&message)
                }
                Ok(ResponseEvent::ResponseHeaders { .. }) => {
                    tracing::debug!(request_id = %self.lease.request_id(), "ignoring repeated response headers");
                    String::new()
                }
                Err(QueueClosed) => {
                    self.finished = true;
                    tracing::warn!(
                        account = %self.lease.session().account(),
                        request_id = %self.lease.request_id(),
                        "tunnel closed mid-stream"
                    );
                    self.failure_frame("tunnel closed before the response completed")
                }
            };
            if !frame.is_empty() {
                return Some(frame);
            }
        }
        None
    }

    /// Headers are already flushed, so failures can only be reported in-band.
    fn failure_frame(&self, message: &str) -> String {
        if self.event_stream {
            error_frame(message)
        } else {
            String::new()
        }
    }
}

fn unexpected_event(event: &ResponseEvent) -> RelayError {
    RelayError::ProtocolError {
        message: format!("unexpected {} event", event.kind()),
    }
}

fn with_json_content_type(mut builder: Builder) -> Builder {
    if let Some(headers) = builder.headers_mut() {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    builder
}

fn finish(surface: Surface, builder: Builder, body: Body) -> Result<Response, ApiError> {
    builder.body(body).map_err(|err| {
        ApiError::new(
            surface,
            RelayError::StreamError {
                message: err.to_string(),
            },
        )
    })
}
