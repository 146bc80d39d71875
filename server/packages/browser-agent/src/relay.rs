//! Streams an upstream response back through the tunnel as response events.

use std::collections::BTreeMap;
use std::time::Instant;

use browser_relay_protocol::{RequestEnvelope, ResponseEvent, ResponseFrame, StreamingMode};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::executor::{
    failure_message, ExecutorError, PendingOperation, RemoteExecutor, FAILURE_STATUS,
};
use crate::transport::ConnectionSink;

const STREAM_ACTION: &str = "streamGenerateContent";
const DATA_PREFIX: &str = "data:";
const VENDOR_STOP: &str = "STOP";

/// Where response frames go. The tunnel in production, a collector in tests.
pub trait FrameSink {
    fn send_frame(&self, frame: ResponseFrame);
}

impl<S: FrameSink + ?Sized> FrameSink for std::sync::Arc<S> {
    fn send_frame(&self, frame: ResponseFrame) {
        (**self).send_frame(frame);
    }
}

impl FrameSink for ConnectionSink {
    fn send_frame(&self, frame: ResponseFrame) {
        match frame.encode() {
            Ok(text) => {
                self.send(text);
            }
            Err(err) => {
                tracing::warn!(request_id = %frame.request_id, error = %err, "failed to encode frame");
            }
        }
    }
}

/// Decodes one inbound tunnel frame and runs it to completion.
pub async fn handle_message<S: FrameSink>(executor: &RemoteExecutor, sink: &S, text: &str) {
    if let Some((envelope, pending)) = accept_message(executor, sink, text) {
        run_envelope(executor, sink, envelope, pending).await;
    }
}

/// Decodes one inbound tunnel frame and registers it as in flight before
/// anything is awaited. Malformed frames are answered (or dropped) here and
/// yield `None`.
pub fn accept_message<S: FrameSink>(
    executor: &RemoteExecutor,
    sink: &S,
    text: &str,
) -> Option<(RequestEnvelope, PendingOperation)> {
    match RequestEnvelope::decode(text) {
        Ok(envelope) => {
            let pending = executor.track(&envelope.request_id);
            Some((envelope, pending))
        }
        Err(err) => {
            match err.request_id() {
                Some(request_id) => {
                    tracing::warn!(request_id = %request_id, error = %err, "rejecting malformed envelope");
                    sink.send_frame(ResponseFrame::new(
                        request_id,
                        ResponseEvent::Error {
                            status: FAILURE_STATUS,
                            message: format!("browser error: {err}"),
                        },
                    ));
                }
                None => tracing::warn!(error = %err, "dropping malformed envelope"),
            }
            None
        }
    }
}

/// Executes one envelope and emits its full event sequence, ending in
/// exactly one `stream_close` or `error`.
pub async fn process_envelope<S: FrameSink>(
    executor: &RemoteExecutor,
    sink: &S,
    envelope: RequestEnvelope,
) {
    let pending = executor.track(&envelope.request_id);
    run_envelope(executor, sink, envelope, pending).await;
}

/// Runs an envelope already registered through [`RemoteExecutor::track`].
pub async fn run_envelope<S: FrameSink>(
    executor: &RemoteExecutor,
    sink: &S,
    envelope: RequestEnvelope,
    pending: PendingOperation,
) {
    let started = Instant::now();
    tracing::info!(
        request_id = %envelope.request_id,
        method = %envelope.method,
        path = %envelope.path,
        mode = %envelope.streaming_mode,
        "executing request"
    );

    let result: Result<(), ExecutorError> = async {
        let response = executor.execute(&envelope, pending.token()).await?;
        relay_response(&envelope, response, pending.token(), sink).await
    }
    .await;

    match result {
        Ok(()) => tracing::debug!(
            request_id = %envelope.request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request complete"
        ),
        Err(err) => {
            let message = failure_message(&err);
            tracing::warn!(request_id = %envelope.request_id, error = %message, "request failed");
            sink.send_frame(ResponseFrame::new(
                envelope.request_id.as_str(),
                ResponseEvent::Error {
                    status: FAILURE_STATUS,
                    message,
                },
            ));
        }
    }
}

/// Emits headers, then the body as decoded text, then `stream_close`.
/// Cancellation is honored for the whole body read.
pub async fn relay_response<S: FrameSink>(
    envelope: &RequestEnvelope,
    response: reqwest::Response,
    token: &CancellationToken,
    sink: &S,
) -> Result<(), ExecutorError> {
    let request_id = envelope.request_id.as_str();
    sink.send_frame(ResponseFrame::new(
        request_id,
        ResponseEvent::ResponseHeaders {
            status: response.status().as_u16(),
            headers: collect_headers(response.headers()),
        },
    ));

    let streaming = envelope.path.contains(STREAM_ACTION);
    let mut relay = BodyRelay::new(request_id, envelope.streaming_mode, streaming, sink);
    let mut body = response.bytes_stream();
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return Err(ExecutorError::Cancelled),
            next = body.next() => next,
        };
        let Some(bytes) = next else {
            break;
        };
        relay.push(&bytes?);
    }
    relay.finish();
    Ok(())
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    collected
}

struct BodyRelay<'a, S> {
    request_id: &'a str,
    mode: StreamingMode,
    streaming: bool,
    sink: &'a S,
    decoder: Utf8Decoder,
    finish_reason: FinishReasonTracker,
    buffered: String,
    chunks: usize,
}

impl<'a, S: FrameSink> BodyRelay<'a, S> {
    fn new(request_id: &'a str, mode: StreamingMode, streaming: bool, sink: &'a S) -> Self {
        Self {
            request_id,
            mode,
            streaming,
            sink,
            decoder: Utf8Decoder::default(),
            finish_reason: FinishReasonTracker::default(),
            buffered: String::new(),
            chunks: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let text = self.decoder.decode(bytes);
        self.deliver(text);
    }

    fn deliver(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        match self.mode {
            StreamingMode::Real => {
                if self.streaming {
                    self.finish_reason.observe(&text);
                }
                self.chunks += 1;
                self.sink
                    .send_frame(ResponseFrame::new(self.request_id, ResponseEvent::Chunk { data: text }));
            }
            StreamingMode::Fake => self.buffered.push_str(&text),
        }
    }

    fn finish(mut self) {
        let tail = self.decoder.finish();
        self.deliver(tail);

        match self.mode {
            StreamingMode::Real => {
                if self.streaming {
                    self.finish_reason.flush();
                    match self.finish_reason.last() {
                        Some(VENDOR_STOP) => tracing::info!(
                            request_id = %self.request_id,
                            chunks = self.chunks,
                            "stream completed"
                        ),
                        other => tracing::warn!(
                            request_id = %self.request_id,
                            chunks = self.chunks,
                            finish_reason = other.unwrap_or("none"),
                            "stream ended without STOP"
                        ),
                    }
                }
            }
            StreamingMode::Fake => {
                if self.streaming {
                    tracing::info!(
                        request_id = %self.request_id,
                        bytes = self.buffered.len(),
                        finish_reason = %buffered_finish_reason(&self.buffered),
                        "buffered response complete"
                    );
                }
                if !self.buffered.is_empty() {
                    let data = std::mem::take(&mut self.buffered);
                    self.sink
                        .send_frame(ResponseFrame::new(self.request_id, ResponseEvent::Chunk { data }));
                }
            }
        }

        self.sink
            .send_frame(ResponseFrame::new(self.request_id, ResponseEvent::StreamClose));
    }
}

fn buffered_finish_reason(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => candidate_finish_reason(&value)
            .unwrap_or("none")
            .to_string(),
        Err(_) => "non-JSON body".to_string(),
    }
}

fn candidate_finish_reason(value: &Value) -> Option<&str> {
    value
        .get("candidates")?
        .as_array()?
        .iter()
        .filter_map(|candidate| candidate.get("finishReason")?.as_str())
        .last()
}

/// Incremental UTF-8 decoding across arbitrary byte boundaries. Invalid
/// sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::new();
        let mut offset = 0;
        loop {
            match std::str::from_utf8(&self.pending[offset..]) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    offset = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_end = offset + err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[offset..valid_end]) {
                        decoded.push_str(valid);
                    }
                    match err.error_len() {
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            offset = valid_end + invalid;
                        }
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            offset = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..offset);
        decoded
    }

    /// Flushes a truncated trailing sequence as U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Remembers the last `finishReason` seen in SSE data lines.
#[derive(Debug, Default)]
pub struct FinishReasonTracker {
    line: String,
    last: Option<String>,
}

impl FinishReasonTracker {
    pub fn observe(&mut self, text: &str) {
        self.line.push_str(text);
        while let Some(newline) = self.line.find('\n') {
            let line: String = self.line.drain(..=newline).collect();
            self.inspect(line.trim_end());
        }
    }

    pub fn flush(&mut self) {
        let line = std::mem::take(&mut self.line);
        self.inspect(line.trim_end());
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    fn inspect(&mut self, line: &str) {
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let Ok(value) = serde_json::from_str::<Value>(data.trim_start()) else {
            return;
        };
        if let Some(reason) = candidate_finish_reason(&value) {
            self.last = Some(reason.to_string());
        }
    }
}
