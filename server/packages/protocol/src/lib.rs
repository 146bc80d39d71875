//! Wire types for the relay tunnel.
//!
//! The server sends one [`RequestEnvelope`] per proxied HTTP call; the agent
//! answers with a sequence of [`ResponseFrame`]s sharing the same
//! `request_id`: at most one `response_headers`, any number of `chunk`s, then
//! exactly one terminal `stream_close` or `error`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Query parameter the agent uses to declare its account at connect time.
pub const ACCOUNT_QUERY_PARAM: &str = "account";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("malformed frame: {source}")]
    Malformed {
        request_id: Option<String>,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unknown streaming mode: {0}")]
    UnknownMode(String),
}

impl ProtocolError {
    /// Request id recovered from a frame that otherwise failed to decode.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Malformed { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// How the upstream body is delivered back through the tunnel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// Buffer the complete upstream body and deliver it as a single chunk.
    #[default]
    Fake,
    /// Relay upstream chunks as they are decoded.
    Real,
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fake => "fake",
            Self::Real => "real",
        }
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamingMode {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fake" => Ok(Self::Fake),
            "real" => Ok(Self::Real),
            other => Err(ProtocolError::UnknownMode(other.to_string())),
        }
    }
}

/// Server → agent: one logical HTTP request to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequestEnvelope {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub streaming_mode: StreamingMode,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_openai: bool,
}

impl RequestEnvelope {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_frame(text)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Agent → server: one event of a response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseFrame {
    pub request_id: String,
    #[serde(flatten)]
    pub event: ResponseEvent,
}

impl ResponseFrame {
    pub fn new(request_id: impl Into<String>, event: ResponseEvent) -> Self {
        Self {
            request_id: request_id.into(),
            event,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_frame(text)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ResponseEvent {
    ResponseHeaders {
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Chunk {
        data: String,
    },
    StreamClose,
    Error {
        status: u16,
        message: String,
    },
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamClose | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseHeaders { .. } => "response_headers",
            Self::Chunk { .. } => "chunk",
            Self::StreamClose => "stream_close",
            Self::Error { .. } => "error",
        }
    }
}

/// Allocates a request id that is unique for the life of the process.
pub fn next_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let sequence = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{millis}_{sequence}")
}

/// JSON Schema for both tunnel directions, keyed by frame name.
pub fn tunnel_schema() -> Value {
    let envelope = schemars::schema_for!(RequestEnvelope);
    let frame = schemars::schema_for!(ResponseFrame);
    serde_json::json!({
        "RequestEnvelope": envelope,
        "ResponseFrame": frame,
    })
}

fn decode_frame<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
    let request_id = value
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { request_id, source })
}

fn is_false(value: &bool) -> bool {
    !*value
}
