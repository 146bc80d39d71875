use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    PermissionDenied,
    AccountRequired,
    AmbiguousAccount,
    NoConnection,
    UpstreamFailure,
    Cancelled,
    ProtocolError,
    QueueClosed,
    StreamError,
    ModeInvalid,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:browser-relay:error:invalid_request",
            Self::TokenInvalid => "urn:browser-relay:error:token_invalid",
            Self::PermissionDenied => "urn:browser-relay:error:permission_denied",
            Self::AccountRequired => "urn:browser-relay:error:account_required",
            Self::AmbiguousAccount => "urn:browser-relay:error:ambiguous_account",
            Self::NoConnection => "urn:browser-relay:error:no_connection",
            Self::UpstreamFailure => "urn:browser-relay:error:upstream_failure",
            Self::Cancelled => "urn:browser-relay:error:cancelled",
            Self::ProtocolError => "urn:browser-relay:error:protocol_error",
            Self::QueueClosed => "urn:browser-relay:error:queue_closed",
            Self::StreamError => "urn:browser-relay:error:stream_error",
            Self::ModeInvalid => "urn:browser-relay:error:mode_invalid",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::PermissionDenied => "Permission Denied",
            Self::AccountRequired => "Account Required",
            Self::AmbiguousAccount => "Ambiguous Account",
            Self::NoConnection => "No Connection",
            Self::UpstreamFailure => "Upstream Failure",
            Self::Cancelled => "Cancelled",
            Self::ProtocolError => "Protocol Error",
            Self::QueueClosed => "Queue Closed",
            Self::StreamError => "Stream Error",
            Self::ModeInvalid => "Mode Invalid",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::PermissionDenied => 403,
            Self::AccountRequired => 400,
            Self::AmbiguousAccount => 409,
            Self::NoConnection => 503,
            Self::UpstreamFailure => 504,
            Self::Cancelled => 502,
            Self::ProtocolError => 502,
            Self::QueueClosed => 500,
            Self::StreamError => 502,
            Self::ModeInvalid => 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unauthorized")]
    TokenInvalid { message: Option<String> },
    #[error("permission denied")]
    PermissionDenied { message: Option<String> },
    #[error("account required")]
    AccountRequired,
    #[error("shared key is ambiguous: {connected} accounts connected")]
    AmbiguousAccount { connected: usize },
    #[error("account {account} is not connected")]
    NoConnection { account: String },
    /// Carries the status reported by the agent so it can be relayed verbatim.
    #[error("{message}")]
    UpstreamFailure { status: u16, message: String },
    #[error("cancelled: {message}")]
    Cancelled { message: String },
    #[error("protocol error: {message}")]
    ProtocolError { message: String },
    #[error("queue closed")]
    QueueClosed,
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("invalid mode: {mode}")]
    ModeInvalid { mode: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::PermissionDenied { .. } => ErrorType::PermissionDenied,
            Self::AccountRequired => ErrorType::AccountRequired,
            Self::AmbiguousAccount { .. } => ErrorType::AmbiguousAccount,
            Self::NoConnection { .. } => ErrorType::NoConnection,
            Self::UpstreamFailure { .. } => ErrorType::UpstreamFailure,
            Self::Cancelled { .. } => ErrorType::Cancelled,
            Self::ProtocolError { .. } => ErrorType::ProtocolError,
            Self::QueueClosed => ErrorType::QueueClosed,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::ModeInvalid { .. } => ErrorType::ModeInvalid,
        }
    }

    /// HTTP status for this error. Upstream failures keep the agent's status.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UpstreamFailure { status, .. } if (400..=599).contains(status) => *status,
            other => other.error_type().status_code(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.status = self.status_code();

        let mut extensions = Map::new();
        match self {
            Self::TokenInvalid { message: Some(message) }
            | Self::PermissionDenied { message: Some(message) } => {
                extensions.insert("message".to_string(), Value::String(message.clone()));
            }
            Self::NoConnection { account } => {
                extensions.insert("account".to_string(), Value::String(account.clone()));
            }
            Self::AmbiguousAccount { connected } => {
                extensions.insert(
                    "connected".to_string(),
                    Value::Number(serde_json::Number::from(*connected as u64)),
                );
            }
            Self::ModeInvalid { mode } => {
                extensions.insert("mode".to_string(), Value::String(mode.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
