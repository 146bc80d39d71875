use super::*;

use axum::http::response::Builder;
use axum::http::{HeaderName, HeaderValue, Uri};
use browser_relay_protocol::next_request_id;

/// Request headers that never cross the tunnel.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "authorization",
    ACCOUNT_HEADER,
];

/// Upstream response headers that no longer describe the relayed body.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "content-encoding",
];

pub(super) const EVENT_STREAM: &str = "text/event-stream";

pub(super) fn sanitize_request_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut sanitized: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if STRIPPED_REQUEST_HEADERS.contains(&name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        sanitized
            .entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    sanitized
}

/// Starts a response carrying the upstream status and relayable headers.
pub(super) fn relayed_response(
    status: u16,
    headers: &BTreeMap<String, String>,
    event_stream: bool,
) -> Builder {
    let mut builder = Response::builder().status(relay_status(status));
    let mut has_content_type = false;
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::debug!(header = %lower, "skipping unrelayable upstream header");
            continue;
        };
        has_content_type |= name == header::CONTENT_TYPE;
        builder = builder.header(name, value);
    }
    if event_stream && !has_content_type {
        builder = builder.header(header::CONTENT_TYPE, EVENT_STREAM);
    }
    builder
}

pub(super) fn sse_response() -> Builder {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM)
        .header(header::CACHE_CONTROL, "no-cache")
}

pub(super) fn relay_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

pub(super) fn keepalive_frame(surface: Surface) -> String {
    match surface {
        Surface::OpenAi => {
            let frame = json!({
                "id": format!("cmpl-{}", next_request_id()),
                "choices": [{ "delta": {} }],
            });
            format!("data: {frame}\n\n")
        }
        _ => "data: {}\n\n".to_string(),
    }
}

pub(super) fn error_frame(message: &str) -> String {
    let frame = json!({ "error": { "message": format!("[proxy] {message}") } });
    format!("data: {frame}\n\n")
}

/// Renders a URI for logs with any `key` query value masked.
pub(super) fn redact_key(uri: &Uri) -> String {
    let Some(query) = uri.query() else {
        return uri.path().to_string();
    };
    let masked: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some(("key", _)) => "key=<redacted>".to_string(),
            _ => pair.to_string(),
        })
        .collect();
    format!("{}?{}", uri.path(), masked.join("&"))
}
