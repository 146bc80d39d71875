//! OpenAI chat-completions compatibility for the Gemini-native upstream.
//!
//! Requests arriving on `/v1/chat/completions` are rewritten into
//! `generateContent` calls before they enter the tunnel, and the upstream
//! bodies coming back are reshaped into OpenAI completions, chunks and model
//! lists. Everything here is pure; the dispatcher owns the I/O.

use std::collections::BTreeMap;

use browser_relay_protocol::{next_request_id, RequestEnvelope, StreamingMode};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

pub const DEFAULT_MODEL: &str = "gemini-pro";
pub const MODEL_OWNER: &str = "google";
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

const DATA_PREFIX: &str = "data: ";
const VENDOR_STOP: &str = "STOP";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<Number>,
    #[serde(default)]
    pub max_tokens: Option<Number>,
    #[serde(default)]
    pub top_p: Option<Number>,
    #[serde(default)]
    pub top_k: Option<Number>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub thinking_budget: Option<f64>,
}

impl ChatCompletionRequest {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|model| !model.is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_url: Option<ImageUrl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<VendorContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<VendorContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<VendorPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VendorPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thought_generation_token_budget: u64,
}

/// Text and finish status of the first candidate in an upstream body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub text: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VendorResponse {
    #[serde(default)]
    candidates: Vec<VendorCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorCandidate {
    #[serde(default)]
    content: Option<VendorCandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VendorCandidateContent {
    #[serde(default)]
    parts: Vec<VendorCandidatePart>,
}

#[derive(Debug, Deserialize)]
struct VendorCandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VendorModelList {
    #[serde(default)]
    models: Vec<VendorModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorModel {
    name: String,
    #[serde(default)]
    update_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Builds the tunnel envelope for an OpenAI chat-completions call.
pub fn from_openai_request(
    request: &ChatCompletionRequest,
    request_id: &str,
    headers: BTreeMap<String, String>,
    query: &BTreeMap<String, String>,
    streaming_mode: StreamingMode,
) -> Result<RequestEnvelope, serde_json::Error> {
    let body = serde_json::to_string(&to_vendor_request(request))?;
    Ok(RequestEnvelope {
        request_id: request_id.to_string(),
        method: "POST".to_string(),
        path: vendor_path(request),
        headers,
        query_params: vendor_query(query, request.stream),
        body: Some(body),
        streaming_mode,
        is_openai: true,
    })
}

pub fn vendor_path(request: &ChatCompletionRequest) -> String {
    let action = if request.stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    format!("/v1beta/models/{}:{action}", request.model())
}

/// Caller query minus the relay `key`, plus `alt=sse` for streaming calls.
pub fn vendor_query(query: &BTreeMap<String, String>, stream: bool) -> BTreeMap<String, String> {
    let mut query = query.clone();
    query.remove("key");
    if stream {
        query.insert("alt".to_string(), "sse".to_string());
    }
    query
}

pub fn to_vendor_request(request: &ChatCompletionRequest) -> GenerateContentRequest {
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    for message in &request.messages {
        if message.role == "system" {
            let text = match &message.content {
                Some(MessageContent::Text(text)) => text.clone(),
                Some(MessageContent::Parts(parts)) => parts
                    .iter()
                    .find(|part| part.kind == "text")
                    .and_then(|part| part.text.clone())
                    .unwrap_or_default(),
                None => String::new(),
            };
            system_parts.push(VendorPart::Text { text });
            continue;
        }

        let parts = match &message.content {
            Some(MessageContent::Text(text)) => vec![VendorPart::Text { text: text.clone() }],
            Some(MessageContent::Parts(parts)) => parts.iter().filter_map(convert_part).collect(),
            None => Vec::new(),
        };
        if parts.is_empty() {
            continue;
        }
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        contents.push(VendorContent {
            role: Some(role.to_string()),
            parts,
        });
    }

    let system_instruction = (!system_parts.is_empty()).then(|| VendorContent {
        role: None,
        parts: system_parts,
    });

    let config = GenerationConfig {
        temperature: request.temperature.clone(),
        max_output_tokens: request.max_tokens.clone(),
        top_p: request.top_p.clone(),
        top_k: request.top_k.clone(),
        stop_sequences: request.stop.as_ref().map(|stop| match stop {
            StopSequences::One(value) => vec![value.clone()],
            StopSequences::Many(values) => values.clone(),
        }),
        thinking_config: request
            .thinking_budget
            .filter(|budget| *budget > 0.0)
            .map(|budget| ThinkingConfig {
                thought_generation_token_budget: budget.floor() as u64,
            }),
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: (!config.is_empty()).then_some(config),
    }
}

fn convert_part(part: &ContentPart) -> Option<VendorPart> {
    match part.kind.as_str() {
        "text" => Some(VendorPart::Text {
            text: part.text.clone().unwrap_or_default(),
        }),
        "image_url" => {
            let url = part.image_url.as_ref()?.url.as_str();
            let (mime_type, data) = parse_image_data_uri(url)?;
            Some(VendorPart::InlineData {
                inline_data: InlineData { mime_type, data },
            })
        }
        _ => None,
    }
}

/// Splits `data:image/<subtype>;base64,<payload>` into MIME type and payload.
pub fn parse_image_data_uri(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:image/")?;
    let (subtype, payload) = rest.split_once(";base64,")?;
    let subtype_ok = !subtype.is_empty()
        && subtype
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if !subtype_ok || payload.is_empty() {
        return None;
    }
    Some((format!("image/{subtype}"), payload.to_string()))
}

/// Unparseable bodies summarize to empty text with no finish reason.
pub fn parse_candidate(body: &str) -> CandidateSummary {
    let Ok(response) = serde_json::from_str::<VendorResponse>(body) else {
        return CandidateSummary::default();
    };
    let Some(candidate) = response.candidates.into_iter().next() else {
        return CandidateSummary::default();
    };
    let text = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    CandidateSummary {
        text,
        finish_reason: candidate.finish_reason,
    }
}

/// One `data: {...}\n\n` chat.completion.chunk frame for an upstream body.
pub fn to_openai_chunk(body: &str, model: &str) -> String {
    let summary = parse_candidate(body);
    let delta = if summary.text.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::json!({ "content": summary.text })
    };
    let finish = (summary.finish_reason.as_deref() == Some(VENDOR_STOP)).then_some("stop");
    let chunk = serde_json::json!({
        "id": completion_id(),
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish }],
    });
    format!("{DATA_PREFIX}{chunk}\n\n")
}

/// A complete chat.completion body for an upstream body.
pub fn to_openai_response(body: &str, model: &str) -> Value {
    let summary = parse_candidate(body);
    let finish = if summary.finish_reason.as_deref() == Some(VENDOR_STOP) {
        "stop"
    } else {
        "length"
    };
    serde_json::json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": summary.text },
            "finish_reason": finish,
        }],
    })
}

pub fn to_openai_models(body: &str) -> Result<ModelList, serde_json::Error> {
    let list: VendorModelList = serde_json::from_str(body)?;
    let now = chrono::Utc::now().timestamp();
    let data = list
        .models
        .into_iter()
        .map(|model| ModelInfo {
            id: model.name.replacen("models/", "", 1),
            object: "model".to_string(),
            created: model
                .update_time
                .as_deref()
                .and_then(|value| chrono::DateTime::parse_from_rfc3339(value).ok())
                .map(|time| time.timestamp())
                .unwrap_or(now),
            owned_by: MODEL_OWNER.to_string(),
        })
        .collect();
    Ok(ModelList {
        object: "list".to_string(),
        data,
    })
}

fn completion_id() -> String {
    format!("chatcmpl-{}", next_request_id())
}

/// Reshapes a vendor SSE byte stream into OpenAI chunk frames.
///
/// Tunnel chunks do not respect line boundaries, so a partial trailing line
/// is held back until the rest of it arrives.
#[derive(Debug)]
pub struct SseRefragmenter {
    model: String,
    pending: String,
}

impl SseRefragmenter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            pending: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return String::new();
        };
        let complete: String = self.pending.drain(..=last_newline).collect();
        complete
            .lines()
            .filter_map(|line| line.strip_prefix(DATA_PREFIX))
            .map(|data| to_openai_chunk(data, &self.model))
            .collect()
    }

    /// Converts whatever is left once the upstream stream has ended.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        rest.trim_end_matches('\r')
            .strip_prefix(DATA_PREFIX)
            .map(|data| to_openai_chunk(data, &self.model))
            .unwrap_or_default()
    }
}
