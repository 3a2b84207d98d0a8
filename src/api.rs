use crate::config::Credentials;
use crate::error::{ChatError, ErrorCode};
use crate::models::{Message, ModelConfig, Role};
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// Alias for the stream type we return. Dropping it cancels the request.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Everything the backend needs for one turn.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: ModelConfig,
    pub credentials: Credentials,
    pub system_instruction: Option<String>,
    pub messages: Vec<Message>,
}

// Trait defining the interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    // Returns a stream of content deltas, terminated by end of stream or an error item.
    async fn send_chat_stream_request(&self, request: &ChatRequest) -> Result<DeltaStream, ChatError>;
}

/// Reads the model name out of `provider_options`.
pub fn model_name(config: &ModelConfig) -> Result<String, ChatError> {
    let options_json = config.provider_options.as_deref().unwrap_or("{}");
    let options: serde_json::Value = serde_json::from_str(options_json).map_err(|e| {
        ChatError::new(
            ErrorCode::InvalidRequest,
            format!("Failed to parse provider_options JSON: {}", e),
        )
    })?;
    options["model"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ChatError::new(
                ErrorCode::InvalidRequest,
                format!("Missing 'model' field in provider_options for '{}'", config.name),
            )
        })
}

// --- Gemini Provider Implementation ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct FileData {
    mime_type: String,
    file_uri: String,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

/// One parsed SSE event.
#[derive(Debug, PartialEq, Eq)]
struct ParsedChunk {
    text: Option<String>,
    finished: bool,
}

const BLOCKED_FINISH_REASONS: &[&str] = &["SAFETY", "RECITATION", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

fn to_content(message: &Message) -> Content {
    let mut parts = Vec::new();
    if !message.content.is_empty() {
        parts.push(Part {
            text: Some(message.content.clone()),
            ..Part::default()
        });
    }
    for attachment in &message.attachments {
        parts.push(Part {
            inline_data: Some(InlineData {
                mime_type: attachment.mime_type.clone(),
                data: attachment.data.clone(),
            }),
            ..Part::default()
        });
    }
    for reference in message.file_references.iter().filter(|r| r.is_ready()) {
        parts.push(Part {
            file_data: Some(FileData {
                mime_type: reference.mime_type.clone(),
                file_uri: reference.uri.clone(),
            }),
            ..Part::default()
        });
    }
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "model",
    };
    Content {
        role: Some(role.to_string()),
        parts,
    }
}

fn build_body(request: &ChatRequest) -> GenerateContentBody {
    GenerateContentBody {
        contents: request
            .messages
            .iter()
            .map(to_content)
            .filter(|content| !content.parts.is_empty())
            .collect(),
        system_instruction: request.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part {
                text: Some(text.clone()),
                ..Part::default()
            }],
        }),
    }
}

fn parse_event_data(data: &str) -> Result<ParsedChunk, ChatError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(ParsedChunk {
            text: None,
            finished: data == "[DONE]",
        });
    }

    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            // Tolerate keep-alive pings; everything else is malformed.
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
                    log::debug!("Received stream ping event, skipping.");
                    return Ok(ParsedChunk { text: None, finished: false });
                }
            }
            log::warn!("Failed to parse stream chunk: {} - Data: {}", e, data);
            return Err(ChatError::new(
                ErrorCode::MalformedStream,
                format!("Failed to parse stream chunk: {}", e),
            ));
        }
    };

    if let Some(error) = chunk.error {
        let code = error
            .code
            .and_then(|c| reqwest::StatusCode::from_u16(c).ok())
            .map(ErrorCode::from_status)
            .unwrap_or(ErrorCode::MalformedStream);
        return Err(ChatError::new(code, format!("Backend reported an error: {}", error.message)));
    }

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(ParsedChunk { text: None, finished: false });
    };

    if let Some(reason) = candidate.finish_reason.as_deref() {
        if BLOCKED_FINISH_REASONS.contains(&reason) {
            return Err(ChatError::new(
                ErrorCode::InvalidRequest,
                format!("Response blocked by the service ({})", reason),
            ));
        }
    }

    let text: String = candidate
        .content
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    Ok(ParsedChunk {
        text: (!text.is_empty()).then_some(text),
        finished: candidate.finish_reason.is_some(),
    })
}

fn event_error(err: EventStreamError<reqwest::Error>) -> ChatError {
    match err {
        EventStreamError::Transport(e) => ChatError::from(e),
        other => ChatError::new(
            ErrorCode::MalformedStream,
            format!("Error reading stream event: {}", other),
        ),
    }
}

/// Turns raw SSE payloads into content deltas. A stream that ends before a
/// finish marker yields a trailing `MalformedStream` error.
fn delta_stream<S, E>(events: S, map_err: fn(E) -> ChatError) -> DeltaStream
where
    S: Stream<Item = Result<String, E>> + Send + 'static,
    E: Send + 'static,
{
    let state = (Box::pin(events), false, false);
    let deltas = stream::unfold(state, move |(mut events, mut finished, done)| async move {
        if done {
            return None;
        }
        loop {
            match events.next().await {
                Some(Ok(data)) => match parse_event_data(&data) {
                    Ok(chunk) => {
                        finished |= chunk.finished;
                        if let Some(text) = chunk.text {
                            return Some((Ok(text), (events, finished, false)));
                        }
                    }
                    Err(e) => return Some((Err(e), (events, finished, true))),
                },
                Some(Err(e)) => return Some((Err(map_err(e)), (events, finished, true))),
                None if finished => return None,
                None => {
                    let err = ChatError::new(ErrorCode::MalformedStream, "Stream ended unexpectedly");
                    return Some((Err(err), (events, finished, true)));
                }
            }
        }
    });
    Box::pin(deltas)
}

pub struct GeminiProvider {
    client: Client,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMApiProvider for GeminiProvider {
    async fn send_chat_stream_request(&self, request: &ChatRequest) -> Result<DeltaStream, ChatError> {
        let model_name = model_name(&request.model)?;
        log::info!(
            "Sending STREAM request to {} using model: {}",
            request.model.api_url,
            model_name
        );

        let request_url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            request.model.api_url.trim_end_matches('/'),
            model_name
        );

        let response = self
            .client
            .post(&request_url)
            .header("x-goog-api-key", request.credentials.api_key())
            .json(&build_body(request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Stream request failed with status {}: {}", status, error_body);
            return Err(ChatError::from_response(status, &error_body));
        }

        let events = response
            .bytes_stream()
            .eventsource()
            .map(|event| event.map(|e| e.data));
        Ok(delta_stream(events, event_error))
    }
}
