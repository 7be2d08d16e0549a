//! OpenAI-compatible chat-completions wire protocol
//!
//! Both engines speak the same `/chat/completions` dialect, so the request
//! and response shapes, the SSE line framing, and the HTTP plumbing live
//! here. Backends own everything above this layer: message assembly, tool
//! dispatch, and event translation.

use crate::backends::BackendKind;
use crate::brain::messages::NormalizedTurn;
use crate::config::BackendEndpointConfig;
use crate::error::{BrainError, BrainResult};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Error bodies are truncated to this many characters before logging
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub max_tokens: usize,
    pub temperature: f64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Tool result message referencing the call it answers
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

impl ToolSpec {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the engine sent it
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseChoice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatCompletionChunk {
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    /// Incremental tool-call fragments; arguments arrive split across
    /// chunks and are reassembled by index on the consumer side.
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChunkToolCall {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<ChunkFunctionFragment>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChunkFunctionFragment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One decoded server-sent-events frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseFrame {
    Data(String),
    Done,
}

/// Reassembles SSE lines from arbitrary byte chunks
///
/// Engines flush at whatever granularity they like, so a single read may
/// carry half a line or several complete events. Raw bytes accumulate in
/// an internal buffer and only complete lines are decoded on each push; a
/// partial trailing line (including a multi-byte character cut mid-sequence
/// by the transport) waits for the next chunk.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    buffer: BytesMut,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw = self.buffer.split_to(newline + 1);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            let Some(payload) = line.strip_prefix("data:") else {
                // Comments, `event:` lines, and blank separators carry
                // nothing we consume.
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                frames.push(SseFrame::Done);
            } else if !payload.is_empty() {
                frames.push(SseFrame::Data(payload.to_string()));
            }
        }
        frames
    }
}

fn completions_url(config: &BackendEndpointConfig) -> String {
    format!("{}/chat/completions", config.base_url())
}

/// Decode a tool-call argument string. Engines occasionally emit invalid
/// JSON here; the raw text is preserved as a string value in that case so
/// the call is still auditable.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Prompt-side token estimate over assembled wire messages, used when an
/// engine omits usage accounting in its stream.
pub(crate) fn estimate_message_tokens(messages: &[WireMessage]) -> u64 {
    messages
        .iter()
        .filter_map(|m| m.content.as_deref())
        .map(|c| crate::brain::classifier::estimate_tokens(c) as u64)
        .sum()
}

/// Build the wire message list: the rendered system prompt (with any
/// system fragments hoisted from the inbound history appended) followed by
/// the normalized turns.
pub(crate) fn assemble_messages(
    turns: &[NormalizedTurn],
    system_prompt: &str,
    system_fragments: &[String],
) -> Vec<WireMessage> {
    let mut system = system_prompt.trim().to_string();
    for fragment in system_fragments {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(fragment);
    }

    let mut messages = Vec::with_capacity(turns.len() + 1);
    if !system.is_empty() {
        messages.push(WireMessage::system(system));
    }
    for turn in turns {
        messages.push(WireMessage {
            role: turn.role.as_str().to_string(),
            content: Some(turn.content.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    messages
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_LIMIT {
        body.to_string()
    } else {
        let truncated: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        format!("{truncated}…")
    }
}

async fn send_request(
    client: &reqwest::Client,
    backend: BackendKind,
    config: &BackendEndpointConfig,
    request: &ChatCompletionRequest,
) -> BrainResult<reqwest::Response> {
    let url = completions_url(config);
    let response = client.post(&url).json(request).send().await.map_err(|e| {
        BrainError::BackendExecution {
            backend: backend.as_str().to_string(),
            reason: format!("request to {url} failed: {e}"),
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BrainError::BackendExecution {
            backend: backend.as_str().to_string(),
            reason: format!("engine returned {status}: {}", truncate_body(&body)),
        });
    }
    Ok(response)
}

/// One blocking chat completion
pub(crate) async fn complete(
    client: &reqwest::Client,
    backend: BackendKind,
    config: &BackendEndpointConfig,
    request: &ChatCompletionRequest,
) -> BrainResult<ChatCompletionResponse> {
    debug_assert!(!request.stream);
    let response = send_request(client, backend, config, request).await?;
    response
        .json::<ChatCompletionResponse>()
        .await
        .map_err(|e| BrainError::BackendExecution {
            backend: backend.as_str().to_string(),
            reason: format!("malformed completion response: {e}"),
        })
}

struct ChunkStreamState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    lines: SseLineBuffer,
    pending: VecDeque<BrainResult<ChatCompletionChunk>>,
    backend: BackendKind,
    done: bool,
}

/// Streamed chat completion, decoded into typed chunks
///
/// The returned stream ends after the `[DONE]` sentinel or when the engine
/// closes the connection. Transport failures mid-stream surface as one
/// `Err` item followed by the end of the stream. Malformed data frames are
/// logged and skipped rather than killing an otherwise healthy stream.
pub(crate) async fn stream_chat(
    client: &reqwest::Client,
    backend: BackendKind,
    config: &BackendEndpointConfig,
    request: &ChatCompletionRequest,
) -> BrainResult<BoxStream<'static, BrainResult<ChatCompletionChunk>>> {
    debug_assert!(request.stream);
    let response = send_request(client, backend, config, request).await?;

    let state = ChunkStreamState {
        bytes: response.bytes_stream().boxed(),
        lines: SseLineBuffer::new(),
        pending: VecDeque::new(),
        backend,
        done: false,
    };

    Ok(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.lines.push(&chunk) {
                        match frame {
                            SseFrame::Done => state.done = true,
                            SseFrame::Data(payload) => {
                                match serde_json::from_str::<ChatCompletionChunk>(&payload) {
                                    Ok(parsed) => state.pending.push_back(Ok(parsed)),
                                    Err(e) => {
                                        tracing::warn!(
                                            backend = state.backend.as_str(),
                                            error = %e,
                                            "Skipping malformed stream chunk"
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.pending.push_back(Err(BrainError::BackendExecution {
                        backend: state.backend.as_str().to_string(),
                        reason: format!("stream transport error: {e}"),
                    }));
                }
                // Connection closed without [DONE]; treat as end of stream.
                None => state.done = true,
            }
        }
    })
    .boxed())
}
