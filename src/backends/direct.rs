//! Direct-model backend
//!
//! The lower-latency engine: one streamed generation against a smaller
//! model, with a minimal fixed toolset resolved locally. The blocking path
//! allows a single tool round (engine asks, we answer, one follow-up
//! completion); the streaming path requests plain generation so the first
//! delta is never delayed by a probe call. There is no engine-side session
//! state, so `cleanup` is a no-op.

use crate::backends::wire::{
    self, ChatCompletionRequest, ToolSpec, WireMessage, WireUsage,
};
use crate::backends::{
    Backend, BackendKind, ExecutionEvent, ExecutionResult, ExecutionStream, ExecutionHandle,
    FinishReason, TokenUsage, ToolCall,
};
use crate::brain::BrainRequest;
use crate::brain::classifier::{ClassificationResult, estimate_tokens};
use crate::brain::messages::MessageAdapter;
use crate::config::BackendEndpointConfig;
use crate::error::{BrainError, BrainResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Value, json};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DirectModelBackend {
    client: reqwest::Client,
    config: BackendEndpointConfig,
    adapter: MessageAdapter,
}

impl DirectModelBackend {
    pub fn new(config: BackendEndpointConfig) -> BrainResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BrainError::Internal(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            config,
            adapter: MessageAdapter::default(),
        })
    }

    /// The fixed toolset this backend resolves locally
    fn fixed_toolset() -> Vec<ToolSpec> {
        vec![ToolSpec::function(
            "current_time",
            "Current server time as a unix timestamp, labeled with the caller's timezone",
            json!({"type": "object", "properties": {}, "required": []}),
        )]
    }

    fn dispatch_fixed_tool(name: &str, timezone: Option<&str>) -> Value {
        match name {
            "current_time" => {
                let unix_seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                json!({
                    "unix_seconds": unix_seconds,
                    "timezone": timezone.unwrap_or("UTC"),
                })
            }
            other => json!({"error": format!("unknown tool: {other}")}),
        }
    }

    fn base_request(&self, messages: Vec<WireMessage>, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model().to_string(),
            messages,
            max_tokens: self.config.max_tokens(),
            temperature: self.config.temperature(),
            stream,
            tools: None,
        }
    }

    fn assemble(&self, request: &BrainRequest, system_prompt: &str) -> Vec<WireMessage> {
        let prepared = self.adapter.prepare(request.turns());
        let turns = self.adapter.for_backend(BackendKind::Direct, &prepared);
        wire::assemble_messages(turns, system_prompt, prepared.system_fragments())
    }
}

#[async_trait]
impl Backend for DirectModelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn execute(
        &self,
        handle: &ExecutionHandle,
        request: &BrainRequest,
        _classification: &ClassificationResult,
        system_prompt: &str,
    ) -> BrainResult<ExecutionResult> {
        let mut messages = self.assemble(request, system_prompt);
        let mut wire_request = self.base_request(messages.clone(), false);
        wire_request.tools = Some(Self::fixed_toolset());

        let mut usage = TokenUsage::default();
        let response =
            wire::complete(&self.client, BackendKind::Direct, &self.config, &wire_request)
                .await?;
        if let Some(u) = response.usage {
            usage.absorb(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        }
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BrainError::BackendExecution {
                backend: BackendKind::Direct.as_str().to_string(),
                reason: "engine returned no choices".to_string(),
            })?;

        let mut tool_calls = Vec::new();
        let (content, finish_reason) = match choice.message.tool_calls {
            // One tool round: answer the calls locally, then a single
            // follow-up completion without tools.
            Some(calls) if !calls.is_empty() => {
                tracing::debug!(
                    execution_id = %handle.id(),
                    count = calls.len(),
                    "Direct engine requested fixed tools"
                );

                let mut tool_messages = Vec::with_capacity(calls.len());
                for call in &calls {
                    let output =
                        Self::dispatch_fixed_tool(&call.function.name, request.timezone());
                    tool_messages.push(WireMessage::tool_result(
                        call.id.clone(),
                        output.to_string(),
                    ));
                    tool_calls.push(ToolCall {
                        name: call.function.name.clone(),
                        input: wire::parse_arguments(&call.function.arguments),
                        output: Some(output),
                    });
                }

                messages.push(WireMessage {
                    role: "assistant".to_string(),
                    content: choice.message.content.clone(),
                    tool_calls: Some(calls),
                    tool_call_id: None,
                });
                messages.extend(tool_messages);

                let follow_up = self.base_request(messages, false);
                let final_response = wire::complete(
                    &self.client,
                    BackendKind::Direct,
                    &self.config,
                    &follow_up,
                )
                .await?;
                if let Some(u) = final_response.usage {
                    usage.absorb(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                }
                let final_choice = final_response.choices.into_iter().next().ok_or_else(|| {
                    BrainError::BackendExecution {
                        backend: BackendKind::Direct.as_str().to_string(),
                        reason: "engine returned no choices after tool round".to_string(),
                    }
                })?;
                (
                    final_choice.message.content.unwrap_or_default(),
                    final_choice.finish_reason,
                )
            }
            _ => (
                choice.message.content.unwrap_or_default(),
                choice.finish_reason,
            ),
        };

        Ok(ExecutionResult {
            content,
            token_usage: usage,
            finish_reason: finish_reason
                .as_deref()
                .map(FinishReason::from_wire)
                .unwrap_or(FinishReason::Stop),
            tool_calls,
            execution_time_ms: handle.started_at().elapsed().as_millis() as u64,
        })
    }

    async fn execute_streaming(
        &self,
        handle: &ExecutionHandle,
        request: &BrainRequest,
        _classification: &ClassificationResult,
        system_prompt: &str,
    ) -> BrainResult<ExecutionStream> {
        let messages = self.assemble(request, system_prompt);
        let prompt_estimate = wire::estimate_message_tokens(&messages);
        let wire_request = self.base_request(messages, true);

        let chunks =
            wire::stream_chat(&self.client, BackendKind::Direct, &self.config, &wire_request)
                .await?;

        Ok(transform_chunks(chunks, handle.started_at(), prompt_estimate))
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> BrainResult<()> {
        tracing::trace!(execution_id = %handle.id(), "Direct backend holds no session state");
        Ok(())
    }
}

struct DirectStreamState {
    chunks: BoxStream<'static, BrainResult<wire::ChatCompletionChunk>>,
    content: String,
    deltas_sent: usize,
    usage: Option<WireUsage>,
    finish: Option<String>,
    started_at: Instant,
    prompt_estimate: u64,
    terminated: bool,
}

/// Pure transform from wire chunks to execution events: deltas in arrival
/// order, then exactly one terminal `Completed`. Token usage is taken from
/// the engine when present, estimated otherwise.
fn transform_chunks(
    chunks: BoxStream<'static, BrainResult<wire::ChatCompletionChunk>>,
    started_at: Instant,
    prompt_estimate: u64,
) -> ExecutionStream {
    let state = DirectStreamState {
        chunks,
        content: String::new(),
        deltas_sent: 0,
        usage: None,
        finish: None,
        started_at,
        prompt_estimate,
        terminated: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.terminated {
                return None;
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => {
                    if let Some(usage) = chunk.usage {
                        state.usage = Some(usage);
                    }
                    let Some(choice) = chunk.choices.into_iter().next() else {
                        continue;
                    };
                    if let Some(reason) = choice.finish_reason {
                        state.finish = Some(reason);
                    }
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            state.content.push_str(&text);
                            state.deltas_sent += 1;
                            return Some((Ok(ExecutionEvent::Delta(text)), state));
                        }
                    }
                }
                Some(Err(err)) => {
                    state.terminated = true;
                    let wrapped = BrainError::Streaming {
                        backend: BackendKind::Direct.as_str().to_string(),
                        deltas_sent: state.deltas_sent,
                        reason: err.to_string(),
                    };
                    return Some((Err(wrapped), state));
                }
                None => {
                    state.terminated = true;
                    let token_usage = match state.usage {
                        Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
                        None => TokenUsage::new(
                            state.prompt_estimate,
                            estimate_tokens(&state.content) as u64,
                        ),
                    };
                    let result = ExecutionResult {
                        content: std::mem::take(&mut state.content),
                        token_usage,
                        finish_reason: state
                            .finish
                            .as_deref()
                            .map(FinishReason::from_wire)
                            .unwrap_or(FinishReason::Stop),
                        tool_calls: Vec::new(),
                        execution_time_ms: state.started_at.elapsed().as_millis() as u64,
                    };
                    return Some((Ok(ExecutionEvent::Completed(result)), state));
                }
            }
        }
    })
    .boxed()
}
