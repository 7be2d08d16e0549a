//! Tool-agent backend
//!
//! The superset-capability engine: a bounded multi-step loop in which the
//! model may request tool invocations, the dispatcher answers them, and the
//! transcript grows until the model produces a plain reply or the step
//! budget runs out. Streaming executions forward deltas and tool lifecycle
//! events as they happen; tool-call fragments arriving split across stream
//! chunks are reassembled by index before dispatch.
//!
//! Engine-side state is the per-execution transcript scratch, tracked in a
//! session registry keyed by execution id so `cleanup` can release it after
//! aborts as well as normal completion.

use crate::backends::wire::{
    self, ChatCompletionChunk, ChatCompletionRequest, ChunkToolCall, ToolSpec, WireFunctionCall,
    WireMessage, WireToolCall,
};
use crate::backends::{
    Backend, BackendKind, ExecutionEvent, ExecutionHandle, ExecutionResult, ExecutionStream,
    FinishReason, TokenUsage, ToolCall,
};
use crate::brain::BrainRequest;
use crate::brain::classifier::ClassificationResult;
use crate::brain::messages::MessageAdapter;
use crate::config::BackendEndpointConfig;
use crate::error::{BrainError, BrainResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streaming executions buffer at most this many undelivered events before
/// the producing task yields.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Narrow seam to the host's tool implementations
///
/// The task-management adapter (or any other tool provider) implements this
/// to expose its tools to the agent loop. Dispatch errors are converted to
/// model-visible error payloads; they never abort the execution.
#[async_trait]
pub(crate) trait ToolDispatcher: Send + Sync {
    /// Tool specs advertised to the engine
    fn specs(&self) -> Vec<ToolSpec>;

    async fn dispatch(&self, name: &str, input: Value) -> BrainResult<Value>;
}

/// Stand-in dispatcher used when no host adapter is wired: answers `echo`
/// with its own arguments and rejects everything else.
pub(crate) struct EchoDispatcher;

#[async_trait]
impl ToolDispatcher for EchoDispatcher {
    fn specs(&self) -> Vec<ToolSpec> {
        vec![ToolSpec::function(
            "echo",
            "Echo the provided arguments back unchanged",
            json!({"type": "object", "additionalProperties": true}),
        )]
    }

    async fn dispatch(&self, name: &str, input: Value) -> BrainResult<Value> {
        match name {
            "echo" => Ok(input),
            other => Err(BrainError::Internal(format!(
                "no handler for tool: {other}"
            ))),
        }
    }
}

pub struct ToolAgentBackend {
    client: reqwest::Client,
    config: BackendEndpointConfig,
    adapter: MessageAdapter,
    dispatcher: Arc<dyn ToolDispatcher>,
    sessions: Arc<Mutex<HashMap<Uuid, Instant>>>,
}

impl ToolAgentBackend {
    pub fn new(config: BackendEndpointConfig) -> BrainResult<Self> {
        Self::with_dispatcher(config, Arc::new(EchoDispatcher))
    }

    pub(crate) fn with_dispatcher(
        config: BackendEndpointConfig,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> BrainResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BrainError::Internal(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            config,
            adapter: MessageAdapter::default(),
            dispatcher,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub(crate) fn active_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Instant>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_session(&self, handle: &ExecutionHandle) {
        self.lock_sessions().insert(handle.id(), handle.started_at());
    }

    fn assemble(&self, request: &BrainRequest, system_prompt: &str) -> Vec<WireMessage> {
        let prepared = self.adapter.prepare(request.turns());
        let turns = self.adapter.for_backend(BackendKind::Agent, &prepared);
        wire::assemble_messages(turns, system_prompt, prepared.system_fragments())
    }

    fn advertised_tools(&self) -> Option<Vec<ToolSpec>> {
        let specs = self.dispatcher.specs();
        if specs.is_empty() { None } else { Some(specs) }
    }

    fn wire_request(
        &self,
        messages: Vec<WireMessage>,
        stream: bool,
        tools: Option<Vec<ToolSpec>>,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model().to_string(),
            messages,
            max_tokens: self.config.max_tokens(),
            temperature: self.config.temperature(),
            stream,
            tools,
        }
    }
}

#[async_trait]
impl Backend for ToolAgentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Agent
    }

    async fn execute(
        &self,
        handle: &ExecutionHandle,
        request: &BrainRequest,
        _classification: &ClassificationResult,
        system_prompt: &str,
    ) -> BrainResult<ExecutionResult> {
        self.register_session(handle);

        let mut messages = self.assemble(request, system_prompt);
        let tools = self.advertised_tools();
        let max_rounds = self.config.max_tool_steps();

        let mut usage = TokenUsage::default();
        let mut content = String::new();
        let mut log: Vec<ToolCall> = Vec::new();
        let mut rounds_done = 0usize;

        loop {
            let wire_request = self.wire_request(messages.clone(), false, tools.clone());
            let response =
                wire::complete(&self.client, BackendKind::Agent, &self.config, &wire_request)
                    .await?;
            if let Some(u) = response.usage {
                usage.absorb(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
            }
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| BrainError::BackendExecution {
                    backend: BackendKind::Agent.as_str().to_string(),
                    reason: "engine returned no choices".to_string(),
                })?;

            if let Some(text) = choice.message.content.as_deref() {
                content.push_str(text);
            }

            let calls = choice.message.tool_calls.unwrap_or_default();
            if calls.is_empty() {
                return Ok(ExecutionResult {
                    content,
                    token_usage: usage,
                    finish_reason: choice
                        .finish_reason
                        .as_deref()
                        .map(FinishReason::from_wire)
                        .unwrap_or(FinishReason::Stop),
                    tool_calls: log,
                    execution_time_ms: handle.started_at().elapsed().as_millis() as u64,
                });
            }

            if rounds_done >= max_rounds {
                tracing::warn!(
                    execution_id = %handle.id(),
                    rounds = rounds_done,
                    "Tool round budget exhausted; returning partial result"
                );
                return Ok(ExecutionResult {
                    content,
                    token_usage: usage,
                    finish_reason: FinishReason::Tool,
                    tool_calls: log,
                    execution_time_ms: handle.started_at().elapsed().as_millis() as u64,
                });
            }
            rounds_done += 1;

            let assistant_content = choice.message.content.clone();
            let tool_messages = match dispatch_round(
                &self.dispatcher,
                &calls,
                &mut log,
                None,
            )
            .await
            {
                Ok(m) => m,
                // No receiver exists on the blocking path.
                Err(RoundAbort::ReceiverGone) => unreachable!("blocking path has no receiver"),
            };
            messages.push(WireMessage {
                role: "assistant".to_string(),
                content: assistant_content,
                tool_calls: Some(calls),
                tool_call_id: None,
            });
            messages.extend(tool_messages);
        }
    }

    async fn execute_streaming(
        &self,
        handle: &ExecutionHandle,
        request: &BrainRequest,
        _classification: &ClassificationResult,
        system_prompt: &str,
    ) -> BrainResult<ExecutionStream> {
        self.register_session(handle);

        let mut messages = self.assemble(request, system_prompt);
        let tools = self.advertised_tools();
        let first_request = self.wire_request(messages.clone(), true, tools.clone());

        // The first engine call happens before any stream is handed to the
        // caller, so rejection here still allows a fallback attempt.
        let first = wire::stream_chat(
            &self.client,
            BackendKind::Agent,
            &self.config,
            &first_request,
        )
        .await?;

        let (tx, rx) = mpsc::channel::<BrainResult<ExecutionEvent>>(EVENT_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let config = self.config.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let max_rounds = config.max_tool_steps();
        let started_at = handle.started_at();
        let execution_id = handle.id();

        tokio::spawn(async move {
            let mut usage = TokenUsage::default();
            let mut content = String::new();
            let mut deltas_sent = 0usize;
            let mut log: Vec<ToolCall> = Vec::new();
            let mut rounds_done = 0usize;
            let mut current = first;

            loop {
                let round = match consume_round(
                    current,
                    &tx,
                    &mut usage,
                    &mut content,
                    &mut deltas_sent,
                )
                .await
                {
                    Ok(round) => round,
                    // Caller went away; dropping tx and returning aborts
                    // the run and any in-flight engine stream.
                    Err(RoundAbort::ReceiverGone) => {
                        tracing::debug!(%execution_id, "Stream receiver dropped; aborting run");
                        return;
                    }
                };

                let round = match round {
                    ConsumedRound::Completed(outcome) => outcome,
                    ConsumedRound::EngineFailed(reason) => {
                        let _ = tx
                            .send(Err(BrainError::Streaming {
                                backend: BackendKind::Agent.as_str().to_string(),
                                deltas_sent,
                                reason,
                            }))
                            .await;
                        return;
                    }
                };

                if round.tool_calls.is_empty() {
                    let result = ExecutionResult {
                        content,
                        token_usage: usage,
                        finish_reason: round
                            .finish
                            .as_deref()
                            .map(FinishReason::from_wire)
                            .unwrap_or(FinishReason::Stop),
                        tool_calls: log,
                        execution_time_ms: started_at.elapsed().as_millis() as u64,
                    };
                    let _ = tx.send(Ok(ExecutionEvent::Completed(result))).await;
                    return;
                }

                if rounds_done >= max_rounds {
                    tracing::warn!(
                        %execution_id,
                        rounds = rounds_done,
                        "Tool round budget exhausted mid-stream"
                    );
                    let result = ExecutionResult {
                        content,
                        token_usage: usage,
                        finish_reason: FinishReason::Tool,
                        tool_calls: log,
                        execution_time_ms: started_at.elapsed().as_millis() as u64,
                    };
                    let _ = tx.send(Ok(ExecutionEvent::Completed(result))).await;
                    return;
                }
                rounds_done += 1;

                let tool_messages = match dispatch_round(
                    &dispatcher,
                    &round.tool_calls,
                    &mut log,
                    Some(&tx),
                )
                .await
                {
                    Ok(m) => m,
                    Err(RoundAbort::ReceiverGone) => return,
                };
                messages.push(WireMessage {
                    role: "assistant".to_string(),
                    content: if round.content.is_empty() {
                        None
                    } else {
                        Some(round.content)
                    },
                    tool_calls: Some(round.tool_calls),
                    tool_call_id: None,
                });
                messages.extend(tool_messages);

                let next_request = ChatCompletionRequest {
                    model: config.model().to_string(),
                    messages: messages.clone(),
                    max_tokens: config.max_tokens(),
                    temperature: config.temperature(),
                    stream: true,
                    tools: tools.clone(),
                };
                current = match wire::stream_chat(
                    &client,
                    BackendKind::Agent,
                    &config,
                    &next_request,
                )
                .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = tx
                            .send(Err(BrainError::Streaming {
                                backend: BackendKind::Agent.as_str().to_string(),
                                deltas_sent,
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
            }
        });

        Ok(receiver_stream(rx))
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> BrainResult<()> {
        let removed = self.lock_sessions().remove(&handle.id()).is_some();
        tracing::trace!(execution_id = %handle.id(), removed, "Agent session cleanup");
        Ok(())
    }
}

fn receiver_stream(rx: mpsc::Receiver<BrainResult<ExecutionEvent>>) -> ExecutionStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Reassembles tool calls from index-keyed stream fragments
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    pending: BTreeMap<usize, PendingToolCall>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn fold(&mut self, fragment: ChunkToolCall) {
        let entry = self.pending.entry(fragment.index).or_default();
        if let Some(id) = fragment.id {
            entry.id = Some(id);
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                entry.name = name;
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn finish(self) -> Vec<WireToolCall> {
        self.pending
            .into_iter()
            .map(|(index, call)| WireToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                kind: Some("function".to_string()),
                function: WireFunctionCall {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect()
    }
}

struct RoundOutcome {
    content: String,
    tool_calls: Vec<WireToolCall>,
    finish: Option<String>,
}

enum ConsumedRound {
    Completed(RoundOutcome),
    EngineFailed(String),
}

enum RoundAbort {
    ReceiverGone,
}

/// Drain one engine stream: forward content deltas in arrival order and
/// fold tool-call fragments. Engine failure ends the round (and the run);
/// a dropped receiver aborts outright.
async fn consume_round(
    mut chunks: BoxStream<'static, BrainResult<ChatCompletionChunk>>,
    tx: &mpsc::Sender<BrainResult<ExecutionEvent>>,
    usage: &mut TokenUsage,
    content_total: &mut String,
    deltas_sent: &mut usize,
) -> Result<ConsumedRound, RoundAbort> {
    let mut accumulator = ToolCallAccumulator::default();
    let mut round_content = String::new();
    let mut finish = None;

    while let Some(item) = chunks.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => return Ok(ConsumedRound::EngineFailed(e.to_string())),
        };
        if let Some(u) = chunk.usage {
            usage.absorb(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            continue;
        };
        if let Some(reason) = choice.finish_reason {
            finish = Some(reason);
        }
        if let Some(fragments) = choice.delta.tool_calls {
            for fragment in fragments {
                accumulator.fold(fragment);
            }
        }
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                round_content.push_str(&text);
                content_total.push_str(&text);
                *deltas_sent += 1;
                if tx.send(Ok(ExecutionEvent::Delta(text))).await.is_err() {
                    return Err(RoundAbort::ReceiverGone);
                }
            }
        }
    }

    let tool_calls = if accumulator.is_empty() {
        Vec::new()
    } else {
        accumulator.finish()
    };
    Ok(ConsumedRound::Completed(RoundOutcome {
        content: round_content,
        tool_calls,
        finish,
    }))
}

/// Dispatch every call in a round, emitting lifecycle events when a sender
/// is present. Dispatcher errors become model-visible error payloads.
async fn dispatch_round(
    dispatcher: &Arc<dyn ToolDispatcher>,
    calls: &[WireToolCall],
    log: &mut Vec<ToolCall>,
    events: Option<&mpsc::Sender<BrainResult<ExecutionEvent>>>,
) -> Result<Vec<WireMessage>, RoundAbort> {
    let mut tool_messages = Vec::with_capacity(calls.len());

    for call in calls {
        let name = call.function.name.clone();
        if let Some(tx) = events {
            if tx
                .send(Ok(ExecutionEvent::ToolStarted { name: name.clone() }))
                .await
                .is_err()
            {
                return Err(RoundAbort::ReceiverGone);
            }
        }

        let input = wire::parse_arguments(&call.function.arguments);
        let output = match dispatcher.dispatch(&name, input.clone()).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "Tool dispatch failed");
                json!({"error": e.to_string()})
            }
        };

        tool_messages.push(WireMessage::tool_result(call.id.clone(), output.to_string()));
        log.push(ToolCall {
            name: name.clone(),
            input,
            output: Some(output),
        });

        if let Some(tx) = events {
            if tx
                .send(Ok(ExecutionEvent::ToolCompleted { name }))
                .await
                .is_err()
            {
                return Err(RoundAbort::ReceiverGone);
            }
        }
    }
    Ok(tool_messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::wire::{ChunkChoice, ChunkDelta, ChunkFunctionFragment};

    fn agent() -> ToolAgentBackend {
        ToolAgentBackend::new(BackendEndpointConfig::for_tests(
            "http://localhost:8080/v1",
            "agent-30b",
        ))
        .unwrap()
    }

    fn fragment_chunk(fragments: Vec<ChunkToolCall>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: None,
                    tool_calls: Some(fragments),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn content_chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn call_fragment(
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> ChunkToolCall {
        ChunkToolCall {
            index,
            id: id.map(str::to_string),
            function: Some(ChunkFunctionFragment {
                name: name.map(str::to_string),
                arguments: arguments.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_accumulator_reassembles_split_arguments() {
        let mut accumulator = ToolCallAccumulator::default();
        accumulator.fold(call_fragment(0, Some("call_1"), Some("create_task"), Some("{\"ti")));
        accumulator.fold(call_fragment(0, None, None, Some("tle\":\"Ship v2\"}")));
        accumulator.fold(call_fragment(1, Some("call_2"), Some("assign"), Some("{}")));

        let calls = accumulator.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "create_task");
        assert_eq!(calls[0].function.arguments, "{\"title\":\"Ship v2\"}");
        assert_eq!(calls[1].function.name, "assign");
    }

    #[test]
    fn test_accumulator_generates_id_when_engine_omits_it() {
        let mut accumulator = ToolCallAccumulator::default();
        accumulator.fold(call_fragment(3, None, Some("echo"), Some("{}")));
        let calls = accumulator.finish();
        assert_eq!(calls[0].id, "call_3");
    }

    #[tokio::test]
    async fn test_echo_dispatcher_round_trip() {
        let dispatcher = EchoDispatcher;
        let input = json!({"text": "hello"});
        let output = dispatcher.dispatch("echo", input.clone()).await.unwrap();
        assert_eq!(output, input);

        let err = dispatcher.dispatch("create_task", json!({})).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_session_cleanup_is_idempotent() {
        let backend = agent();
        let handle = backend.new_handle();
        backend.register_session(&handle);
        assert_eq!(backend.active_sessions(), 1);

        backend.cleanup(&handle).await.unwrap();
        assert_eq!(backend.active_sessions(), 0);
        backend.cleanup(&handle).await.unwrap();
        assert_eq!(backend.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_consume_round_forwards_deltas_and_assembles_calls() {
        let chunks = futures::stream::iter(vec![
            Ok(content_chunk("Looking that up")),
            Ok(fragment_chunk(vec![call_fragment(
                0,
                Some("call_1"),
                Some("echo"),
                Some("{\"q\":"),
            )])),
            Ok(fragment_chunk(vec![call_fragment(0, None, None, Some("1}"))])),
        ])
        .boxed();

        let (tx, mut rx) = mpsc::channel(8);
        let mut usage = TokenUsage::default();
        let mut content = String::new();
        let mut deltas = 0usize;

        let round = consume_round(chunks, &tx, &mut usage, &mut content, &mut deltas)
            .await
            .ok()
            .unwrap();
        let ConsumedRound::Completed(outcome) = round else {
            panic!("expected completed round");
        };

        assert_eq!(outcome.content, "Looking that up");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].function.arguments, "{\"q\":1}");
        assert_eq!(deltas, 1);
        assert_eq!(content, "Looking that up");

        let forwarded = rx.recv().await.unwrap().unwrap();
        assert!(matches!(forwarded, ExecutionEvent::Delta(d) if d == "Looking that up"));
    }

    #[tokio::test]
    async fn test_consume_round_reports_engine_failure() {
        let chunks = futures::stream::iter(vec![
            Ok(content_chunk("par")),
            Err(BrainError::BackendExecution {
                backend: "agent".to_string(),
                reason: "reset".to_string(),
            }),
        ])
        .boxed();

        let (tx, mut rx) = mpsc::channel(8);
        let mut usage = TokenUsage::default();
        let mut content = String::new();
        let mut deltas = 0usize;

        let round = consume_round(chunks, &tx, &mut usage, &mut content, &mut deltas)
            .await
            .ok()
            .unwrap();
        assert!(matches!(round, ConsumedRound::EngineFailed(reason) if reason.contains("reset")));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_consume_round_aborts_when_receiver_dropped() {
        let chunks = futures::stream::iter(vec![Ok(content_chunk("unwanted"))]).boxed();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let mut usage = TokenUsage::default();
        let mut content = String::new();
        let mut deltas = 0usize;

        let result = consume_round(chunks, &tx, &mut usage, &mut content, &mut deltas).await;
        assert!(matches!(result, Err(RoundAbort::ReceiverGone)));
    }

    #[tokio::test]
    async fn test_dispatch_round_emits_lifecycle_events_and_error_payloads() {
        let dispatcher: Arc<dyn ToolDispatcher> = Arc::new(EchoDispatcher);
        let calls = vec![
            WireToolCall {
                id: "call_1".to_string(),
                kind: Some("function".to_string()),
                function: WireFunctionCall {
                    name: "echo".to_string(),
                    arguments: "{\"ok\":true}".to_string(),
                },
            },
            WireToolCall {
                id: "call_2".to_string(),
                kind: Some("function".to_string()),
                function: WireFunctionCall {
                    name: "missing_tool".to_string(),
                    arguments: "{}".to_string(),
                },
            },
        ];

        let (tx, mut rx) = mpsc::channel(8);
        let mut log = Vec::new();
        let messages = dispatch_round(&dispatcher, &calls, &mut log, Some(&tx))
            .await
            .ok()
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "tool");
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert!(messages[1].content.as_deref().unwrap().contains("error"));

        assert_eq!(log.len(), 2);
        assert_eq!(log[0].name, "echo");
        assert!(log[1].output.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("missing_tool"));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.unwrap());
        }
        assert!(matches!(&events[0], ExecutionEvent::ToolStarted { name } if name == "echo"));
        assert!(matches!(&events[1], ExecutionEvent::ToolCompleted { name } if name == "echo"));
        assert!(
            matches!(&events[2], ExecutionEvent::ToolStarted { name } if name == "missing_tool")
        );
    }
}
