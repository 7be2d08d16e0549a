//! Backend adapter contract
//!
//! Two execution engines sit behind the orchestrator: the tool-agent runtime
//! (multi-step tool invocation) and the direct-model runtime (single streamed
//! generation with a small fixed toolset). Both implement [`Backend`] and
//! normalize their engine payloads into [`ExecutionResult`] at the adapter
//! boundary; engine-specific shapes never leak upward.

pub mod agent;
pub mod direct;
pub(crate) mod wire;

use crate::brain::BrainRequest;
use crate::brain::classifier::ClassificationResult;
use crate::error::BrainResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// Which execution engine handled (or should handle) a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Agent,
    Direct,
}

impl BackendKind {
    /// Short label used in config, logs, and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Direct => "direct",
        }
    }

    /// Value carried by the `X-Execution-Path` header and the
    /// `executionPath` envelope field
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Agent => "agent-backend",
            Self::Direct => "direct-backend",
        }
    }

    /// The alternate backend, used for the single fallback attempt
    pub fn other(&self) -> Self {
        match self {
            Self::Agent => Self::Direct,
            Self::Direct => Self::Agent,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting reported by an engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "prompt")]
    pub prompt_tokens: u64,
    #[serde(rename = "completion")]
    pub completion_tokens: u64,
    #[serde(rename = "total")]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Fold another usage report into this one. Agent executions accumulate
    /// one report per tool-loop step.
    pub fn absorb(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Why the engine stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Tool,
    Error,
}

impl FinishReason {
    /// Map an engine's `finish_reason` string. Unknown values map to
    /// `Error` so a misbehaving engine is visible in the summary.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "function_call" | "tool_use" => Self::Tool,
            _ => Self::Error,
        }
    }
}

/// One tool invocation, in execution order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: serde_json::Value,
    /// None until the dispatcher produced a result (a run can finish with
    /// the call still pending).
    pub output: Option<serde_json::Value>,
}

/// Backend-agnostic execution envelope
///
/// Both adapters produce exactly this shape; for streaming executions it is
/// the payload of the terminal [`ExecutionEvent::Completed`] event, with
/// `content` holding the fully assembled text.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub content: String,
    #[serde(rename = "tokenUsage")]
    pub token_usage: TokenUsage,
    #[serde(rename = "finishReason")]
    pub finish_reason: FinishReason,
    #[serde(rename = "toolCalls")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(rename = "executionTimeMs")]
    pub execution_time_ms: u64,
}

/// Typed event emitted by the streaming execution variant
///
/// Deltas preserve engine arrival order. The terminal `Completed` event is
/// emitted exactly once, after the engine signaled completion; its summary
/// fields are not valid before that point.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Delta(String),
    ToolStarted { name: String },
    ToolCompleted { name: String },
    Completed(ExecutionResult),
}

/// Stream of execution events; `Err` items are terminal
pub type ExecutionStream = BoxStream<'static, BrainResult<ExecutionEvent>>;

/// Handle identifying one execution for registration and teardown
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: Uuid,
    backend: BackendKind,
    started_at: Instant,
}

impl ExecutionHandle {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Uniform execution contract over both engines
///
/// `cleanup` must be safe to call at any point after `new_handle`, including
/// after an aborted or never-started execution, and must be idempotent.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the handle under which this execution's engine-side state is
    /// tracked. Callers pass it back to `cleanup` when the request ends.
    fn new_handle(&self) -> ExecutionHandle {
        ExecutionHandle::new(self.kind())
    }

    /// Execute to completion and return the normalized envelope.
    async fn execute(
        &self,
        handle: &ExecutionHandle,
        request: &BrainRequest,
        classification: &ClassificationResult,
        system_prompt: &str,
    ) -> BrainResult<ExecutionResult>;

    /// Execute with incremental delivery. A returned stream means the engine
    /// accepted the request; errors inside the stream are terminal and are
    /// not retried by the orchestrator.
    async fn execute_streaming(
        &self,
        handle: &ExecutionHandle,
        request: &BrainRequest,
        classification: &ClassificationResult,
        system_prompt: &str,
    ) -> BrainResult<ExecutionStream>;

    /// Release engine-side session state for `handle`. Errors are reported
    /// but callers log and swallow them; a failed cleanup never fails the
    /// user-facing request.
    async fn cleanup(&self, handle: &ExecutionHandle) -> BrainResult<()>;
}
