//! POST /api/brain/stream: SSE orchestration endpoint
//!
//! Deltas are flushed in engine arrival order as `delta` events; tool
//! activity surfaces as `tool` events. The stream ends with exactly one
//! terminal event (`summary` on success, `error` on a mid-stream failure)
//! followed by the `[DONE]` sentinel:
//!
//! ```text
//! event: delta
//! data: {"content":"..."}
//!
//! event: summary
//! data: {"success":true,...}
//!
//! data: [DONE]
//!
//! ```
//!
//! Fallback only happens while the stream is being established; once deltas
//! are flowing a failure is terminal and is reported in-band, since the
//! caller may already have rendered partial output.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, header::HeaderValue},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;

use crate::backends::{BackendKind, ExecutionEvent, ExecutionResult, ExecutionStream};
use crate::brain::BrainRequest;
use crate::error::BrainError;
use crate::handlers::AppState;
use crate::handlers::brain::{CLASSIFICATION_SCORE_HEADER, EXECUTION_PATH_HEADER};
use crate::middleware::correlation_id::CorrelationId;
use crate::request_log::RequestLogger;

/// Handler for `POST /api/brain/stream`
///
/// Routing failures before any delta was flushed (validation, dual backend
/// failure) are returned as plain JSON error responses; the SSE contract
/// only starts once a backend has accepted the request.
pub async fn handler(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<Response, BrainError> {
    let request: BrainRequest =
        serde_json::from_value(payload).map_err(|e| BrainError::Validation(e.to_string()))?;

    let identity = super::request_identity(&headers);
    let mut logger = RequestLogger::new(correlation_id.as_uuid());

    match state
        .orchestrator()
        .handle_streaming(&request, &identity, &mut logger)
        .await
    {
        Ok(outcome) => {
            let execution_path = outcome.backend.wire_name();
            let score_header = outcome.classification.as_ref().and_then(|c| {
                HeaderValue::from_str(&format!("{:.3}", c.complexity_score())).ok()
            });

            let events =
                event_stream(outcome.stream, outcome.backend, outcome.fallback_used, logger);
            let mut response = Sse::new(events)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(15))
                        .text(":\n\n"),
                )
                .into_response();

            let response_headers = response.headers_mut();
            response_headers.insert(
                EXECUTION_PATH_HEADER,
                HeaderValue::from_static(execution_path),
            );
            if let Some(score) = score_header {
                response_headers.insert(CLASSIFICATION_SCORE_HEADER, score);
            }
            Ok(response)
        }
        Err(error) => {
            logger.finalize(error.error_type());
            Err(error)
        }
    }
}

/// Map execution events onto the wire protocol.
///
/// The logger travels into the stream and is finalized by whichever terminal
/// event arrives first; later items (there should be none) produce a `null`
/// summary rather than a panic.
fn event_stream(
    execution: ExecutionStream,
    backend: BackendKind,
    fallback_used: bool,
    logger: RequestLogger,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let mut logger = Some(logger);
    execution.flat_map(move |item| {
        let events: Vec<Result<Event, Infallible>> = match item {
            Ok(ExecutionEvent::Delta(content)) => vec![Ok(Event::default()
                .event("delta")
                .data(json!({ "content": content }).to_string()))],
            Ok(ExecutionEvent::ToolStarted { name }) => vec![Ok(tool_event(&name, "started"))],
            Ok(ExecutionEvent::ToolCompleted { name }) => {
                vec![Ok(tool_event(&name, "completed"))]
            }
            Ok(ExecutionEvent::Completed(result)) => {
                summary_events(&mut logger, backend, fallback_used, result)
            }
            Err(error) => error_events(&mut logger, error),
        };
        stream::iter(events)
    })
}

fn tool_event(name: &str, status: &str) -> Event {
    Event::default()
        .event("tool")
        .data(json!({ "name": name, "status": status }).to_string())
}

fn summary_events(
    logger: &mut Option<RequestLogger>,
    backend: BackendKind,
    fallback_used: bool,
    result: ExecutionResult,
) -> Vec<Result<Event, Infallible>> {
    let summary = logger.take().map(|l| l.finalize("success"));
    let payload = json!({
        "success": true,
        "executionPath": backend.wire_name(),
        "fallbackUsed": fallback_used,
        "result": result,
        "summary": summary,
    });
    vec![
        Ok(Event::default().event("summary").data(payload.to_string())),
        Ok(Event::default().data("[DONE]")),
    ]
}

fn error_events(
    logger: &mut Option<RequestLogger>,
    error: BrainError,
) -> Vec<Result<Event, Infallible>> {
    if let Some(l) = logger.take() {
        l.finalize(error.error_type());
    }
    let payload = json!({
        "success": false,
        "error": {
            "type": error.error_type(),
            "message": error.to_string(),
        },
    });
    vec![
        Ok(Event::default().event("error").data(payload.to_string())),
        Ok(Event::default().data("[DONE]")),
    ]
}
