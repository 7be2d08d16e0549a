//! POST /api/brain: blocking orchestration endpoint
//!
//! Runs the full pipeline (classify, route, execute, fall back at most once)
//! and answers with a single JSON envelope. Routing facts also ride on
//! response headers so proxies can observe the path without parsing bodies.

use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, StatusCode, header::HeaderValue},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use uuid::Uuid;

use crate::backends::{FinishReason, TokenUsage, ToolCall};
use crate::brain::BrainRequest;
use crate::brain::classifier::ClassificationResult;
use crate::brain::orchestrator::BrainOutcome;
use crate::error::BrainError;
use crate::handlers::AppState;
use crate::middleware::correlation_id::CorrelationId;
use crate::request_log::{RequestLogger, RequestSummary};

/// Response header naming the backend that produced the reply
pub const EXECUTION_PATH_HEADER: &str = "x-execution-path";

/// Response header carrying the classifier's complexity score. Absent when
/// the classifier never ran.
pub const CLASSIFICATION_SCORE_HEADER: &str = "x-classification-score";

/// Success envelope returned to non-streaming callers
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrainResponse {
    pub success: bool,
    pub content: String,
    pub execution_path: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationResult>,
    pub performance: PerformanceReport,
    pub token_usage: TokenUsage,
    pub metadata: ResponseMetadata,
}

/// Latency and fallback facts for caller-side dashboards
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub total_duration_ms: u64,
    pub execution_time_ms: u64,
    pub fallback_used: bool,
}

/// Request-scoped metadata, including the full lifecycle summary
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub correlation_id: Uuid,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub summary: RequestSummary,
}

/// Handler for `POST /api/brain`
///
/// The request body is deserialized explicitly so shape and validation
/// failures surface as the structured `validation_error` envelope instead of
/// the framework's plain-text rejection.
///
/// # Errors
///
/// - `400` when the body is not a valid `BrainRequest`
/// - `502` / `504` when backend execution fails terminally
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
        .handle(&request, &identity, &mut logger)
        .await
    {
        Ok(outcome) => {
            let summary = logger.finalize("success");
            Ok(assemble_response(outcome, summary))
        }
        Err(error) => {
            logger.finalize(error.error_type());
            Err(error)
        }
    }
}

fn assemble_response(outcome: BrainOutcome, summary: RequestSummary) -> Response {
    let execution_path = outcome.backend.wire_name();
    let score_header = outcome
        .classification
        .as_ref()
        .and_then(|c| HeaderValue::from_str(&format!("{:.3}", c.complexity_score())).ok());

    let body = BrainResponse {
        success: true,
        content: outcome.result.content,
        execution_path,
        classification: outcome.classification,
        performance: PerformanceReport {
            total_duration_ms: summary.total_duration_ms(),
            execution_time_ms: outcome.result.execution_time_ms,
            fallback_used: summary.fallback_used(),
        },
        token_usage: outcome.result.token_usage,
        metadata: ResponseMetadata {
            correlation_id: summary.correlation_id(),
            finish_reason: outcome.result.finish_reason,
            tool_calls: outcome.result.tool_calls,
            summary,
        },
    };

    let mut response = (StatusCode::OK, Json(body)).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        EXECUTION_PATH_HEADER,
        HeaderValue::from_static(execution_path),
    );
    if let Some(score) = score_header {
        response_headers.insert(CLASSIFICATION_SCORE_HEADER, score);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::backends::ExecutionResult;
    use std::collections::BTreeSet;

    fn execution_result() -> ExecutionResult {
        ExecutionResult {
            content: "Lisbon will be sunny, around 24C.".to_string(),
            token_usage: TokenUsage::new(40, 18),
            finish_reason: FinishReason::Stop,
            tool_calls: Vec::new(),
            execution_time_ms: 120,
        }
    }

    fn classification() -> ClassificationResult {
        ClassificationResult::new(
            false,
            0.85,
            "simple conversational query".to_string(),
            0.12345,
            BTreeSet::from(["simple-conversational".to_string()]),
            "direct-8b".to_string(),
        )
    }

    #[tokio::test]
    async fn test_envelope_wire_shape() {
        let outcome = BrainOutcome {
            result: execution_result(),
            backend: BackendKind::Direct,
            classification: Some(classification()),
            fallback_used: false,
        };
        let summary = RequestLogger::new(Uuid::new_v4()).finalize("success");

        let response = assemble_response(outcome, summary);
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["executionPath"], "direct-backend");
        assert_eq!(json["content"], "Lisbon will be sunny, around 24C.");
        assert_eq!(json["classification"]["routeToAgentBackend"], false);
        assert_eq!(json["performance"]["executionTimeMs"], 120);
        assert_eq!(json["performance"]["fallbackUsed"], false);
        assert_eq!(json["tokenUsage"]["total"], 58);
        assert_eq!(json["metadata"]["finishReason"], "stop");
        assert_eq!(json["metadata"]["summary"]["outcome"], "success");
        // No tool calls ran, so the key is omitted entirely.
        assert!(json["metadata"].get("toolCalls").is_none());
    }

    #[tokio::test]
    async fn test_routing_headers_set() {
        let outcome = BrainOutcome {
            result: execution_result(),
            backend: BackendKind::Direct,
            classification: Some(classification()),
            fallback_used: false,
        };
        let summary = RequestLogger::new(Uuid::new_v4()).finalize("success");

        let response = assemble_response(outcome, summary);
        assert_eq!(
            response
                .headers()
                .get(EXECUTION_PATH_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("direct-backend")
        );
        assert_eq!(
            response
                .headers()
                .get(CLASSIFICATION_SCORE_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("0.123")
        );
    }

    #[tokio::test]
    async fn test_score_header_absent_without_classification() {
        let outcome = BrainOutcome {
            result: execution_result(),
            backend: BackendKind::Agent,
            classification: None,
            fallback_used: false,
        };
        let summary = RequestLogger::new(Uuid::new_v4()).finalize("success");

        let response = assemble_response(outcome, summary);
        assert_eq!(
            response
                .headers()
                .get(EXECUTION_PATH_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("agent-backend")
        );
        assert!(response.headers().get(CLASSIFICATION_SCORE_HEADER).is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.get("classification").is_none());
    }
}
