//! Error types for Duoroute
//!
//! The taxonomy distinguishes errors by how far a request got and whether a
//! retry makes sense for the caller. Every error carries a stable `type`
//! discriminator in its JSON body, and terminal failures set the
//! `X-Brain-Error` response header so proxies can spot them without parsing.

use axum::{
    Json,
    http::{StatusCode, header::HeaderValue},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Name of the response header set on terminal failures.
pub const BRAIN_ERROR_HEADER: &str = "x-brain-error";

/// Main error type for the application
#[derive(Error, Debug)]
pub enum BrainError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file '{path}': {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config file '{path}' failed validation: {reason}")]
    ConfigValidation { path: String, reason: String },

    /// Rejected before orchestration started. Never retried.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Classifier-internal failure. Absorbed with a conservative default
    /// before it can reach a handler; surfaced only if that contract breaks.
    #[error("Classification failed: {0}")]
    Classification(String),

    /// A single backend attempt failed. Triggers the one-shot fallback.
    #[error("Backend {backend} execution failed: {reason}")]
    BackendExecution { backend: String, reason: String },

    /// Backend attempt exceeded its deadline. Handled identically to
    /// [`BrainError::BackendExecution`].
    #[error("Backend {backend} timed out after {timeout_seconds} seconds")]
    BackendTimeout {
        backend: String,
        timeout_seconds: u64,
    },

    /// Both the primary and the fallback attempt failed. Terminal.
    #[error("Both backends failed: {primary} ({primary_reason}); fallback {fallback} ({fallback_reason})")]
    DualBackendFailure {
        primary: String,
        primary_reason: String,
        fallback: String,
        fallback_reason: String,
    },

    /// The backend stream broke after deltas were already flushed. Terminal,
    /// never restarted.
    #[error("Stream from {backend} failed after {deltas_sent} deltas: {reason}")]
    Streaming {
        backend: String,
        deltas_sent: usize,
        reason: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrainError {
    /// Stable discriminator for the wire. Callers branch on this to decide
    /// whether a retry is worthwhile, so values never change meaning.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigValidation { .. } => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::Classification(_) => "classification_error",
            Self::BackendExecution { .. } => "backend_execution_error",
            Self::BackendTimeout { .. } => "backend_timeout_error",
            Self::DualBackendFailure { .. } => "dual_backend_failure",
            Self::Streaming { .. } => "streaming_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may reasonably retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendExecution { .. }
                | Self::BackendTimeout { .. }
                | Self::DualBackendFailure { .. }
                | Self::Streaming { .. }
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigValidation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Classification(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendExecution { .. } => StatusCode::BAD_GATEWAY,
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::DualBackendFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Streaming { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BrainError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = self.error_type();

        let body = Json(serde_json::json!({
            "success": false,
            "error": {
                "type": error_type,
                "message": self.to_string(),
            },
        }));

        let mut response = (status, body).into_response();
        if let Ok(value) = HeaderValue::from_str(error_type) {
            response.headers_mut().insert(BRAIN_ERROR_HEADER, value);
        }
        response
    }
}

/// Convenience type alias for Results
pub type BrainResult<T> = Result<T, BrainError>;
