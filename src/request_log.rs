//! Per-request structured observability.
//!
//! Every request carries a [`RequestLogger`] through the pipeline. Pipeline
//! phases and backend attempts are recorded as they happen, each emitting a
//! structured event, and [`RequestLogger::finalize`] folds them into a single
//! [`RequestSummary`] that is logged once and embedded in response metadata.

use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::backends::{BackendKind, TokenUsage};

/// How a single backend attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

/// A named point in the request lifecycle, offset from request arrival.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMark {
    phase: &'static str,
    at_ms: u64,
}

impl PhaseMark {
    pub fn phase(&self) -> &'static str {
        self.phase
    }

    pub fn at_ms(&self) -> u64 {
        self.at_ms
    }
}

/// One backend execution attempt, in the order attempts were made.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    backend: BackendKind,
    outcome: AttemptOutcome,
    duration_ms: u64,
}

impl AttemptRecord {
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

/// Classifier metadata captured for the summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationMark {
    duration_ms: u64,
    route_to_agent: bool,
    confidence: f64,
}

/// Accumulates lifecycle events for one request.
///
/// The logger is deliberately infallible: recording never returns an error
/// and never blocks the request path. Construction pins the start instant,
/// so phase offsets are relative to request arrival.
#[derive(Debug)]
pub struct RequestLogger {
    correlation_id: Uuid,
    started_at: Instant,
    phases: Vec<PhaseMark>,
    attempts: Vec<AttemptRecord>,
    classification: Option<ClassificationMark>,
    usage: TokenUsage,
}

impl RequestLogger {
    pub fn new(correlation_id: Uuid) -> Self {
        let mut logger = Self {
            correlation_id,
            started_at: Instant::now(),
            phases: Vec::new(),
            attempts: Vec::new(),
            classification: None,
            usage: TokenUsage::default(),
        };
        logger.record_phase("received");
        logger
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Mark entry into a lifecycle phase.
    pub fn record_phase(&mut self, phase: &'static str) {
        let at_ms = self.elapsed_ms();
        tracing::debug!(
            correlation_id = %self.correlation_id,
            phase,
            at_ms,
            "request phase"
        );
        self.phases.push(PhaseMark { phase, at_ms });
    }

    /// Record the classifier's decision and how long it took.
    pub fn record_classification(
        &mut self,
        duration_ms: u64,
        route_to_agent: bool,
        confidence: f64,
    ) {
        tracing::debug!(
            correlation_id = %self.correlation_id,
            duration_ms,
            route_to_agent,
            confidence,
            "classification recorded"
        );
        self.classification = Some(ClassificationMark {
            duration_ms,
            route_to_agent,
            confidence,
        });
    }

    /// Record one backend execution attempt.
    ///
    /// Failed attempts log at warn so a fallback leaves a visible trace even
    /// when the request ultimately succeeds.
    pub fn record_attempt(
        &mut self,
        backend: BackendKind,
        outcome: AttemptOutcome,
        duration_ms: u64,
    ) {
        match outcome {
            AttemptOutcome::Success => {
                tracing::debug!(
                    correlation_id = %self.correlation_id,
                    backend = backend.as_str(),
                    duration_ms,
                    "backend attempt succeeded"
                );
            }
            _ => {
                tracing::warn!(
                    correlation_id = %self.correlation_id,
                    backend = backend.as_str(),
                    outcome = outcome.as_str(),
                    duration_ms,
                    "backend attempt did not succeed"
                );
            }
        }
        self.attempts.push(AttemptRecord {
            backend,
            outcome,
            duration_ms,
        });
    }

    /// Fold an engine's token accounting into the running totals.
    pub fn absorb_usage(&mut self, usage: &TokenUsage) {
        self.usage.absorb(*usage);
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// True once a second backend has been attempted.
    pub fn fallback_used(&self) -> bool {
        self.attempts.len() > 1
    }

    /// Close out the request and emit the one-line summary event.
    pub fn finalize(mut self, outcome: &'static str) -> RequestSummary {
        self.record_phase("finished");
        let total_duration_ms = self.elapsed_ms();
        let fallback_used = self.fallback_used();
        let summary = RequestSummary {
            correlation_id: self.correlation_id,
            outcome,
            total_duration_ms,
            fallback_used,
            phases: self.phases,
            attempts: self.attempts,
            classification: self.classification,
            token_usage: self.usage,
        };
        tracing::info!(
            correlation_id = %summary.correlation_id,
            outcome,
            total_duration_ms,
            fallback_used,
            attempts = summary.attempts.len(),
            total_tokens = summary.token_usage.total_tokens,
            "request finished"
        );
        summary
    }
}

/// Immutable record of a finished request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    correlation_id: Uuid,
    outcome: &'static str,
    total_duration_ms: u64,
    fallback_used: bool,
    phases: Vec<PhaseMark>,
    attempts: Vec<AttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification: Option<ClassificationMark>,
    token_usage: TokenUsage,
}

impl RequestSummary {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn outcome(&self) -> &'static str {
        self.outcome
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn phases(&self) -> &[PhaseMark] {
        &self.phases
    }

    pub fn token_usage(&self) -> &TokenUsage {
        &self.token_usage
    }
}
