//! Prometheus metrics collection for Duoroute
//!
//! This module provides metrics instrumentation for tracking:
//! - Backend execution attempts by backend and outcome
//! - Fallback activations between backends
//! - Classifier decisions and scoring latency
//! - Prompt cache effectiveness and degradations
//!
//! Metrics are exposed via the `/metrics` endpoint in Prometheus text format.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::backends::BackendKind;
use crate::request_log::AttemptOutcome;

/// Prompt cache event enum for type-safe metrics labels
///
/// Prevents cardinality explosion by restricting event values to
/// exactly three valid options at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// Prompt served from cache
    Hit,
    /// Prompt loaded from the source on a cache miss
    Miss,
    /// Prompt load failed and the built-in minimal prompt was used
    Fallback,
}

impl CacheEvent {
    /// Convert event to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEvent::Hit => "hit",
            CacheEvent::Miss => "miss",
            CacheEvent::Fallback => "fallback",
        }
    }
}

/// Metrics collector for Duoroute
///
/// Provides Prometheus metrics for monitoring backend execution,
/// fallback behavior, classification, and cache health.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    attempts_total: IntCounterVec,
    fallbacks_total: IntCounterVec,
    classifier_decisions: IntCounterVec,
    classification_duration: Histogram,
    execution_duration: HistogramVec,
    prompt_cache_events: IntCounterVec,
    sample_record_failures: IntCounter,
    stream_failures: IntCounterVec,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// Registers all metrics with a new Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Counter: Backend execution attempts by backend and outcome
        //
        // Every attempt is counted, including the fallback attempt after a
        // primary failure, so a request that fell back contributes two
        // increments with different backend labels.
        //
        // Cardinality: 2 backends x 4 outcomes = 8 time series
        let attempts_total = IntCounterVec::new(
            Opts::new(
                "duoroute_backend_attempts_total",
                "Total backend execution attempts by backend and outcome",
            ),
            &["backend", "outcome"],
        )?;

        // Counter: Fallback activations by direction
        //
        // Labels:
        // - from: the backend whose attempt failed
        // - to: the backend the request was retried on
        //
        // Cardinality: 2 directions = 2 time series
        let fallbacks_total = IntCounterVec::new(
            Opts::new(
                "duoroute_fallbacks_total",
                "Total fallback activations by direction (from failed backend to alternate)",
            ),
            &["from", "to"],
        )?;

        // Counter: Classifier routing decisions
        //
        // Cardinality: 2 routes = 2 time series
        let classifier_decisions = IntCounterVec::new(
            Opts::new(
                "duoroute_classifier_decisions_total",
                "Total classifier routing decisions by chosen backend",
            ),
            &["route"],
        )?;

        // Histogram: Classifier scoring latency
        //
        // Classification is in-process pattern matching, so the buckets sit
        // well below the execution histogram's.
        let classification_duration = Histogram::with_opts(
            HistogramOpts::new(
                "duoroute_classification_duration_ms",
                "Classifier scoring latency in milliseconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        // Histogram: Backend execution latency by backend
        //
        // Buckets span sub-second direct completions through multi-round
        // agent executions near the configured timeout ceiling.
        let execution_duration = HistogramVec::new(
            HistogramOpts::new(
                "duoroute_execution_duration_ms",
                "Backend execution latency in milliseconds",
            )
            .buckets(vec![
                25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
            ]),
            &["backend"],
        )?;

        // Counter: Prompt cache events
        //
        // A fallback increment means prompt loading failed and the request
        // proceeded on the built-in minimal prompt. Alert when
        // rate(duoroute_prompt_cache_events_total{event="fallback"}[5m]) > 0
        // for a sustained period.
        //
        // Cardinality: 3 events = 3 time series
        let prompt_cache_events = IntCounterVec::new(
            Opts::new(
                "duoroute_prompt_cache_events_total",
                "Total prompt cache events (hit, miss, fallback to minimal prompt)",
            ),
            &["event"],
        )?;

        // Counter: Experiment sample recording failures
        //
        // Tracks when a performance sample could not be recorded by the
        // rollout controller. Requests are never failed for this, so the
        // counter is the only signal. Surfaced by the /health endpoint.
        //
        // Cardinality: 1 time series
        let sample_record_failures = IntCounter::with_opts(Opts::new(
            "duoroute_sample_record_failures_total",
            "Total experiment sample recording failures. \
            Sustained increments mean rollout statistics are incomplete.",
        ))?;

        // Counter: Mid-stream failures during SSE streaming
        //
        // Tracks errors after the stream was already handed to the caller,
        // where no fallback is possible. The initial-connection failures that
        // do trigger fallback are counted in attempts_total instead.
        //
        // Cardinality: 2 backends = 2 time series
        let stream_failures = IntCounterVec::new(
            Opts::new(
                "duoroute_stream_failures_total",
                "Total mid-stream failures by backend. \
                These occur after streaming started and cannot be retried on the alternate backend.",
            ),
            &["backend"],
        )?;

        // Register all metrics
        registry.register(Box::new(attempts_total.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;
        registry.register(Box::new(classifier_decisions.clone()))?;
        registry.register(Box::new(classification_duration.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(prompt_cache_events.clone()))?;
        registry.register(Box::new(sample_record_failures.clone()))?;
        registry.register(Box::new(stream_failures.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            attempts_total,
            fallbacks_total,
            classifier_decisions,
            classification_duration,
            execution_duration,
            prompt_cache_events,
            sample_record_failures,
            stream_failures,
        })
    }

    /// Record a backend execution attempt
    ///
    /// # Arguments
    ///
    /// * `backend` - The backend that executed (type-safe enum)
    /// * `outcome` - How the attempt ended (type-safe enum)
    ///
    /// # Errors
    ///
    /// Returns an error if the metric is not registered.
    ///
    /// # Cardinality Safety
    ///
    /// Using enums instead of strings prevents cardinality explosion.
    /// Maximum label combinations: 2 backends x 4 outcomes = **8 time series**.
    pub fn record_attempt(
        &self,
        backend: BackendKind,
        outcome: AttemptOutcome,
    ) -> Result<(), prometheus::Error> {
        self.attempts_total
            .get_metric_with_label_values(&[backend.as_str(), outcome.as_str()])?
            .inc();
        Ok(())
    }

    /// Record a fallback activation from one backend to the other
    ///
    /// # Errors
    ///
    /// Returns an error if the metric is not registered.
    pub fn record_fallback(
        &self,
        from: BackendKind,
        to: BackendKind,
    ) -> Result<(), prometheus::Error> {
        self.fallbacks_total
            .get_metric_with_label_values(&[from.as_str(), to.as_str()])?
            .inc();
        Ok(())
    }

    /// Record a classifier routing decision
    ///
    /// # Errors
    ///
    /// Returns an error if the metric is not registered.
    pub fn record_classifier_decision(&self, route: BackendKind) -> Result<(), prometheus::Error> {
        self.classifier_decisions
            .get_metric_with_label_values(&[route.as_str()])?
            .inc();
        Ok(())
    }

    /// Record classifier scoring duration
    ///
    /// # Arguments
    ///
    /// * `duration_ms` - The duration in milliseconds (must be finite and non-negative)
    ///
    /// # Errors
    ///
    /// Returns an error if `duration_ms` is NaN, infinite, or negative.
    ///
    /// # Data Integrity
    ///
    /// NaN and infinity values corrupt histogram statistics (all percentiles
    /// become NaN). Negative values are logically invalid for durations, so
    /// both are rejected before they reach the histogram.
    pub fn record_classification_duration(&self, duration_ms: f64) -> Result<(), prometheus::Error> {
        validate_histogram_value(duration_ms)?;
        self.classification_duration.observe(duration_ms);
        Ok(())
    }

    /// Record backend execution duration
    ///
    /// # Arguments
    ///
    /// * `backend` - The backend that executed (type-safe enum)
    /// * `duration_ms` - The duration in milliseconds (must be finite and non-negative)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The metric is not registered
    /// - `duration_ms` is NaN, infinite, or negative
    pub fn record_execution_duration(
        &self,
        backend: BackendKind,
        duration_ms: f64,
    ) -> Result<(), prometheus::Error> {
        validate_histogram_value(duration_ms)?;
        self.execution_duration
            .get_metric_with_label_values(&[backend.as_str()])?
            .observe(duration_ms);
        Ok(())
    }

    /// Record a prompt cache event
    ///
    /// # Errors
    ///
    /// Returns an error if the metric is not registered.
    pub fn record_prompt_cache_event(&self, event: CacheEvent) -> Result<(), prometheus::Error> {
        self.prompt_cache_events
            .get_metric_with_label_values(&[event.as_str()])?
            .inc();
        Ok(())
    }

    /// Record an experiment sample recording failure
    ///
    /// Call this when the rollout controller could not record a performance
    /// sample. The request continues normally; the counter is the signal.
    pub fn sample_record_failure(&self) {
        self.sample_record_failures.inc();
    }

    /// Get the current count of sample recording failures
    ///
    /// Returns the total number of sample recording failures since startup.
    /// Used by the /health endpoint to report experiment telemetry status.
    pub fn sample_record_failures_count(&self) -> u64 {
        self.sample_record_failures.get()
    }

    /// Record a mid-stream failure for a backend
    ///
    /// Call this when an error occurs during active SSE streaming (after the
    /// initial connection succeeded). These failures never trigger fallback
    /// but are valuable for observability.
    ///
    /// # Cardinality Safety
    ///
    /// Backend names come from a two-variant enum, so cardinality is bounded.
    pub fn stream_failure(&self, backend: BackendKind) {
        self.stream_failures
            .with_label_values(&[backend.as_str()])
            .inc();
    }

    /// Gather all metrics and encode them in Prometheus text format
    ///
    /// # Returns
    ///
    /// A string containing all metrics in Prometheus exposition format,
    /// suitable for the `/metrics` endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if metric encoding fails.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let metric_count = metric_families.len();

        tracing::debug!(
            metric_family_count = metric_count,
            "Encoding metrics to Prometheus text format"
        );

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            let metric_names: Vec<_> = metric_families.iter().map(|mf| mf.name()).collect();

            tracing::error!(
                error = %e,
                metric_family_count = metric_count,
                metric_names = ?metric_names,
                "Prometheus text encoder failed"
            );

            prometheus::Error::Msg(format!(
                "Failed to encode {} metric families: {}. Metrics: {:?}",
                metric_count, e, metric_names
            ))
        })?;

        String::from_utf8(buffer).map_err(|e| {
            let valid_up_to = e.utf8_error().valid_up_to();

            tracing::error!(
                invalid_byte_index = valid_up_to,
                "Prometheus encoder produced invalid UTF-8"
            );

            prometheus::Error::Msg(format!(
                "Failed to convert metrics to UTF-8 at byte {}: {}. \
                This indicates corrupted metric names or labels.",
                valid_up_to, e
            ))
        })
    }
}

/// Reject histogram observations that would corrupt percentile statistics.
fn validate_histogram_value(duration_ms: f64) -> Result<(), prometheus::Error> {
    if !duration_ms.is_finite() {
        return Err(prometheus::Error::Msg(format!(
            "Histogram value must be finite (not NaN or Infinity), got: {}. \
            NaN and infinity values corrupt histogram percentiles.",
            duration_ms
        )));
    }
    if duration_ms < 0.0 {
        return Err(prometheus::Error::Msg(format!(
            "Histogram value must be non-negative (duration cannot be negative), got: {}",
            duration_ms
        )));
    }
    Ok(())
}
