//! Request orchestration pipeline
//!
//! Drives a request through its lifecycle: prompt resolution, classification,
//! backend selection under the rollout controller's eligibility constraints,
//! execution with a per-backend deadline, and at most one fallback to the
//! alternate backend. Every attempt feeds the rollout controller a
//! performance sample, including attempts that were cancelled by a client
//! disconnect.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{Stream, StreamExt};

use crate::backends::{
    Backend, BackendKind, ExecutionEvent, ExecutionHandle, ExecutionResult, ExecutionStream,
};
use crate::brain::classifier::{ClassificationResult, QueryClassifier};
use crate::brain::messages::MessageAdapter;
use crate::brain::{BrainRequest, RequestIdentity};
use crate::config::Config;
use crate::error::{BrainError, BrainResult};
use crate::experiment::{Eligibility, ExperimentController, PerformanceSample, SampleOutcome};
use crate::metrics::{CacheEvent, Metrics};
use crate::prompts::{PromptService, PromptSource};
use crate::request_log::{AttemptOutcome, RequestLogger};

/// A completed blocking request, plus the routing facts handlers surface
/// in headers and metadata.
#[derive(Debug)]
pub struct BrainOutcome {
    pub result: ExecutionResult,
    pub backend: BackendKind,
    /// `None` when the classifier was disabled and never ran.
    pub classification: Option<ClassificationResult>,
    pub fallback_used: bool,
}

/// A started stream, plus the same routing facts as [`BrainOutcome`].
///
/// Once this is returned the request is committed to its backend: errors
/// inside the stream are terminal and never trigger a fallback.
pub struct StreamOutcome {
    pub stream: ExecutionStream,
    pub backend: BackendKind,
    pub classification: Option<ClassificationResult>,
    pub fallback_used: bool,
}

/// Coordinates the classifier, both backends, the rollout controller and the
/// prompt service for a single deployment.
pub struct Orchestrator {
    classifier: QueryClassifier,
    classifier_enabled: bool,
    adapter: MessageAdapter,
    agent: Arc<dyn Backend>,
    direct: Arc<dyn Backend>,
    agent_timeout: Duration,
    direct_timeout: Duration,
    agent_model: String,
    experiment: Arc<ExperimentController>,
    prompts: Arc<PromptService>,
    metrics: Metrics,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        agent: Arc<dyn Backend>,
        direct: Arc<dyn Backend>,
        experiment: Arc<ExperimentController>,
        prompts: Arc<PromptService>,
        metrics: Metrics,
    ) -> Self {
        let agent_model = config.backends.agent.model().to_string();
        let classifier = QueryClassifier::new(
            &config.classifier,
            agent_model.clone(),
            config.backends.direct.model().to_string(),
        );
        Self {
            classifier,
            classifier_enabled: config.classifier.enabled(),
            adapter: MessageAdapter::default(),
            agent_timeout: config.timeout_for_backend(BackendKind::Agent),
            direct_timeout: config.timeout_for_backend(BackendKind::Direct),
            agent_model,
            agent,
            direct,
            experiment,
            prompts,
            metrics,
        }
    }

    pub fn experiment(&self) -> &Arc<ExperimentController> {
        &self.experiment
    }

    pub fn prompts(&self) -> &Arc<PromptService> {
        &self.prompts
    }

    /// Run a request to completion.
    ///
    /// A retryable primary failure triggers exactly one attempt on the
    /// alternate backend; a second failure is reported as
    /// [`BrainError::DualBackendFailure`]. No backend is ever tried twice.
    pub async fn handle(
        &self,
        request: &BrainRequest,
        identity: &RequestIdentity,
        logger: &mut RequestLogger,
    ) -> BrainResult<BrainOutcome> {
        logger.record_phase("classifying");
        let (system_prompt, source) = self.prompts.system_prompt(request).await;
        self.note_prompt_source(source);
        let classification = self.classify(request, &system_prompt, logger);
        let routed = self.routed_classification(&classification);

        let (primary, reason) = self.choose_backend(classification.as_ref(), identity);
        logger.record_phase("routed");
        tracing::info!(
            correlation_id = %logger.correlation_id(),
            backend = primary.as_str(),
            reason,
            "Request routed"
        );

        logger.record_phase("executing");
        match self
            .attempt(primary, request, &routed, &system_prompt, logger, false)
            .await
        {
            Ok(result) => Ok(BrainOutcome {
                result,
                backend: primary,
                classification,
                fallback_used: false,
            }),
            Err(primary_err) if primary_err.retryable() => {
                let fallback = primary.other();
                logger.record_phase("retrying-other-backend");
                tracing::warn!(
                    correlation_id = %logger.correlation_id(),
                    from = primary.as_str(),
                    to = fallback.as_str(),
                    error = %primary_err,
                    "Primary backend failed; attempting fallback"
                );
                if let Err(e) = self.metrics.record_fallback(primary, fallback) {
                    tracing::warn!(error = %e, "Failed to record fallback metric");
                }
                match self
                    .attempt(fallback, request, &routed, &system_prompt, logger, true)
                    .await
                {
                    Ok(result) => Ok(BrainOutcome {
                        result,
                        backend: fallback,
                        classification,
                        fallback_used: true,
                    }),
                    Err(fallback_err) => Err(BrainError::DualBackendFailure {
                        primary: primary.as_str().to_string(),
                        primary_reason: primary_err.to_string(),
                        fallback: fallback.as_str().to_string(),
                        fallback_reason: fallback_err.to_string(),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Run a request with incremental delivery.
    ///
    /// The fallback window closes as soon as a backend hands over a stream:
    /// pre-stream failures (connection refused, timeout obtaining the stream)
    /// fall back like blocking failures, mid-stream failures are terminal.
    pub async fn handle_streaming(
        &self,
        request: &BrainRequest,
        identity: &RequestIdentity,
        logger: &mut RequestLogger,
    ) -> BrainResult<StreamOutcome> {
        logger.record_phase("classifying");
        let (system_prompt, source) = self.prompts.system_prompt(request).await;
        self.note_prompt_source(source);
        let classification = self.classify(request, &system_prompt, logger);
        let routed = self.routed_classification(&classification);

        let (primary, reason) = self.choose_backend(classification.as_ref(), identity);
        logger.record_phase("routed");
        tracing::info!(
            correlation_id = %logger.correlation_id(),
            backend = primary.as_str(),
            reason,
            streaming = true,
            "Request routed"
        );

        logger.record_phase("executing");
        match self
            .open_stream(primary, request, &routed, &system_prompt, logger, false)
            .await
        {
            Ok(stream) => Ok(StreamOutcome {
                stream,
                backend: primary,
                classification,
                fallback_used: false,
            }),
            Err(primary_err) if primary_err.retryable() => {
                let fallback = primary.other();
                logger.record_phase("retrying-other-backend");
                tracing::warn!(
                    correlation_id = %logger.correlation_id(),
                    from = primary.as_str(),
                    to = fallback.as_str(),
                    error = %primary_err,
                    "Primary backend refused the stream; attempting fallback"
                );
                if let Err(e) = self.metrics.record_fallback(primary, fallback) {
                    tracing::warn!(error = %e, "Failed to record fallback metric");
                }
                match self
                    .open_stream(fallback, request, &routed, &system_prompt, logger, true)
                    .await
                {
                    Ok(stream) => Ok(StreamOutcome {
                        stream,
                        backend: fallback,
                        classification,
                        fallback_used: true,
                    }),
                    Err(fallback_err) => Err(BrainError::DualBackendFailure {
                        primary: primary.as_str().to_string(),
                        primary_reason: primary_err.to_string(),
                        fallback: fallback.as_str().to_string(),
                        fallback_reason: fallback_err.to_string(),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Classify the request, or `None` when the classifier is disabled.
    fn classify(
        &self,
        request: &BrainRequest,
        system_prompt: &str,
        logger: &mut RequestLogger,
    ) -> Option<ClassificationResult> {
        if !self.classifier_enabled {
            tracing::debug!(
                correlation_id = %logger.correlation_id(),
                "Classifier disabled; routing to agent backend"
            );
            return None;
        }

        let prepared = self.adapter.prepare(request.turns());
        let utterance = request.latest_user_utterance();
        let started = Instant::now();
        let classification =
            self.classifier
                .classify(utterance.as_deref(), prepared.turns(), system_prompt);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        logger.record_classification(
            duration_ms as u64,
            classification.route_to_agent(),
            classification.confidence(),
        );
        let route = if classification.route_to_agent() {
            BackendKind::Agent
        } else {
            BackendKind::Direct
        };
        if let Err(e) = self.metrics.record_classifier_decision(route) {
            tracing::warn!(error = %e, "Failed to record classifier decision metric");
        }
        if let Err(e) = self.metrics.record_classification_duration(duration_ms) {
            tracing::warn!(error = %e, "Failed to record classification duration metric");
        }
        tracing::info!(
            correlation_id = %logger.correlation_id(),
            route = route.as_str(),
            complexity = classification.complexity_score(),
            confidence = classification.confidence(),
            reasoning = classification.reasoning(),
            "Query classified"
        );
        Some(classification)
    }

    /// The classification the backends execute under. With the classifier
    /// disabled this is the conservative default; it is not surfaced to
    /// callers.
    fn routed_classification(
        &self,
        classification: &Option<ClassificationResult>,
    ) -> ClassificationResult {
        classification.clone().unwrap_or_else(|| {
            ClassificationResult::conservative_default(
                "classifier disabled",
                self.agent_model.clone(),
            )
        })
    }

    /// Select the backend for this request.
    ///
    /// Eligibility only ever restricts use of the direct backend. A
    /// classifier verdict for the agent backend is always honored, as is the
    /// agent default when classification never ran.
    fn choose_backend(
        &self,
        classification: Option<&ClassificationResult>,
        identity: &RequestIdentity,
    ) -> (BackendKind, &'static str) {
        let Some(classification) = classification else {
            return (BackendKind::Agent, "classifier disabled");
        };
        if classification.route_to_agent() {
            return (BackendKind::Agent, "classifier chose agent backend");
        }
        match self.experiment.eligibility(identity) {
            Eligibility::Unrestricted => (BackendKind::Direct, "classifier chose direct backend"),
            Eligibility::DirectAllowed => {
                (BackendKind::Direct, "direct variant of active experiment")
            }
            Eligibility::AgentOnly => (BackendKind::Agent, "bucketed out of direct variant"),
        }
    }

    fn backend(&self, kind: BackendKind) -> &Arc<dyn Backend> {
        match kind {
            BackendKind::Agent => &self.agent,
            BackendKind::Direct => &self.direct,
        }
    }

    fn deadline(&self, kind: BackendKind) -> Duration {
        match kind {
            BackendKind::Agent => self.agent_timeout,
            BackendKind::Direct => self.direct_timeout,
        }
    }

    /// One blocking attempt against one backend, with deadline, cleanup,
    /// sample recording and metrics.
    async fn attempt(
        &self,
        kind: BackendKind,
        request: &BrainRequest,
        classification: &ClassificationResult,
        system_prompt: &str,
        logger: &mut RequestLogger,
        is_fallback: bool,
    ) -> BrainResult<ExecutionResult> {
        let backend = self.backend(kind);
        let deadline = self.deadline(kind);
        let handle = backend.new_handle();
        let mut guard = CancelGuard::new(
            Arc::clone(&self.experiment),
            self.metrics.clone(),
            Arc::clone(backend),
            handle.clone(),
            is_fallback,
        );

        let outcome = tokio::time::timeout(
            deadline,
            backend.execute(&handle, request, classification, system_prompt),
        )
        .await;
        guard.disarm();

        let duration_ms = elapsed_ms(handle.started_at());
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(BrainError::BackendTimeout {
                backend: kind.as_str().to_string(),
                timeout_seconds: deadline.as_secs(),
            }),
        };

        if let Err(e) = backend.cleanup(&handle).await {
            tracing::warn!(
                backend = kind.as_str(),
                execution_id = %handle.id(),
                error = %e,
                "Backend cleanup failed"
            );
        }

        match &result {
            Ok(res) => {
                logger.record_attempt(kind, AttemptOutcome::Success, duration_ms);
                logger.absorb_usage(&res.token_usage);
                self.record_sample(
                    kind,
                    SampleOutcome::Success,
                    duration_ms,
                    res.token_usage.total_tokens,
                    is_fallback,
                );
                self.record_attempt_metrics(kind, AttemptOutcome::Success, duration_ms);
            }
            Err(err) => {
                let attempt_outcome = if matches!(err, BrainError::BackendTimeout { .. }) {
                    AttemptOutcome::Timeout
                } else {
                    AttemptOutcome::Failure
                };
                logger.record_attempt(kind, attempt_outcome, duration_ms);
                self.record_sample(kind, SampleOutcome::Failure, duration_ms, 0, is_fallback);
                self.record_attempt_metrics(kind, attempt_outcome, duration_ms);
            }
        }

        result
    }

    /// Open a stream on one backend. The deadline covers stream
    /// establishment only; delivery itself is unbounded and ends with the
    /// client or the terminal event.
    async fn open_stream(
        &self,
        kind: BackendKind,
        request: &BrainRequest,
        classification: &ClassificationResult,
        system_prompt: &str,
        logger: &mut RequestLogger,
        is_fallback: bool,
    ) -> BrainResult<ExecutionStream> {
        let backend = self.backend(kind);
        let deadline = self.deadline(kind);
        let handle = backend.new_handle();
        let mut guard = CancelGuard::new(
            Arc::clone(&self.experiment),
            self.metrics.clone(),
            Arc::clone(backend),
            handle.clone(),
            is_fallback,
        );

        let opened = tokio::time::timeout(
            deadline,
            backend.execute_streaming(&handle, request, classification, system_prompt),
        )
        .await;
        guard.disarm();

        let error = match opened {
            Ok(Ok(stream)) => {
                let guard = StreamGuard {
                    experiment: Arc::clone(&self.experiment),
                    metrics: self.metrics.clone(),
                    backend: Arc::clone(backend),
                    handle,
                    is_fallback,
                    settled: false,
                };
                return Ok(MonitoredStream {
                    inner: stream,
                    guard,
                }
                .boxed());
            }
            Ok(Err(e)) => e,
            Err(_) => BrainError::BackendTimeout {
                backend: kind.as_str().to_string(),
                timeout_seconds: deadline.as_secs(),
            },
        };

        let duration_ms = elapsed_ms(handle.started_at());
        if let Err(e) = backend.cleanup(&handle).await {
            tracing::warn!(
                backend = kind.as_str(),
                execution_id = %handle.id(),
                error = %e,
                "Backend cleanup failed"
            );
        }
        let attempt_outcome = if matches!(error, BrainError::BackendTimeout { .. }) {
            AttemptOutcome::Timeout
        } else {
            AttemptOutcome::Failure
        };
        logger.record_attempt(kind, attempt_outcome, duration_ms);
        self.record_sample(kind, SampleOutcome::Failure, duration_ms, 0, is_fallback);
        self.record_attempt_metrics(kind, attempt_outcome, duration_ms);
        Err(error)
    }

    fn note_prompt_source(&self, source: PromptSource) {
        let event = match source {
            PromptSource::Cache => CacheEvent::Hit,
            PromptSource::Loaded => CacheEvent::Miss,
            PromptSource::Fallback => CacheEvent::Fallback,
        };
        if let Err(e) = self.metrics.record_prompt_cache_event(event) {
            tracing::warn!(error = %e, "Failed to record prompt cache metric");
        }
    }

    fn record_sample(
        &self,
        backend: BackendKind,
        outcome: SampleOutcome,
        duration_ms: u64,
        total_tokens: u64,
        is_fallback: bool,
    ) {
        let sample = PerformanceSample {
            backend,
            outcome,
            duration_ms,
            total_tokens,
            flags: fallback_flags(is_fallback),
        };
        record_sample_now(&self.experiment, &self.metrics, &sample);
    }

    fn record_attempt_metrics(
        &self,
        backend: BackendKind,
        outcome: AttemptOutcome,
        duration_ms: u64,
    ) {
        if let Err(e) = self.metrics.record_attempt(backend, outcome) {
            tracing::warn!(error = %e, "Failed to record attempt metric");
        }
        if let Err(e) = self
            .metrics
            .record_execution_duration(backend, duration_ms as f64)
        {
            tracing::warn!(error = %e, "Failed to record execution duration metric");
        }
    }
}

fn fallback_flags(is_fallback: bool) -> Vec<&'static str> {
    if is_fallback {
        vec!["fallback"]
    } else {
        Vec::new()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Record a sample against wall-clock time. A clock before the epoch cannot
/// be bucketed; the sample is dropped and counted as a recording failure.
fn record_sample_now(
    experiment: &ExperimentController,
    metrics: &Metrics,
    sample: &PerformanceSample,
) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => experiment.record_at(now.as_secs(), sample),
        Err(e) => {
            tracing::warn!(
                backend = sample.backend.as_str(),
                error = %e,
                "System clock before epoch; performance sample dropped"
            );
            metrics.sample_record_failure();
        }
    }
}

/// Cleanup cannot be awaited from `Drop`, so it runs as a detached task.
/// `Drop` may also run while the runtime is shutting down, in which case the
/// engine-side state is abandoned to the engine's own expiry.
fn spawn_cleanup(backend: Arc<dyn Backend>, handle: ExecutionHandle) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        if let Err(e) = backend.cleanup(&handle).await {
            tracing::warn!(
                backend = handle.backend().as_str(),
                execution_id = %handle.id(),
                error = %e,
                "Deferred cleanup failed"
            );
        }
    });
}

/// Records a cancelled sample when an in-flight attempt is dropped.
///
/// Axum drops the handler future when the client disconnects, which drops
/// this guard while still armed. Sample recording is synchronous, so it is
/// safe from `Drop`.
struct CancelGuard {
    experiment: Arc<ExperimentController>,
    metrics: Metrics,
    backend: Arc<dyn Backend>,
    handle: ExecutionHandle,
    is_fallback: bool,
    armed: bool,
}

impl CancelGuard {
    fn new(
        experiment: Arc<ExperimentController>,
        metrics: Metrics,
        backend: Arc<dyn Backend>,
        handle: ExecutionHandle,
        is_fallback: bool,
    ) -> Self {
        Self {
            experiment,
            metrics,
            backend,
            handle,
            is_fallback,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let kind = self.handle.backend();
        let duration_ms = elapsed_ms(self.handle.started_at());
        tracing::warn!(
            backend = kind.as_str(),
            execution_id = %self.handle.id(),
            duration_ms,
            "Request cancelled mid-execution"
        );
        let sample = PerformanceSample {
            backend: kind,
            outcome: SampleOutcome::Cancelled,
            duration_ms,
            total_tokens: 0,
            flags: fallback_flags(self.is_fallback),
        };
        record_sample_now(&self.experiment, &self.metrics, &sample);
        if let Err(e) = self.metrics.record_attempt(kind, AttemptOutcome::Cancelled) {
            tracing::warn!(error = %e, "Failed to record cancelled attempt metric");
        }
        spawn_cleanup(Arc::clone(&self.backend), self.handle.clone());
    }
}

/// Settles the attempt exactly once from whichever terminal condition comes
/// first: the `Completed` event, a terminal stream error, or the caller
/// dropping the stream.
struct StreamGuard {
    experiment: Arc<ExperimentController>,
    metrics: Metrics,
    backend: Arc<dyn Backend>,
    handle: ExecutionHandle,
    is_fallback: bool,
    settled: bool,
}

impl StreamGuard {
    fn settle(&mut self, outcome: SampleOutcome, attempt: AttemptOutcome, total_tokens: u64) {
        if self.settled {
            return;
        }
        self.settled = true;

        let kind = self.handle.backend();
        let duration_ms = elapsed_ms(self.handle.started_at());
        let sample = PerformanceSample {
            backend: kind,
            outcome,
            duration_ms,
            total_tokens,
            flags: fallback_flags(self.is_fallback),
        };
        record_sample_now(&self.experiment, &self.metrics, &sample);
        if let Err(e) = self.metrics.record_attempt(kind, attempt) {
            tracing::warn!(error = %e, "Failed to record attempt metric");
        }
        if let Err(e) = self
            .metrics
            .record_execution_duration(kind, duration_ms as f64)
        {
            tracing::warn!(error = %e, "Failed to record execution duration metric");
        }
        spawn_cleanup(Arc::clone(&self.backend), self.handle.clone());
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(
            backend = self.handle.backend().as_str(),
            execution_id = %self.handle.id(),
            "Stream dropped before completion"
        );
        self.settle(SampleOutcome::Cancelled, AttemptOutcome::Cancelled, 0);
    }
}

/// Pass-through stream that observes terminal conditions for accounting.
struct MonitoredStream {
    inner: ExecutionStream,
    guard: StreamGuard,
}

impl Stream for MonitoredStream {
    type Item = BrainResult<ExecutionEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(item)) = &polled {
            match item {
                Ok(ExecutionEvent::Completed(result)) => {
                    this.guard.settle(
                        SampleOutcome::Success,
                        AttemptOutcome::Success,
                        result.token_usage.total_tokens,
                    );
                }
                Err(e) => {
                    let kind = this.guard.handle.backend();
                    tracing::warn!(
                        backend = kind.as_str(),
                        execution_id = %this.guard.handle.id(),
                        error = %e,
                        "Stream failed mid-flight"
                    );
                    this.guard.metrics.stream_failure(kind);
                    this.guard
                        .settle(SampleOutcome::Failure, AttemptOutcome::Failure, 0);
                }
                Ok(_) => {}
            }
        }
        polled
    }
}
