//! A/B experiment controller and rollout advisor
//!
//! Buckets identified traffic deterministically, aggregates per-backend
//! performance in rolling windows, and recommends rollout changes. Only
//! rollback is applied automatically: when the monitored backend's error
//! rate crosses its ceiling or its success rate falls through its floor,
//! the next tick forces the rollout percentage to zero and flips a one-way
//! `rolled_back` flag. Increasing the rollout remains an operator decision.
//!
//! State sits behind a `std::sync::RwLock`: every critical section is a
//! short, non-suspending map or counter update, and `record` must be
//! callable from synchronous drop paths (a cancelled request reports its
//! sample from a guard).

pub mod stats;

use crate::backends::BackendKind;
use crate::brain::RequestIdentity;
use crate::config::ExperimentConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub use stats::{BackendAggregate, SampleOutcome};

/// One completed (or cancelled) request, as seen by the controller
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub backend: BackendKind,
    pub outcome: SampleOutcome,
    pub duration_ms: u64,
    pub total_tokens: u64,
    /// Feature flags active while the request ran
    pub flags: Vec<&'static str>,
}

/// Memoized assignment for one identifier
#[derive(Debug, Clone)]
pub struct UserBucket {
    pub assigned: BackendKind,
    pub assigned_at_epoch_secs: u64,
}

/// What the orchestrator may do with the lighter backend for this request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// No active test; the classifier decides freely
    Unrestricted,
    /// Bucketed into the direct-model variant
    DirectAllowed,
    /// Bucketed out of the direct-model variant
    AgentOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Maintain,
    Increase,
    Rollback,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maintain => "maintain",
            Self::Increase => "increase",
            Self::Rollback => "rollback",
        }
    }
}

/// Recommendation plus the evidence it was computed from
#[derive(Debug, Clone, Serialize)]
pub struct RecommendationReport {
    pub recommendation: Recommendation,
    pub reason: String,
    pub monitored: BackendAggregate,
    pub baseline: BackendAggregate,
}

/// Snapshot for health reporting and response metadata
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    pub active: bool,
    pub rollout_percent: u8,
    pub rolled_back: bool,
    pub bucket_count: usize,
    pub agent: BackendAggregate,
    pub direct: BackendAggregate,
}

struct ExperimentState {
    active: bool,
    rollout_percent: u8,
    rolled_back: bool,
    buckets: HashMap<String, UserBucket>,
    agent: stats::BackendWindow,
    direct: stats::BackendWindow,
}

pub struct ExperimentController {
    config: ExperimentConfig,
    state: RwLock<ExperimentState>,
}

impl ExperimentController {
    pub fn new(config: ExperimentConfig) -> Self {
        let state = ExperimentState {
            active: config.enabled,
            rollout_percent: config.rollout_percent,
            rolled_back: false,
            buckets: HashMap::new(),
            agent: stats::BackendWindow::new(config.window_seconds),
            direct: stats::BackendWindow::new(config.window_seconds),
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    pub fn is_active(&self) -> bool {
        self.read().active
    }

    pub fn rollout_percent(&self) -> u8 {
        self.read().rollout_percent
    }

    pub fn monitored_backend(&self) -> BackendKind {
        self.config.monitored_backend
    }

    /// Stable bucket slot for an identifier, 0..100
    fn bucket_slot(identifier: &str) -> u8 {
        let mut hasher = DefaultHasher::new();
        identifier.hash(&mut hasher);
        (hasher.finish() % 100) as u8
    }

    /// Decide what this request's identity is eligible for
    ///
    /// First sight of an identifier assigns and memoizes its bucket; repeat
    /// requests reuse it for the life of the test. Requests without any
    /// identifier, and all requests after a rollback, take the control
    /// variant.
    pub fn eligibility(&self, identity: &RequestIdentity) -> Eligibility {
        let monitored = self.config.monitored_backend;

        {
            let state = self.read();
            if !state.active {
                return Eligibility::Unrestricted;
            }
            if state.rolled_back {
                return eligibility_of(monitored.other());
            }
            if let Some(key) = identity.bucket_key() {
                if let Some(bucket) = state.buckets.get(key) {
                    return eligibility_of(bucket.assigned);
                }
            } else {
                return eligibility_of(monitored.other());
            }
        }

        let mut state = self.write();
        // A racing writer may have assigned this identifier between locks.
        let Some(key) = identity.bucket_key() else {
            return eligibility_of(monitored.other());
        };
        let rollout = state.rollout_percent;
        let bucket = state
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                let assigned = if Self::bucket_slot(key) < rollout {
                    monitored
                } else {
                    monitored.other()
                };
                UserBucket {
                    assigned,
                    assigned_at_epoch_secs: epoch_secs(),
                }
            });
        eligibility_of(bucket.assigned)
    }

    /// Record a sample. Synchronous so drop guards can call it.
    pub fn record(&self, sample: &PerformanceSample) {
        self.record_at(epoch_secs(), sample);
    }

    pub(crate) fn record_at(&self, now_epoch_secs: u64, sample: &PerformanceSample) {
        let mut state = self.write();
        let window = match sample.backend {
            BackendKind::Agent => &mut state.agent,
            BackendKind::Direct => &mut state.direct,
        };
        window.record(now_epoch_secs, sample.outcome, sample.duration_ms);
        tracing::trace!(
            backend = sample.backend.as_str(),
            outcome = sample.outcome.as_str(),
            duration_ms = sample.duration_ms,
            total_tokens = sample.total_tokens,
            flags = ?sample.flags,
            "Recorded performance sample"
        );
    }

    /// Evaluate the rollout policy against current aggregates
    pub fn recommendation(&self) -> RecommendationReport {
        let state = self.read();
        let (monitored, baseline) = match self.config.monitored_backend {
            BackendKind::Agent => (state.agent.aggregate(), state.direct.aggregate()),
            BackendKind::Direct => (state.direct.aggregate(), state.agent.aggregate()),
        };
        drop(state);

        let recommendation = self.evaluate(&monitored, &baseline);
        RecommendationReport {
            recommendation: recommendation.0,
            reason: recommendation.1,
            monitored,
            baseline,
        }
    }

    fn evaluate(
        &self,
        monitored: &BackendAggregate,
        baseline: &BackendAggregate,
    ) -> (Recommendation, String) {
        let cfg = &self.config;
        if monitored.decided() < cfg.min_samples {
            return (
                Recommendation::Maintain,
                format!(
                    "insufficient samples: {} of {} required",
                    monitored.decided(),
                    cfg.min_samples
                ),
            );
        }
        if monitored.error_rate > cfg.error_rate_ceiling {
            return (
                Recommendation::Rollback,
                format!(
                    "error rate {:.3} exceeds ceiling {:.3}",
                    monitored.error_rate, cfg.error_rate_ceiling
                ),
            );
        }
        if monitored.success_rate < cfg.success_rate_floor {
            return (
                Recommendation::Rollback,
                format!(
                    "success rate {:.3} below floor {:.3}",
                    monitored.success_rate, cfg.success_rate_floor
                ),
            );
        }

        let latency_target = baseline.mean_latency_ms * (1.0 - cfg.latency_gain_percent / 100.0);
        if baseline.mean_latency_ms > 0.0
            && monitored.mean_latency_ms < latency_target
            && monitored.success_rate >= baseline.success_rate
        {
            return (
                Recommendation::Increase,
                format!(
                    "mean latency {:.1}ms beats baseline {:.1}ms by more than {:.0}%",
                    monitored.mean_latency_ms,
                    baseline.mean_latency_ms,
                    cfg.latency_gain_percent
                ),
            );
        }
        (
            Recommendation::Maintain,
            "within configured bounds".to_string(),
        )
    }

    /// Periodic maintenance: prune windows, apply automatic rollback
    ///
    /// Returns the report the decision was based on so the caller can log
    /// it and export it to metrics.
    pub fn tick(&self) -> RecommendationReport {
        self.tick_at(epoch_secs())
    }

    pub(crate) fn tick_at(&self, now_epoch_secs: u64) -> RecommendationReport {
        {
            let mut state = self.write();
            state.agent.prune(now_epoch_secs);
            state.direct.prune(now_epoch_secs);
        }

        let report = self.recommendation();
        if report.recommendation == Recommendation::Rollback {
            let mut state = self.write();
            if state.active && !state.rolled_back {
                state.rolled_back = true;
                state.rollout_percent = 0;
                tracing::warn!(
                    monitored = self.config.monitored_backend.as_str(),
                    reason = %report.reason,
                    "Automatic rollback: rollout forced to 0"
                );
            }
        }
        report
    }

    /// Start a fresh test at the given rollout, clearing prior assignments
    pub fn start(&self, rollout_percent: u8) {
        let mut state = self.write();
        state.active = true;
        state.rolled_back = false;
        state.rollout_percent = rollout_percent.min(100);
        state.buckets.clear();
        state.agent = stats::BackendWindow::new(self.config.window_seconds);
        state.direct = stats::BackendWindow::new(self.config.window_seconds);
        tracing::info!(rollout_percent = state.rollout_percent, "Experiment started");
    }

    /// Stop the test and destroy its bucket assignments
    pub fn stop(&self) {
        let mut state = self.write();
        state.active = false;
        state.buckets.clear();
        tracing::info!("Experiment stopped");
    }

    pub fn status(&self) -> ExperimentStatus {
        let state = self.read();
        ExperimentStatus {
            active: state.active,
            rollout_percent: state.rollout_percent,
            rolled_back: state.rolled_back,
            bucket_count: state.buckets.len(),
            agent: state.agent.aggregate(),
            direct: state.direct.aggregate(),
        }
    }

    #[cfg(test)]
    pub(crate) fn assigned_backend(&self, key: &str) -> Option<BackendKind> {
        self.read().buckets.get(key).map(|b| b.assigned)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ExperimentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ExperimentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn eligibility_of(assigned: BackendKind) -> Eligibility {
    match assigned {
        BackendKind::Direct => Eligibility::DirectAllowed,
        BackendKind::Agent => Eligibility::AgentOnly,
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
