//! Health check endpoint
//!
//! Provides a health check for monitoring and load balancers, including the
//! live rollout state and the degradation counters (prompt fallbacks served,
//! performance samples dropped).

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::experiment::ExperimentStatus;
use crate::handlers::AppState;

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    /// "operational", or "degraded" when any degradation counter is non-zero
    pub tracking_status: &'static str,
    pub experiment: ExperimentStatus,
    pub prompt_cache: PromptCacheHealth,
    pub resources: ResourceHealth,
    pub degradation: DegradationCounters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCacheHealth {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHealth {
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub tracked_resources: usize,
}

/// Counters behind the degraded flag. Both mean the service kept answering
/// while something underneath it misbehaved.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationCounters {
    /// Requests served with the built-in minimal prompt
    pub prompt_fallbacks: u64,
    /// Performance samples dropped before reaching the rollout controller
    pub sample_record_failures: u64,
}

/// Health check handler
///
/// Always returns 200 while the process serves traffic; degradation is
/// advisory. `trackingStatus` turns "degraded" once a prompt fallback was
/// served or a performance sample could not be recorded, which means the
/// rollout controller's aggregates may undercount.
pub async fn handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let prompt_fallbacks = state.prompts().fallback_count();
    let sample_record_failures = state.metrics().sample_record_failures_count();
    let tracking_status = if prompt_fallbacks > 0 || sample_record_failures > 0 {
        "degraded"
    } else {
        "operational"
    };

    let cache = state.prompts().cache();
    let resources = state.resources();

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "OK",
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            tracking_status,
            experiment: state.experiment().status(),
            prompt_cache: PromptCacheHealth {
                entries: cache.len(),
                hits: cache.hit_count(),
                misses: cache.miss_count(),
            },
            resources: ResourceHealth {
                cache_entries: resources.cache_len(),
                cache_bytes: resources.cache_bytes(),
                tracked_resources: resources.tracked_count(),
            },
            degradation: DegradationCounters {
                prompt_fallbacks,
                sample_record_failures,
            },
        }),
    )
}
