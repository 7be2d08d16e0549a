//! HTTP request handlers for the Duoroute API

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::backends::agent::ToolAgentBackend;
use crate::backends::direct::DirectModelBackend;
use crate::brain::RequestIdentity;
use crate::brain::orchestrator::Orchestrator;
use crate::config::Config;
use crate::error::{BrainError, BrainResult};
use crate::experiment::ExperimentController;
use crate::metrics::Metrics;
use crate::middleware::correlation_id::correlation_id_middleware;
use crate::prompts::{PromptService, TemplateLoader};
use crate::resources::ResourceManager;

pub mod brain;
pub mod health;
pub mod metrics;
pub mod stream;

/// Application state shared across all handlers
///
/// Everything is Arc'd so Axum handlers and the background maintenance
/// loops spawned at boot can clone it cheaply.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    experiment: Arc<ExperimentController>,
    prompts: Arc<PromptService>,
    resources: Arc<ResourceManager>,
    metrics: Metrics,
}

impl AppState {
    /// Wire the full pipeline up from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns an error when metric registration fails or an engine HTTP
    /// client cannot be constructed.
    pub fn new(config: Config) -> BrainResult<Self> {
        let metrics = Metrics::new()
            .map_err(|e| BrainError::Internal(format!("metrics registration failed: {e}")))?;

        let agent = Arc::new(ToolAgentBackend::new(config.backends.agent.clone())?);
        let direct = Arc::new(DirectModelBackend::new(config.backends.direct.clone())?);

        let experiment = Arc::new(ExperimentController::new(config.experiment.clone()));
        let prompts = Arc::new(PromptService::new(
            Arc::new(TemplateLoader::new(config.prompt_cache.template_dir.clone())),
            config.prompt_cache.max_entries,
            config.prompt_cache.ttl_seconds,
        ));
        let resources = Arc::new(ResourceManager::new(&config.resources));

        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            agent,
            direct,
            Arc::clone(&experiment),
            Arc::clone(&prompts),
            metrics.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            experiment,
            prompts,
            resources,
            metrics,
        })
    }

    /// Get reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get reference to the request orchestrator
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Get the shared rollout controller
    pub fn experiment(&self) -> &Arc<ExperimentController> {
        &self.experiment
    }

    /// Get the shared prompt service
    pub fn prompts(&self) -> &Arc<PromptService> {
        &self.prompts
    }

    /// Get the shared resource manager
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Get reference to the metrics registry handle
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Assemble the HTTP surface over the shared state
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/brain", post(brain::handler))
        .route("/api/brain/stream", post(stream::handler))
        .route("/health", get(health::handler))
        .route("/metrics", get(metrics::handler))
        .layer(middleware::from_fn(correlation_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Derive the experiment bucketing identity from request headers
///
/// `x-user-id` wins over `x-session-id`; the first hop in `x-forwarded-for`
/// stands in for the peer address. Requests carrying none of the three stay
/// outside any experiment.
pub(crate) fn request_identity(headers: &axum::http::HeaderMap) -> RequestIdentity {
    let text_header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    RequestIdentity::new(text_header("x-user-id"), text_header("x-session-id"), ip)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// State over unroutable endpoints, for handler tests that never reach
    /// an engine or that only exercise rejection paths.
    pub fn test_state() -> AppState {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 0

            [backends.agent]
            base_url = "http://localhost:9001/v1"
            model = "agent-30b"

            [backends.direct]
            base_url = "http://localhost:9002/v1"
            model = "direct-8b"
        "#;
        let config: Config = toml::from_str(toml).expect("should parse test config");
        config.validate().expect("test config should validate");
        AppState::new(config).expect("should create AppState")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appstate_new_creates_state() {
        let state = test_support::test_state();

        assert_eq!(state.config().server.port, 0);
        assert_eq!(state.config().backends.agent.model(), "agent-30b");
        assert!(!state.experiment().is_active());
    }

    #[test]
    fn test_appstate_is_clonable() {
        let state = test_support::test_state();

        // Clone should work (cheap Arc clone)
        let state2 = state.clone();
        assert_eq!(
            state2.config().backends.direct.model(),
            state.config().backends.direct.model()
        );
    }

    #[test]
    fn test_appstate_provides_access_to_components() {
        let state = test_support::test_state();

        let _ = state.config();
        let _ = state.orchestrator();
        let _ = state.experiment();
        let _ = state.prompts();
        let _ = state.resources();
        let _ = state.metrics();
    }

    #[test]
    fn test_request_identity_prefers_user_id() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-user-id", "user-7".parse().unwrap());
        headers.insert("x-session-id", "sess-3".parse().unwrap());
        headers.insert("x-forwarded-for", "10.0.0.9, 172.16.0.1".parse().unwrap());

        let identity = request_identity(&headers);
        assert_eq!(identity.bucket_key(), Some("user-7"));
        assert_eq!(identity.ip_address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_request_identity_takes_first_forwarded_hop() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.4, 10.1.1.1".parse().unwrap());

        let identity = request_identity(&headers);
        assert_eq!(identity.bucket_key(), Some("203.0.113.4"));
    }

    #[test]
    fn test_request_identity_blank_headers_ignored() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-user-id", "  ".parse().unwrap());

        let identity = request_identity(&headers);
        assert_eq!(identity.bucket_key(), None);
    }
}
