//! Observability surface tests: GET /health and GET /metrics
//!
//! Health is advisory: the endpoint answers 200 while the process serves
//! traffic, and `trackingStatus` flips to "degraded" once a prompt fallback
//! was served or a performance sample was dropped. The metrics endpoint is
//! checked against real traffic so the exposition reflects what the router
//! actually did, not just what was registered.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use duoroute::config::Config;
use duoroute::handlers::{self, AppState};
use duoroute::middleware::correlation_id::CORRELATION_ID_HEADER;
use std::str::FromStr;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine_reply(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
    })
}

async fn mount_engine(server: &MockServer, content: &str, expected_hits: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(engine_reply(content)))
        .expect(expected_hits)
        .mount(server)
        .await;
}

fn test_config(agent_uri: &str, direct_uri: &str, extra: &str) -> Config {
    let toml = format!(
        r#"
[server]
host = "127.0.0.1"
port = 0

[backends.agent]
base_url = "{agent_uri}/v1"
model = "test-agent-30b"

[backends.direct]
base_url = "{direct_uri}/v1"
model = "test-direct-8b"
{extra}
"#
    );
    Config::from_str(&toml).expect("test config should validate")
}

/// State over unroutable endpoints, for tests that never reach an engine
fn idle_state(extra: &str) -> AppState {
    let config = test_config("http://127.0.0.1:9", "http://127.0.0.1:9", extra);
    AppState::new(config).expect("should build AppState")
}

fn brain_request(message: &str) -> Request<Body> {
    let body = serde_json::json!({
        "messages": [{ "role": "user", "content": message }],
        "selectedChatModel": "workspace-default"
    });
    Request::builder()
        .method("POST")
        .uri("/api/brain")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).expect("response body should be JSON")
}

async fn response_text(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).expect("response body should be UTF-8")
}

// ─────────────────────────────────────────────────────────────────────────
// /health
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_fresh_state_reports_operational() {
    let app = handlers::app(idle_state(""));

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["status"], "OK");
    assert_eq!(body["service"], "duoroute");
    assert!(
        body["version"].as_str().is_some_and(|v| !v.is_empty()),
        "version should be reported, got: {}",
        body["version"]
    );
    assert_eq!(body["trackingStatus"], "operational");
    assert_eq!(body["experiment"]["active"], false);
    assert_eq!(body["experiment"]["rolloutPercent"], 0);
    assert_eq!(body["experiment"]["rolledBack"], false);
    assert_eq!(body["experiment"]["bucketCount"], 0);
    assert_eq!(body["promptCache"]["entries"], 0);
    assert_eq!(body["promptCache"]["hits"], 0);
    assert_eq!(body["promptCache"]["misses"], 0);
    assert_eq!(body["resources"]["cacheEntries"], 0);
    assert_eq!(body["resources"]["trackedResources"], 0);
    assert_eq!(body["degradation"]["promptFallbacks"], 0);
    assert_eq!(body["degradation"]["sampleRecordFailures"], 0);
}

#[tokio::test]
async fn test_health_turns_degraded_after_sample_record_failure() {
    let state = idle_state("");
    let app = handlers::app(state.clone());

    state.metrics().sample_record_failure();

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK, "degradation is advisory");

    let body = response_json(response).await;
    assert_eq!(body["trackingStatus"], "degraded");
    assert_eq!(body["degradation"]["sampleRecordFailures"], 1);
    assert_eq!(body["degradation"]["promptFallbacks"], 0);
}

#[tokio::test]
async fn test_missing_prompt_template_degrades_health_but_not_requests() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "should not be called", 0).await;
    mount_engine(&direct, "Sunny.", 1).await;

    // Point the loader at a directory that does not exist, so every request
    // rides the built-in minimal prompt.
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent");
    let extra = format!(
        "\n[prompt_cache]\ntemplate_dir = \"{}\"\n",
        missing.display()
    );
    let app = handlers::app(AppState::new(test_config(
        &agent.uri(),
        &direct.uri(),
        &extra,
    ))
    .expect("should build AppState"));

    let response = app
        .clone()
        .oneshot(brain_request("What's the weather in Lisbon?"))
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        StatusCode::OK,
        "prompt fallback must not fail the request"
    );
    let body = response_json(response).await;
    assert_eq!(body["success"], true);

    let health = response_json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["trackingStatus"], "degraded");
    assert_eq!(health["degradation"]["promptFallbacks"], 1);
    assert_eq!(health["promptCache"]["misses"], 1);
    // Failed loads are never cached.
    assert_eq!(health["promptCache"]["entries"], 0);
}

#[tokio::test]
async fn test_prompt_template_is_cached_and_health_stays_operational() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "should not be called", 0).await;
    mount_engine(&direct, "Sunny.", 2).await;

    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(
        dir.path().join("default.md"),
        "You are the workspace assistant.",
    )
    .await
    .unwrap();
    let extra = format!(
        "\n[prompt_cache]\ntemplate_dir = \"{}\"\n",
        dir.path().display()
    );
    let app = handlers::app(AppState::new(test_config(
        &agent.uri(),
        &direct.uri(),
        &extra,
    ))
    .expect("should build AppState"));

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(brain_request("What's the weather in Lisbon?"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let health = response_json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["trackingStatus"], "operational");
    assert_eq!(health["degradation"]["promptFallbacks"], 0);
    assert_eq!(health["promptCache"]["entries"], 1);
    assert_eq!(
        health["promptCache"]["misses"], 1,
        "first request loads the template"
    );
    assert_eq!(
        health["promptCache"]["hits"], 1,
        "second request should be served from cache"
    );
}

#[tokio::test]
async fn test_health_echoes_inbound_correlation_id() {
    let app = handlers::app(idle_state(""));

    let correlation_id = "a2e5a5f0-4c1d-4a38-9b6e-0f3f6f1f2a99";
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header(CORRELATION_ID_HEADER, correlation_id)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some(correlation_id)
    );
}

// ─────────────────────────────────────────────────────────────────────────
// /metrics
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_metrics_exposition_reflects_served_requests() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "should not be called", 0).await;
    mount_engine(&direct, "Sunny.", 1).await;

    let app = handlers::app(
        AppState::new(test_config(&agent.uri(), &direct.uri(), ""))
            .expect("should build AppState"),
    );

    let response = app
        .clone()
        .oneshot(brain_request("What's the weather in Lisbon?"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/plain")),
        "exposition should be plain text"
    );

    let body = response_text(response).await;
    assert!(
        body.contains("# TYPE duoroute_backend_attempts_total counter"),
        "attempts counter family should be present"
    );
    assert!(
        body.contains(r#"duoroute_backend_attempts_total{backend="direct",outcome="success"} 1"#),
        "the served request should be counted, got:\n{body}"
    );
    assert!(
        body.contains(r#"duoroute_classifier_decisions_total{route="direct"} 1"#),
        "the classifier decision should be counted, got:\n{body}"
    );
    assert!(
        body.contains("# TYPE duoroute_execution_duration_ms histogram"),
        "execution latency histogram should be present"
    );
}

#[tokio::test]
async fn test_metrics_endpoint_succeeds_before_any_traffic() {
    let app = handlers::app(idle_state(""));

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
