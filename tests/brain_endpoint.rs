//! End-to-end tests for POST /api/brain
//!
//! Each test stands up two wiremock engines (one per backend) and drives the
//! full router stack through `handlers::app`, verifying which engine was
//! queried, the response envelope, and the routing headers. Mock expectations
//! are checked on drop, so a request reaching the wrong engine fails the test
//! even without an explicit assertion.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use duoroute::config::Config;
use duoroute::handlers::brain::{CLASSIFICATION_SCORE_HEADER, EXECUTION_PATH_HEADER};
use duoroute::handlers::{self, AppState};
use duoroute::middleware::correlation_id::CORRELATION_ID_HEADER;
use std::str::FromStr;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// OpenAI-compatible completion body the mock engines answer with
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

/// Mount a completion endpoint that must be hit exactly `expected_hits` times
async fn mount_engine(server: &MockServer, content: &str, expected_hits: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(engine_reply(content)))
        .expect(expected_hits)
        .mount(server)
        .await;
}

/// Build a validated config pointing both backends at mock servers
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

fn app_for(config: Config) -> axum::Router {
    let state = AppState::new(config).expect("should build AppState");
    handlers::app(state)
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

async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).expect("response body should be JSON")
}

#[tokio::test]
async fn test_simple_query_routes_to_direct_backend() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "should not be called", 0).await;
    mount_engine(&direct, "Sunny, around 24C.", 1).await;

    let app = app_for(test_config(&agent.uri(), &direct.uri(), ""));
    let response = app
        .oneshot(brain_request("What's the weather in Lisbon?"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(EXECUTION_PATH_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("direct-backend")
    );
    let score: f64 = response
        .headers()
        .get(CLASSIFICATION_SCORE_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("score header should be present when the classifier ran")
        .parse()
        .expect("score header should be a number");
    assert!(
        (0.0..=1.0).contains(&score),
        "complexity score should be in [0, 1], got {score}"
    );

    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["content"], "Sunny, around 24C.");
    assert_eq!(body["executionPath"], "direct-backend");
    assert_eq!(body["classification"]["routeToAgentBackend"], false);
    assert_eq!(
        body["classification"]["recommendedModel"],
        "test-direct-8b"
    );
    assert_eq!(body["performance"]["fallbackUsed"], false);
    assert_eq!(body["tokenUsage"]["prompt"], 10);
    assert_eq!(body["tokenUsage"]["completion"], 5);
    assert_eq!(body["tokenUsage"]["total"], 15);
    assert_eq!(body["metadata"]["finishReason"], "stop");
    assert_eq!(body["metadata"]["summary"]["outcome"], "success");
    assert_eq!(
        body["metadata"]["summary"]["attempts"][0]["backend"],
        "direct"
    );
}

#[tokio::test]
async fn test_tool_intent_routes_to_agent_backend() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "Created the task and assigned it to Dana.", 1).await;
    mount_engine(&direct, "should not be called", 0).await;

    let app = app_for(test_config(&agent.uri(), &direct.uri(), ""));
    let response = app
        .oneshot(brain_request(
            "Create a task for the quarterly report and assign it to Dana",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(EXECUTION_PATH_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("agent-backend")
    );

    let body = response_json(response).await;
    assert_eq!(body["executionPath"], "agent-backend");
    assert_eq!(body["classification"]["routeToAgentBackend"], true);
    assert_eq!(body["classification"]["recommendedModel"], "test-agent-30b");
    let patterns = body["classification"]["detectedPatterns"]
        .as_array()
        .expect("detectedPatterns should be an array");
    assert!(
        patterns.iter().any(|p| p == "tool-intent"),
        "tool phrasing should be detected, got {patterns:?}"
    );
}

#[tokio::test]
async fn test_classifier_disabled_sends_everything_to_agent() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "All yours.", 1).await;
    mount_engine(&direct, "should not be called", 0).await;

    let extra = "\n[classifier]\nenabled = false\n";
    let app = app_for(test_config(&agent.uri(), &direct.uri(), extra));
    let response = app
        .oneshot(brain_request("What's the weather in Lisbon?"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(EXECUTION_PATH_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("agent-backend")
    );
    // No classifier run, no score header and no classification block.
    assert!(response.headers().get(CLASSIFICATION_SCORE_HEADER).is_none());

    let body = response_json(response).await;
    assert_eq!(body["executionPath"], "agent-backend");
    assert!(
        body.get("classification").is_none(),
        "classification should be omitted when the classifier is disabled"
    );
}

#[tokio::test]
async fn test_inbound_correlation_id_is_honored() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "ok", 0).await;
    mount_engine(&direct, "ok", 1).await;

    let app = app_for(test_config(&agent.uri(), &direct.uri(), ""));

    let correlation_id = "4fd1a79b-2f91-4cd5-9fd2-b20fcb1cf164";
    let body = serde_json::json!({
        "messages": [{ "role": "user", "content": "What's the weather in Lisbon?" }],
        "selectedChatModel": "workspace-default"
    });
    let request = Request::builder()
        .method("POST")
        .uri("/api/brain")
        .header("content-type", "application/json")
        .header(CORRELATION_ID_HEADER, correlation_id)
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some(correlation_id),
        "valid inbound correlation id should be echoed back"
    );
    let body = response_json(response).await;
    assert_eq!(body["metadata"]["correlationId"], correlation_id);
}

#[tokio::test]
async fn test_multipart_text_content_is_flattened() {
    let agent = MockServer::start().await;
    let direct = MockServer::start().await;
    mount_engine(&agent, "ok", 0).await;
    mount_engine(&direct, "Cloudy with light rain.", 1).await;

    let app = app_for(test_config(&agent.uri(), &direct.uri(), ""));

    // Rich-editor clients send content as typed parts instead of a string.
    let body = serde_json::json!({
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": "What's the weather" },
                { "type": "text", "text": "in Lisbon?" }
            ]
        }],
        "selectedChatModel": "workspace-default"
    });
    let request = Request::builder()
        .method("POST")
        .uri("/api/brain")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["executionPath"], "direct-backend");
    assert_eq!(body["content"], "Cloudy with light rain.");
}
