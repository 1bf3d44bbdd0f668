// Chat completion and model-list API tests.

use crate::helpers;
use axum::http::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use switchboard_core::ErrorKind;

#[tokio::test]
async fn stream_true_is_refused_before_any_job_is_enqueued() {
    let gw = helpers::gateway(vec![], HashMap::new()).await;

    let mut body = helpers::chat_body("anything");
    body["stream"] = json!(true);
    let response = gw.server.post("/v1/chat/completions").json(&body).await;
    assert_eq!(response.status_code(), StatusCode::NOT_IMPLEMENTED);

    let error: Value = response.json();
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("streaming"));

    // Nothing was enqueued
    let health: Value = gw.server.get("/health").await.json();
    assert_eq!(health["total_queued"], 0);
}

#[tokio::test]
async fn missing_model_is_a_bad_request() {
    let gw = helpers::gateway(vec![], HashMap::new()).await;
    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let error: Value = response.json();
    assert_eq!(error["error"]["type"], "bad_request");
}

#[tokio::test]
async fn empty_messages_are_a_bad_request() {
    let gw = helpers::gateway(vec![], HashMap::new()).await;
    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&json!({"model": "m", "messages": []}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let gw = helpers::gateway(vec![], HashMap::new()).await;
    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&helpers::chat_body("no-such-model"))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let error: Value = response.json();
    assert_eq!(error["error"]["type"], "not_found");
}

#[tokio::test]
async fn completion_round_trip_through_a_healthy_backend() {
    let (_server, provider) = helpers::healthy_provider("lmstudio", "phi3").await;
    let gw = helpers::gateway(vec![provider], HashMap::new()).await;

    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&helpers::chat_body("phi3"))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "mock reply");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["usage"]["total_tokens"], 7);
}

#[tokio::test]
async fn explicit_model_does_not_fall_back() {
    // Scenario: the provider behind local-x cannot start; a perfectly
    // healthy alternative exists but an explicit model id must not use it.
    let (_server, other) = helpers::healthy_provider("cloud", "cloud-y").await;
    let gw = helpers::gateway(
        vec![helpers::dead_local_provider("dead", "local-x"), other],
        HashMap::new(),
    )
    .await;

    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&helpers::chat_body("local-x"))
        .await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    let error: Value = response.json();
    assert_eq!(error["error"]["type"], "unreachable");
    // Not a route call: no attempts trace in the body
    assert!(error["error"].get("attempts").is_none());
}

#[tokio::test]
async fn route_falls_back_to_the_alternate_on_unreachable() {
    let (_server, cloud) = helpers::healthy_provider("cloud", "cloud-y").await;
    let mut routes = HashMap::new();
    routes.insert(
        "r".to_string(),
        helpers::route("local-x", &["cloud-y"], &[ErrorKind::Unreachable]),
    );
    let gw = helpers::gateway(
        vec![helpers::dead_local_provider("dead", "local-x"), cloud],
        routes,
    )
    .await;

    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&helpers::chat_body("route:r"))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "mock reply");

    // The trace is visible via the admin surface, not the response
    let jobs: Value = gw.server.get("/admin/jobs").await.json();
    let job = &jobs["jobs"][0];
    assert_eq!(job["status"], "done");
    assert_eq!(job["route_name"], "r");
    assert_eq!(job["model"], "cloud-y");
    let attempts = job["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["model"], "local-x");
    assert_eq!(attempts[0]["error"]["kind"], "unreachable");
    assert_eq!(attempts[1]["model"], "cloud-y");
    assert_eq!(attempts[1]["status"], "done");
}

#[tokio::test]
async fn route_failure_reports_the_full_trace() {
    let mut routes = HashMap::new();
    routes.insert(
        "r".to_string(),
        helpers::route("local-x", &["local-y"], &[ErrorKind::Unreachable]),
    );
    let gw = helpers::gateway(
        vec![
            helpers::dead_local_provider("dead-x", "local-x"),
            helpers::dead_local_provider("dead-y", "local-y"),
        ],
        routes,
    )
    .await;

    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&helpers::chat_body("route:r"))
        .await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    let error: Value = response.json();
    assert_eq!(error["error"]["type"], "unreachable");
    let attempts = error["error"]["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["model"], "local-x");
    assert_eq!(attempts[1]["model"], "local-y");
}

#[tokio::test]
async fn slow_backend_hits_the_request_timeout() {
    let (_server, provider) = helpers::healthy_provider_with_delay("slow", "m", 3_000).await;
    let gw = helpers::gateway_with_timeout(vec![provider], HashMap::new(), 1).await;

    let response = gw
        .server
        .post("/v1/chat/completions")
        .json(&helpers::chat_body("m"))
        .await;
    assert_eq!(response.status_code(), StatusCode::GATEWAY_TIMEOUT);
    let error: Value = response.json();
    assert_eq!(error["error"]["type"], "timeout");
}

#[tokio::test]
async fn model_list_uses_the_openai_shape_and_hides_providers() {
    let (_server, provider) = helpers::healthy_provider("lmstudio", "phi3").await;
    let gw = helpers::gateway(vec![provider], HashMap::new()).await;

    let response = gw.server.get("/v1/models").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], "phi3");
    assert_eq!(data[0]["object"], "model");
    assert_eq!(data[0]["owned_by"], "switchboard");
    assert!(data[0].get("provider").is_none());
}
