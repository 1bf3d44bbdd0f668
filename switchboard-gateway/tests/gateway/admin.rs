// Health, refresh, and admin endpoint tests.

use crate::helpers;
use axum::http::StatusCode;
use serde_json::Value;
use std::collections::HashMap;

#[tokio::test]
async fn health_reports_the_full_snapshot() {
    let (_server, provider) = helpers::healthy_provider("lmstudio", "phi3").await;
    let gw = helpers::gateway(vec![provider], HashMap::new()).await;

    let response = gw.server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert!(body["uptime_seconds"].is_number());
    assert_eq!(body["total_queued"], 0);
    assert!(body["active_model"].is_null());

    let providers = body["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["id"], "lmstudio");
    assert_eq!(providers[0]["healthy"], true);
    assert_eq!(providers[0]["owned"], false);

    assert_eq!(body["registry"]["model_count"], 1);
    assert_eq!(body["registry"]["build_id"], 1);
}

#[tokio::test]
async fn refresh_within_cooldown_does_not_rebuild() {
    let (_server, provider) = helpers::healthy_provider("lmstudio", "phi3").await;
    let gw = helpers::gateway(vec![provider], HashMap::new()).await;

    // The server built the registry at startup; the default 30 s cooldown
    // makes this call a no-op that reports the existing snapshot.
    let first = gw.server.post("/refresh").await;
    assert_eq!(first.status_code(), StatusCode::OK);
    let body: Value = first.json();
    assert_eq!(body["rebuilt"], false);
    assert_eq!(body["models"], 1);
    assert_eq!(body["providers"], 1);

    let second = gw.server.post("/refresh").await;
    let second_body: Value = second.json();
    assert_eq!(second_body["built_at"], body["built_at"]);

    let registry: Value = gw.server.get("/admin/registry").await.json();
    assert_eq!(registry["build_id"], 1);
}

#[tokio::test]
async fn duplicate_models_fail_the_build_and_surface_in_admin() {
    let gw = helpers::gateway(
        vec![
            helpers::dead_local_provider("a", "shared-model"),
            helpers::dead_local_provider("b", "shared-model"),
        ],
        HashMap::new(),
    )
    .await;

    // The startup build failed; within the cooldown /refresh reports the
    // same conflict.
    let response = gw.server.post("/refresh").await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "duplicate_models");
    let duplicates = body["error"]["duplicates"].as_array().unwrap();
    assert_eq!(duplicates[0]["model"], "shared-model");

    // The previously published (empty) snapshot is still in effect.
    let models: Value = gw.server.get("/v1/models").await.json();
    assert_eq!(models["data"].as_array().unwrap().len(), 0);

    let admin: Value = gw.server.get("/admin/providers").await.json();
    assert!(!admin["registry_conflict"].is_null());
    assert_eq!(admin["providers"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn admin_registry_maps_models_to_providers() {
    let (_server, provider) = helpers::healthy_provider("lmstudio", "phi3").await;
    let gw = helpers::gateway(vec![provider], HashMap::new()).await;

    let body: Value = gw.server.get("/admin/registry").await.json();
    assert_eq!(body["models"]["phi3"], "lmstudio");
    assert!(body["built_at"].is_string());
}

#[tokio::test]
async fn admin_jobs_starts_empty_and_fills_up() {
    let (_server, provider) = helpers::healthy_provider("lmstudio", "phi3").await;
    let gw = helpers::gateway(vec![provider], HashMap::new()).await;

    let empty: Value = gw.server.get("/admin/jobs").await.json();
    assert_eq!(empty["jobs"].as_array().unwrap().len(), 0);

    gw.server
        .post("/v1/chat/completions")
        .json(&helpers::chat_body("phi3"))
        .await;

    let filled: Value = gw.server.get("/admin/jobs").await.json();
    let jobs = filled["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["model"], "phi3");
    assert_eq!(jobs[0]["provider_id"], "lmstudio");
    assert_eq!(jobs[0]["status"], "done");
    assert!(jobs[0]["request_id"].is_string());
}
