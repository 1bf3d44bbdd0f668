//! # HTTP Handlers
//!
//! The request handlers behind the gateway's endpoints. Validation happens
//! here - the router and scheduler only ever see well-formed requests:
//!
//! - `stream: true` is refused with 501 before any job is enqueued;
//! - `model` and a non-empty `messages` array are required;
//! - everything else is passed through untouched, so the `openai_compat`
//!   adapter can forward the body verbatim.
//!
//! Every routed request lands in the request log with its per-attempt
//! trace, whether it succeeded or not.

use crate::config::GATEWAY_OWNER;
use crate::gateway_error::GatewayError;
use crate::request_log::RequestRecord;
use crate::server::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use switchboard_core::openai::{ChatRequest, ModelList};

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    if !body.is_object() {
        return Err(GatewayError::invalid("request body must be a JSON object"));
    }
    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        return Err(GatewayError::not_implemented(
            "streaming responses are not supported",
        ));
    }

    let request: ChatRequest = serde_json::from_value(body.clone())
        .map_err(|e| GatewayError::invalid(format!("malformed chat completion request: {e}")))?;
    if request.model.is_empty() {
        return Err(GatewayError::invalid("'model' must not be empty"));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::invalid("'messages' must not be empty"));
    }

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let reply = state
        .router
        .execute(&request_id, &request.model, body)
        .await;

    let status = if reply.result.is_ok() { "done" } else { "failed" };
    let (normalized_error, error_message) = match &reply.result {
        Ok(_) => (None, None),
        Err(e) => (Some(e.kind), Some(e.message.clone())),
    };
    tracing::info!(
        request_id,
        model = %reply.model,
        provider = reply.provider_id.as_deref().unwrap_or("-"),
        route = reply.route_name.as_deref().unwrap_or("-"),
        status,
        queue_wait_ms = reply.queue_wait_ms,
        runtime_ms = reply.runtime_ms,
        attempts = reply.trace.len(),
        "chat completion"
    );
    state.request_log.record(RequestRecord {
        ts: Utc::now(),
        request_id,
        job_id: reply.job_id.clone(),
        model: reply.model.clone(),
        provider_id: reply.provider_id.clone(),
        route_name: reply.route_name.clone(),
        queue_wait_ms: reply.queue_wait_ms,
        runtime_ms: reply.runtime_ms,
        status,
        normalized_error,
        error_message,
        attempts: reply.trace.clone(),
    });

    match reply.result {
        Ok(response) => Ok(Json(response)),
        Err(error) => Err(GatewayError::Completion {
            error,
            attempts: reply.trace,
            route: reply.route_name,
        }),
    }
}

/// `GET /v1/models` - the OpenAI list shape, ids only. Backends stay
/// anonymous: `owned_by` is always the gateway's identifier.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let snapshot = state.registry.snapshot();
    let created = snapshot.built_at.timestamp().max(0) as u64;
    Json(ModelList::from_ids(
        snapshot.models.keys().cloned(),
        GATEWAY_OWNER,
        created,
    ))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let queues = state.scheduler.queue_snapshot();
    let snapshot = state.registry.snapshot();
    let providers = state.providers.statuses().await;
    Json(json!({
        "status": "ok",
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "active_model": queues.active_model,
        "active_provider": queues.active_provider,
        "queues": queues.queued,
        "total_queued": queues.total_queued,
        "providers": providers,
        "registry": {
            "built_at": snapshot.built_at,
            "build_id": snapshot.build_id,
            "model_count": snapshot.models.len(),
        },
    }))
}

/// `POST /refresh` - cooldown-respecting registry rebuild.
pub async fn refresh(State(state): State<AppState>) -> Response {
    match state.registry.refresh().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "providers": summary.provider_count,
                "models": summary.model_count,
                "duplicates": summary.duplicates,
                "built_at": summary.built_at,
                "rebuilt": summary.rebuilt,
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": {
                    "message": e.to_string(),
                    "type": "duplicate_models",
                    "code": StatusCode::CONFLICT.as_u16(),
                    "duplicates": e.duplicates,
                }
            })),
        )
            .into_response(),
    }
}

/// `GET /admin/providers`
pub async fn admin_providers(State(state): State<AppState>) -> Json<Value> {
    let providers = state.providers.statuses().await;
    let conflict = state.registry.last_build_error().await;
    Json(json!({
        "providers": providers,
        "registry_conflict": conflict,
    }))
}

/// `GET /admin/registry`
pub async fn admin_registry(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "models": snapshot.models,
        "built_at": snapshot.built_at,
        "build_id": snapshot.build_id,
    }))
}

/// `GET /admin/jobs` - most recent completed requests from the ring buffer.
pub async fn admin_jobs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": state.request_log.recent(100) }))
}
