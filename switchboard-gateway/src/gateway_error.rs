//! # Gateway Error Types
//!
//! The HTTP boundary of the error taxonomy. Every failure leaving the
//! gateway becomes an OpenAI-style error object; the status code follows
//! the normalized kind:
//!
//! | kind | status |
//! |---|---|
//! | `not_found` | 404 |
//! | `timeout` | 504 |
//! | `unreachable`, `oom` | 503 |
//! | `context_length` | 413 |
//! | `bad_request` | 400 |
//! | `other` | 500 |
//!
//! `stream=true` is refused with 501 before a job is ever enqueued. When a
//! failed request used a route alias, the error body carries the ordered
//! per-attempt trace.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use switchboard_core::job::AttemptRecord;
use switchboard_core::{ErrorKind, NormalizedError};
use thiserror::Error;

/// Errors leaving the gateway's HTTP surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request validation failed before submission
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A feature this revision deliberately refuses
    #[error("not implemented: {message}")]
    NotImplemented { message: String },

    /// A completed request that ended in a normalized failure
    #[error("{error}")]
    Completion {
        error: NormalizedError,
        /// Per-attempt trace, included in the body for route calls
        attempts: Vec<AttemptRecord>,
        route: Option<String>,
    },

    /// Internal gateway failure
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Status code for a normalized error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unreachable | ErrorKind::Oom => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ContextLength => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": {
                        "message": message,
                        "type": ErrorKind::BadRequest.as_str(),
                        "code": StatusCode::BAD_REQUEST.as_u16(),
                    }
                }),
            ),
            GatewayError::NotImplemented { message } => (
                StatusCode::NOT_IMPLEMENTED,
                json!({
                    "error": {
                        "message": message,
                        "type": "not_implemented",
                        "code": StatusCode::NOT_IMPLEMENTED.as_u16(),
                    }
                }),
            ),
            GatewayError::Completion {
                error,
                attempts,
                route,
            } => {
                let status = status_for(error.kind);
                let message = match &route {
                    Some(name) => {
                        let summary = attempts
                            .iter()
                            .map(|a| match &a.error {
                                Some(e) => format!("{}: {}", a.model, e.kind),
                                None => format!("{}: done", a.model),
                            })
                            .collect::<Vec<_>>()
                            .join(" -> ");
                        format!("{error} (route '{name}', attempts: {summary})")
                    }
                    None => error.to_string(),
                };
                let mut error_obj = json!({
                    "message": message,
                    "type": error.kind.as_str(),
                    "code": status.as_u16(),
                });
                if route.is_some() {
                    error_obj["attempts"] = serde_json::to_value(&attempts)
                        .unwrap_or_else(|_| json!([]));
                }
                (status, json!({ "error": error_obj }))
            }
            GatewayError::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": {
                        "message": message,
                        "type": ErrorKind::Other.as_str(),
                        "code": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    }
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
