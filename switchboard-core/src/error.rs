//! # Error Types
//!
//! Error handling for the Switchboard core. Two layers:
//!
//! - **`NormalizedError`**: the fixed taxonomy every adapter, supervisor, and
//!   scheduler failure is reduced to. This is what flows through job traces,
//!   fallback decisions, and the HTTP error surface.
//! - **`CoreError`**: construction-time failures (bad configuration, HTTP
//!   client setup) that never reach a request path.
//!
//! The taxonomy is deliberately small and total: every failure in the system
//! maps to exactly one kind. Adapters emit `unreachable`, `timeout`, `oom`,
//! `context_length`, and `other`; the scheduler and supervisor synthesize
//! `unreachable` (start failure) and `timeout` (queue-wait expiry); the
//! gateway front end synthesizes `not_found` and `bad_request` during
//! validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The normalized error taxonomy.
///
/// Exposed internally and in per-attempt traces. Route definitions name
/// members of this set in `fallback_on` to decide which failures trigger the
/// fallback cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, socket error, or a backend process
    /// that could not be started.
    Unreachable,
    /// The request exceeded its configured time budget, in queue or in flight.
    Timeout,
    /// The backend ran out of memory serving the request.
    Oom,
    /// The prompt exceeds the model's context window.
    ContextLength,
    /// Unknown model id, unknown route alias, or a vanished provider.
    NotFound,
    /// The request failed validation before it was ever submitted.
    BadRequest,
    /// Everything else, including unclassified 4xx/5xx responses.
    Other,
}

impl ErrorKind {
    /// Stable snake_case name, as it appears in traces and log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Oom => "oom",
            ErrorKind::ContextLength => "context_length",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: a taxonomy member plus a human-readable message.
///
/// The message is carried into traces and error responses; the kind drives
/// fallback and status-code decisions.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

/// Failures outside the request path: configuration and setup.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid or missing configuration
    #[error("configuration error: {message}")]
    Config { message: String },

    /// HTTP client construction failed
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl CoreError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
