//! Job lifecycle types: one chat completion as it moves through the router,
//! the scheduler queues, and the adapter.

use crate::error::NormalizedError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

/// Terminal and in-flight job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// One chat completion bound for a specific model and provider.
///
/// Created by the gateway front end on request arrival; a fallback attempt
/// is a fresh job with a new id. The original request body rides along so
/// the `openai_compat` adapter can forward it unchanged.
#[derive(Debug)]
pub struct Job {
    pub job_id: String,
    pub request_id: String,
    pub model_id: String,
    pub route_name: Option<String>,
    pub provider_id: String,
    pub body: Value,
    pub created_at: DateTime<Utc>,
    pub attempt_index: u32,
}

impl Job {
    pub fn new(
        request_id: impl Into<String>,
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            model_id: model_id.into(),
            route_name: None,
            provider_id: provider_id.into(),
            body,
            created_at: Utc::now(),
            attempt_index: 0,
        }
    }

    pub fn with_route(mut self, route_name: impl Into<String>) -> Self {
        self.route_name = Some(route_name.into());
        self
    }

    pub fn with_attempt_index(mut self, index: u32) -> Self {
        self.attempt_index = index;
        self
    }
}

/// What the scheduler delivers through a job's completion handle.
#[derive(Debug)]
pub struct JobOutcome {
    pub result: Result<Value, NormalizedError>,
    pub queue_wait_ms: u64,
    pub runtime_ms: u64,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        if self.result.is_ok() {
            JobStatus::Done
        } else {
            JobStatus::Failed
        }
    }
}

/// Awaited by the submitter; resolved exactly once by the scheduler.
pub type CompletionHandle = oneshot::Receiver<JobOutcome>;

/// One entry of a job's per-attempt trace.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NormalizedError>,
    pub queue_wait_ms: u64,
    pub runtime_ms: u64,
}
