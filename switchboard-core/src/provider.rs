//! # Provider Model
//!
//! A provider is one addressable backend: an Ollama daemon, a llama.cpp
//! server, an LM Studio instance, or any OpenAI-compatible HTTP service
//! declared by configuration. This module separates the declarative side
//! (`ProviderSpec`, loaded from `providers/*.yaml`) from the runtime side
//! (`ProviderState`, mutated only by the process supervisor).
//!
//! Lifecycle invariants:
//!
//! - at most one live process handle per provider;
//! - `owned` implies a present process handle;
//! - `healthy` is monotone-false until the next successful probe;
//! - all lifecycle transitions happen under the per-provider mutex.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Backend protocol family. Decides which adapter translates requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Native Ollama HTTP API (`/api/chat`, `/api/tags`)
    Ollama,
    /// Anything speaking the OpenAI HTTP surface
    OpenaiCompat,
}

/// Resource group a provider draws from. Persisted for forward
/// compatibility; carries no concurrency meaning yet, all groups share the
/// global execution lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceGroup {
    #[default]
    LocalGpu,
    Cloud,
}

/// Health probe descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
    /// HTTP method, usually GET
    #[serde(default = "default_probe_method")]
    pub method: String,
    /// Path appended to the provider base URL
    #[serde(default = "default_probe_path")]
    pub path: String,
    /// Status codes counting as healthy
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<u16>,
    /// Probe timeout, distinct from the request timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            method: default_probe_method(),
            path: default_probe_path(),
            success_codes: default_success_codes(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_probe_method() -> String {
    "GET".to_string()
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_success_codes() -> Vec<u16> {
    vec![200]
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

/// Model-listing descriptor. A non-empty `declared_models` list is used
/// verbatim and no listing request is ever issued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingSpec {
    /// Path override; defaults by provider type (`/api/tags` or `/v1/models`)
    #[serde(default)]
    pub path: Option<String>,
    /// Static model list declared in configuration
    #[serde(default)]
    pub declared_models: Vec<String>,
}

/// How the registry decides a provider exists on this host at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectPolicy {
    /// Binary resolvable on the search path OR the probe URL answers
    #[default]
    PathOrProbe,
    /// Only the probe URL counts
    ProbeOnly,
    /// Unconditionally detected
    None,
}

/// Start descriptor: how the gateway launches this backend itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Executable, resolved on the platform search path
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment, merged over the parent environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// How long a freshly started process gets to report healthy
    #[serde(default = "default_startup_grace")]
    pub startup_grace_seconds: u64,
}

fn default_startup_grace() -> u64 {
    30
}

/// Stop method for gateway-owned processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    /// Graceful termination signal, escalating to a forced kill
    #[default]
    TerminateProcess,
    /// Forced kill immediately
    KillProcess,
    /// HTTP shutdown request first, then escalate
    HttpRequest,
    /// Externally managed; owned children are still reaped on escalation
    None,
}

/// HTTP shutdown descriptor for `StopMethod::HttpRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStop {
    #[serde(default = "default_stop_method_verb")]
    pub method: String,
    pub path: String,
}

fn default_stop_method_verb() -> String {
    "POST".to_string()
}

/// Stop descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopSpec {
    #[serde(default)]
    pub method: StopMethod,
    #[serde(default)]
    pub http: Option<HttpStop>,
}

/// Operational policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPolicy {
    /// Never stop this provider on idle
    #[serde(default)]
    pub keep_warm: bool,
    /// Stop an owned provider after this many idle seconds
    #[serde(default)]
    pub idle_shutdown_seconds: Option<u64>,
    /// Start-attempt budget per failure streak
    #[serde(default = "default_max_start_attempts")]
    pub max_start_attempts: u32,
    /// Re-launch after a crash detected between jobs
    #[serde(default = "default_restart_on_failure")]
    pub restart_on_failure: bool,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            keep_warm: false,
            idle_shutdown_seconds: None,
            max_start_attempts: default_max_start_attempts(),
            restart_on_failure: default_restart_on_failure(),
        }
    }
}

fn default_max_start_attempts() -> u32 {
    2
}

fn default_restart_on_failure() -> bool {
    true
}

/// Declarative description of one backend, loaded from `providers/*.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Unique provider id; never exposed to clients
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProviderType,
    #[serde(default)]
    pub resource_group: ResourceGroup,
    /// Base URL of the backend HTTP surface
    pub base_url: String,
    #[serde(default)]
    pub health: HealthProbe,
    #[serde(default)]
    pub listing: ListingSpec,
    #[serde(default)]
    pub detect: DetectPolicy,
    /// Binary name for path detection
    #[serde(default)]
    pub binary: Option<String>,
    /// Probe URL override for detection; defaults to base URL + health path
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default)]
    pub start: StartSpec,
    #[serde(default)]
    pub stop: StopSpec,
    #[serde(default)]
    pub policy: ProviderPolicy,
    /// Credential for cloud-group backends, inline
    #[serde(default)]
    pub api_key: Option<String>,
    /// Credential for cloud-group backends, read from the environment
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderSpec {
    /// Resolve the credential: inline value wins, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        self.api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }

    pub fn is_cloud(&self) -> bool {
        self.resource_group == ResourceGroup::Cloud
    }

    /// Effective model-listing path for this provider type.
    pub fn listing_path(&self) -> String {
        if let Some(path) = &self.listing.path {
            return path.clone();
        }
        match self.kind {
            ProviderType::Ollama => "/api/tags".to_string(),
            ProviderType::OpenaiCompat => "/v1/models".to_string(),
        }
    }

    /// URL probed during detection.
    pub fn detect_probe_url(&self) -> String {
        self.probe_url
            .clone()
            .unwrap_or_else(|| join_url(&self.base_url, &self.health.path))
    }

    /// URL of the health endpoint.
    pub fn health_url(&self) -> String {
        join_url(&self.base_url, &self.health.path)
    }

    /// Sanity-check the spec at load time.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.is_empty() {
            return Err(CoreError::config("provider id must not be empty"));
        }
        if self.base_url.is_empty() {
            return Err(CoreError::config(format!(
                "provider '{}': base_url must not be empty",
                self.id
            )));
        }
        if self.start.enabled && self.start.command.is_none() {
            return Err(CoreError::config(format!(
                "provider '{}': start.enabled requires start.command",
                self.id
            )));
        }
        if self.stop.method == StopMethod::HttpRequest && self.stop.http.is_none() {
            return Err(CoreError::config(format!(
                "provider '{}': stop.method http_request requires stop.http",
                self.id
            )));
        }
        Ok(())
    }
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Lifecycle phase of a provider's backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    #[default]
    Down,
    Starting,
    Up,
    Stopping,
}

/// Mutable runtime state, guarded by the per-provider mutex.
#[derive(Debug, Default)]
pub struct ProviderState {
    pub phase: LifecyclePhase,
    pub detected: bool,
    pub healthy: bool,
    /// True iff the gateway started the current process
    pub owned: bool,
    pub process: Option<tokio::process::Child>,
    pub last_error: Option<String>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Start attempts consumed in the current failure streak
    pub start_attempts: u32,
}

/// One backend: its declaration plus its guarded runtime state.
pub struct Provider {
    pub spec: ProviderSpec,
    /// Per-provider lifecycle mutex; `ensure_up`/`ensure_down` hold it for
    /// the whole transition
    pub state: Mutex<ProviderState>,
}

impl Provider {
    pub fn new(spec: ProviderSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Serializable status snapshot for diagnostics.
    pub async fn status(&self) -> ProviderStatus {
        let state = self.state.lock().await;
        ProviderStatus {
            id: self.spec.id.clone(),
            kind: self.spec.kind,
            resource_group: self.spec.resource_group,
            phase: state.phase,
            detected: state.detected,
            healthy: state.healthy,
            owned: state.owned,
            pid: state.process.as_ref().and_then(|c| c.id()),
            last_error: state.last_error.clone(),
            last_health_at: state.last_health_at,
            last_used_at: state.last_used_at,
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("id", &self.spec.id).finish()
    }
}

/// Point-in-time provider status, as served by `/admin/providers`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProviderType,
    pub resource_group: ResourceGroup,
    pub phase: LifecyclePhase,
    pub detected: bool,
    pub healthy: bool,
    pub owned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The fixed set of configured providers, shared across subsystems.
pub struct ProviderSet {
    inner: DashMap<String, Arc<Provider>>,
    order: Vec<String>,
}

impl ProviderSet {
    pub fn from_specs(specs: Vec<ProviderSpec>) -> Result<Self, CoreError> {
        let inner = DashMap::new();
        let mut order = Vec::with_capacity(specs.len());
        for spec in specs {
            spec.validate()?;
            let id = spec.id.clone();
            if inner.contains_key(&id) {
                return Err(CoreError::config(format!("duplicate provider id '{id}'")));
            }
            order.push(id.clone());
            inner.insert(id, Arc::new(Provider::new(spec)));
        }
        Ok(Self { inner, order })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Provider>> {
        self.inner.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Provider ids in declaration order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub async fn statuses(&self) -> Vec<ProviderStatus> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in &self.order {
            if let Some(provider) = self.get(id) {
                out.push(provider.status().await);
            }
        }
        out
    }
}
