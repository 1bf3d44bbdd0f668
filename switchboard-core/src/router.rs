//! # Router
//!
//! Resolves what a request's `model` string actually targets and drives the
//! fallback cascade.
//!
//! A `route:<name>` alias expands to its primary model plus the ordered
//! fallback list, capped by `max_fallback_attempts` (additional attempts
//! beyond the primary). A plain model id is looked up in the registry
//! snapshot; on a miss the router may ask for exactly one cooldown-respecting
//! refresh. Explicit model ids never fall back in this revision.
//!
//! Each attempt is a fresh job with a new id, submitted to the scheduler and
//! awaited under the per-request time budget. A classified failure whose
//! kind appears in the route's `fallback_on` set advances to the next
//! alternate; exhaustion returns the final error together with the full
//! per-attempt trace. The router holds a handle to the scheduler and the
//! adapters stay stateless, so there is no reference cycle.

use crate::error::{ErrorKind, NormalizedError};
use crate::job::{AttemptRecord, Job, JobOutcome, JobStatus};
use crate::provider::ProviderSet;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Prefix marking a symbolic route alias.
pub const ROUTE_PREFIX: &str = "route:";

/// One route alias: a primary model, ordered alternates, and the error
/// kinds that trigger the cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub primary_model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub fallback_on: Vec<ErrorKind>,
}

/// What an `execute` call hands back to the gateway: the final result plus
/// everything the log record needs.
#[derive(Debug)]
pub struct RouterReply {
    pub result: Result<serde_json::Value, NormalizedError>,
    /// The model of the last attempt, or the requested name when resolution
    /// never produced an attempt
    pub model: String,
    pub provider_id: Option<String>,
    pub route_name: Option<String>,
    pub job_id: Option<String>,
    pub trace: Vec<AttemptRecord>,
    /// Queue-wait and runtime summed over all attempts
    pub queue_wait_ms: u64,
    pub runtime_ms: u64,
}

/// The router: alias resolution, registry misses, and the cascade.
pub struct Router {
    scheduler: Arc<Scheduler>,
    registry: Arc<Registry>,
    providers: Arc<ProviderSet>,
    routes: HashMap<String, RouteSpec>,
    /// Additional attempts beyond the primary
    max_fallback_attempts: u32,
    auto_refresh_on_miss: bool,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        scheduler: Arc<Scheduler>,
        registry: Arc<Registry>,
        providers: Arc<ProviderSet>,
        routes: HashMap<String, RouteSpec>,
        max_fallback_attempts: u32,
        auto_refresh_on_miss: bool,
        request_timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            registry,
            providers,
            routes,
            max_fallback_attempts,
            auto_refresh_on_miss,
            request_timeout,
        }
    }

    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one request to completion: resolve, submit, await, and cascade.
    pub async fn execute(
        &self,
        request_id: &str,
        target: &str,
        body: serde_json::Value,
    ) -> RouterReply {
        let deadline = Instant::now() + self.request_timeout;

        let (route_name, attempt_models, fallback_on) = match self.resolve_target(target) {
            Ok(resolved) => resolved,
            Err(e) => {
                return RouterReply {
                    result: Err(e),
                    model: target.to_string(),
                    provider_id: None,
                    route_name: None,
                    job_id: None,
                    trace: Vec::new(),
                    queue_wait_ms: 0,
                    runtime_ms: 0,
                }
            }
        };

        let mut trace: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<NormalizedError> = None;
        let mut refreshed = false;
        let mut final_model = attempt_models[0].clone();
        let mut final_provider = None;
        let mut final_job_id = None;
        let mut total_wait = 0u64;
        let mut total_runtime = 0u64;

        let total_attempts = attempt_models.len();
        for (attempt_index, model) in attempt_models.into_iter().enumerate() {
            final_model = model.clone();
            let has_more = attempt_index + 1 < total_attempts;

            let provider_id = match self.resolve_model(&model, &mut refreshed).await {
                Ok(provider_id) => provider_id,
                Err(e) => {
                    trace.push(AttemptRecord {
                        model: model.clone(),
                        provider: None,
                        status: JobStatus::Failed,
                        error: Some(e.clone()),
                        queue_wait_ms: 0,
                        runtime_ms: 0,
                    });
                    last_error = Some(e.clone());
                    if route_name.is_some() && has_more && fallback_on.contains(&e.kind) {
                        continue;
                    }
                    break;
                }
            };

            // A cloud model without credentials fails the whole request
            // immediately; no alternate is attempted.
            if let Some(provider) = self.providers.get(&provider_id) {
                let spec = &provider.spec;
                if spec.is_cloud() && spec.resolve_api_key().is_none() {
                    let hint = spec
                        .api_key_env
                        .as_deref()
                        .map(|env| format!(" (set {env})"))
                        .unwrap_or_default();
                    let e = NormalizedError::bad_request(format!(
                        "model '{model}' targets a cloud provider with no credentials configured{hint}"
                    ));
                    trace.push(AttemptRecord {
                        model: model.clone(),
                        provider: Some(provider_id.clone()),
                        status: JobStatus::Failed,
                        error: Some(e.clone()),
                        queue_wait_ms: 0,
                        runtime_ms: 0,
                    });
                    return RouterReply {
                        result: Err(e),
                        model,
                        provider_id: Some(provider_id),
                        route_name,
                        job_id: None,
                        trace,
                        queue_wait_ms: total_wait,
                        runtime_ms: total_runtime,
                    };
                }
            }

            let mut job = Job::new(request_id, model.clone(), provider_id.clone(), body.clone())
                .with_attempt_index(attempt_index as u32);
            if let Some(name) = &route_name {
                job = job.with_route(name.clone());
            }
            let job_id = job.job_id.clone();
            final_job_id = Some(job_id.clone());
            final_provider = Some(provider_id.clone());

            debug!(
                request_id,
                %job_id,
                %model,
                provider = %provider_id,
                attempt = attempt_index,
                "submitting attempt"
            );
            let submitted_at = Instant::now();
            let handle = self.scheduler.submit(job);
            let remaining = deadline.duration_since(Instant::now());

            let outcome = match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => JobOutcome {
                    result: Err(NormalizedError::other("scheduler dropped the job")),
                    queue_wait_ms: submitted_at.elapsed().as_millis() as u64,
                    runtime_ms: 0,
                },
                Err(_) => {
                    // A queued job is removed; a running one finishes but
                    // its result is discarded.
                    let removed = self.scheduler.cancel(&job_id);
                    warn!(request_id, %job_id, removed, "request time budget exhausted");
                    JobOutcome {
                        result: Err(NormalizedError::timeout(format!(
                            "request exceeded its {}s budget",
                            self.request_timeout.as_secs()
                        ))),
                        queue_wait_ms: submitted_at.elapsed().as_millis() as u64,
                        runtime_ms: 0,
                    }
                }
            };

            total_wait += outcome.queue_wait_ms;
            total_runtime += outcome.runtime_ms;
            let status = outcome.status();
            match outcome.result {
                Ok(response) => {
                    trace.push(AttemptRecord {
                        model: model.clone(),
                        provider: Some(provider_id.clone()),
                        status,
                        error: None,
                        queue_wait_ms: outcome.queue_wait_ms,
                        runtime_ms: outcome.runtime_ms,
                    });
                    if attempt_index > 0 {
                        info!(
                            request_id,
                            route = route_name.as_deref().unwrap_or(""),
                            %model,
                            attempt = attempt_index,
                            "fallback attempt succeeded"
                        );
                    }
                    return RouterReply {
                        result: Ok(response),
                        model,
                        provider_id: Some(provider_id),
                        route_name,
                        job_id: final_job_id,
                        trace,
                        queue_wait_ms: total_wait,
                        runtime_ms: total_runtime,
                    };
                }
                Err(e) => {
                    trace.push(AttemptRecord {
                        model: model.clone(),
                        provider: Some(provider_id.clone()),
                        status,
                        error: Some(e.clone()),
                        queue_wait_ms: outcome.queue_wait_ms,
                        runtime_ms: outcome.runtime_ms,
                    });
                    last_error = Some(e.clone());

                    // No budget left: stop cascading regardless of the route
                    if e.kind == ErrorKind::Timeout
                        && deadline.duration_since(Instant::now()).is_zero()
                    {
                        break;
                    }
                    if route_name.is_some() && has_more && fallback_on.contains(&e.kind) {
                        info!(
                            request_id,
                            route = route_name.as_deref().unwrap_or(""),
                            failed_model = %model,
                            error = %e.kind,
                            "falling back to next alternate"
                        );
                        continue;
                    }
                    break;
                }
            }
        }

        RouterReply {
            result: Err(
                last_error.unwrap_or_else(|| NormalizedError::other("no attempt was made"))
            ),
            model: final_model,
            provider_id: final_provider,
            route_name,
            job_id: final_job_id,
            trace,
            queue_wait_ms: total_wait,
            runtime_ms: total_runtime,
        }
    }

    #[allow(clippy::type_complexity)]
    fn resolve_target(
        &self,
        target: &str,
    ) -> Result<(Option<String>, Vec<String>, HashSet<ErrorKind>), NormalizedError> {
        if let Some(name) = target.strip_prefix(ROUTE_PREFIX) {
            let route = self.routes.get(name).ok_or_else(|| {
                NormalizedError::not_found(format!("unknown route alias '{target}'"))
            })?;
            let mut models = Vec::with_capacity(1 + route.fallback_models.len());
            models.push(route.primary_model.clone());
            models.extend(
                route
                    .fallback_models
                    .iter()
                    .take(self.max_fallback_attempts as usize)
                    .cloned(),
            );
            Ok((
                Some(name.to_string()),
                models,
                route.fallback_on.iter().copied().collect(),
            ))
        } else {
            // Explicit model ids never fall back in this revision.
            Ok((None, vec![target.to_string()], HashSet::new()))
        }
    }

    async fn resolve_model(
        &self,
        model: &str,
        refreshed: &mut bool,
    ) -> Result<String, NormalizedError> {
        if let Some(provider) = self.registry.resolve(model) {
            return Ok(provider);
        }
        if self.auto_refresh_on_miss && !*refreshed {
            *refreshed = true;
            debug!(%model, "registry miss, requesting one refresh");
            // A failed rebuild keeps the previous snapshot; the retry below
            // then simply misses again.
            let _ = self.registry.refresh().await;
            if let Some(provider) = self.registry.resolve(model) {
                return Ok(provider);
            }
        }
        Err(NormalizedError::not_found(format!(
            "model '{model}' is not served by any configured provider"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterSet;
    use crate::provider::{ProviderSet, ProviderSpec};
    use crate::registry::DEFAULT_COOLDOWN;
    use crate::supervisor::ProcessSupervisor;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        router: Router,
        scheduler: Arc<Scheduler>,
        loop_handle: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn new(specs: Vec<ProviderSpec>, routes: HashMap<String, RouteSpec>) -> Self {
            let providers = Arc::new(ProviderSet::from_specs(specs).unwrap());
            let supervisor = Arc::new(ProcessSupervisor::new().unwrap());
            let adapters = Arc::new(AdapterSet::new(Duration::from_secs(5)).unwrap());
            let registry = Arc::new(Registry::new(
                providers.clone(),
                supervisor.clone(),
                adapters.clone(),
                vec![],
                DEFAULT_COOLDOWN,
            ));
            registry.refresh().await.unwrap();
            let scheduler = Arc::new(Scheduler::new(
                providers.clone(),
                supervisor,
                adapters,
                HashMap::new(),
                0.0,
            ));
            let loop_handle = tokio::spawn(scheduler.clone().run());
            let router = Router::new(
                scheduler.clone(),
                registry,
                providers,
                routes,
                3,
                true,
                Duration::from_secs(20),
            );
            Self {
                router,
                scheduler,
                loop_handle,
            }
        }

        async fn stop(self) {
            self.scheduler.shutdown();
            let _ = self.loop_handle.await;
        }
    }

    fn spec_yaml(yaml: &str) -> ProviderSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn unreachable_base() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    /// Startable on paper, but the command exits immediately and health
    /// never comes up: every use ends in `unreachable`.
    fn dead_local_provider(id: &str, model: &str) -> ProviderSpec {
        spec_yaml(&format!(
            "id: {id}\ntype: openai_compat\nbase_url: {}\ndetect: none\nstart:\n  enabled: true\n  command: \"true\"\n  startup_grace_seconds: 1\npolicy:\n  max_start_attempts: 1\nlisting:\n  declared_models: [{model}]\n",
            unreachable_base()
        ))
    }

    async fn healthy_provider(id: &str, model: &str) -> (MockServer, ProviderSpec) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list", "data": [{"id": model}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-ok",
                "object": "chat.completion",
                "created": 0,
                "model": model,
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            })))
            .mount(&server)
            .await;
        let spec = spec_yaml(&format!(
            "id: {id}\ntype: openai_compat\nbase_url: {}\ndetect: none\n",
            server.uri()
        ));
        (server, spec)
    }

    fn chat_body(model: &str) -> serde_json::Value {
        json!({"model": model, "messages": [{"role": "user", "content": "hello"}]})
    }

    #[tokio::test]
    async fn unknown_route_alias_is_not_found() {
        let harness = Harness::new(vec![], HashMap::new()).await;
        let reply = harness
            .router
            .execute("req-1", "route:nope", chat_body("route:nope"))
            .await;
        assert_eq!(reply.result.unwrap_err().kind, ErrorKind::NotFound);
        assert!(reply.trace.is_empty());
        harness.stop().await;
    }

    #[tokio::test]
    async fn unknown_model_is_not_found_after_one_refresh() {
        let harness = Harness::new(vec![], HashMap::new()).await;
        let reply = harness
            .router
            .execute("req-1", "missing-model", chat_body("missing-model"))
            .await;
        let err = reply.result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        harness.stop().await;
    }

    #[tokio::test]
    async fn explicit_model_does_not_fall_back() {
        let (_server, cloud) = healthy_provider("other", "cloud-y").await;
        let harness =
            Harness::new(vec![dead_local_provider("dead", "local-x"), cloud], HashMap::new())
                .await;
        let reply = harness
            .router
            .execute("req-1", "local-x", chat_body("local-x"))
            .await;
        assert_eq!(reply.result.unwrap_err().kind, ErrorKind::Unreachable);
        assert_eq!(reply.trace.len(), 1);
        assert_eq!(reply.trace[0].model, "local-x");
        harness.stop().await;
    }

    #[tokio::test]
    async fn route_falls_back_on_unreachable() {
        let (_server, cloud) = healthy_provider("cloud", "cloud-y").await;
        let mut routes = HashMap::new();
        routes.insert(
            "r".to_string(),
            RouteSpec {
                primary_model: "local-x".to_string(),
                fallback_models: vec!["cloud-y".to_string()],
                fallback_on: vec![ErrorKind::Unreachable],
            },
        );
        let harness =
            Harness::new(vec![dead_local_provider("dead", "local-x"), cloud], routes).await;

        let reply = harness
            .router
            .execute("req-1", "route:r", chat_body("route:r"))
            .await;
        let response = reply.result.unwrap();
        assert_eq!(response["choices"][0]["message"]["content"], "hi");
        assert_eq!(reply.model, "cloud-y");
        assert_eq!(reply.route_name.as_deref(), Some("r"));

        assert_eq!(reply.trace.len(), 2);
        assert_eq!(reply.trace[0].model, "local-x");
        assert_eq!(
            reply.trace[0].error.as_ref().unwrap().kind,
            ErrorKind::Unreachable
        );
        assert_eq!(reply.trace[1].model, "cloud-y");
        assert_eq!(reply.trace[1].status, JobStatus::Done);
        harness.stop().await;
    }

    #[tokio::test]
    async fn route_does_not_fall_back_on_unlisted_error() {
        let (_server, cloud) = healthy_provider("cloud", "cloud-y").await;
        let mut routes = HashMap::new();
        routes.insert(
            "r".to_string(),
            RouteSpec {
                primary_model: "local-x".to_string(),
                fallback_models: vec!["cloud-y".to_string()],
                // unreachable is NOT in the trigger set
                fallback_on: vec![ErrorKind::Oom],
            },
        );
        let harness =
            Harness::new(vec![dead_local_provider("dead", "local-x"), cloud], routes).await;

        let reply = harness
            .router
            .execute("req-1", "route:r", chat_body("route:r"))
            .await;
        assert_eq!(reply.result.unwrap_err().kind, ErrorKind::Unreachable);
        assert_eq!(reply.trace.len(), 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn cascade_respects_max_fallback_attempts() {
        let mut routes = HashMap::new();
        routes.insert(
            "r".to_string(),
            RouteSpec {
                primary_model: "p0".to_string(),
                fallback_models: vec!["p1".to_string(), "p2".to_string(), "p3".to_string()],
                fallback_on: vec![ErrorKind::NotFound],
            },
        );
        let providers = Arc::new(ProviderSet::from_specs(vec![]).unwrap());
        let supervisor = Arc::new(ProcessSupervisor::new().unwrap());
        let adapters = Arc::new(AdapterSet::new(Duration::from_secs(5)).unwrap());
        let registry = Arc::new(Registry::new(
            providers.clone(),
            supervisor.clone(),
            adapters.clone(),
            vec![],
            DEFAULT_COOLDOWN,
        ));
        let scheduler = Arc::new(Scheduler::new(
            providers.clone(),
            supervisor,
            adapters,
            HashMap::new(),
            0.0,
        ));
        // max_fallback_attempts = 2: primary plus two alternates, p3 never tried
        let router = Router::new(
            scheduler,
            registry,
            providers,
            routes,
            2,
            false,
            Duration::from_secs(5),
        );

        let reply = router.execute("req-1", "route:r", chat_body("route:r")).await;
        assert_eq!(reply.result.unwrap_err().kind, ErrorKind::NotFound);
        let attempted: Vec<&str> = reply.trace.iter().map(|a| a.model.as_str()).collect();
        assert_eq!(attempted, vec!["p0", "p1", "p2"]);
    }

    #[tokio::test]
    async fn cloud_model_without_credentials_fails_immediately() {
        let (_server, mut cloud) = healthy_provider("cloud", "gpt-x").await;
        cloud.resource_group = crate::provider::ResourceGroup::Cloud;
        cloud.api_key_env = Some("SWITCHBOARD_TEST_MISSING_KEY".to_string());

        let mut routes = HashMap::new();
        routes.insert(
            "r".to_string(),
            RouteSpec {
                primary_model: "gpt-x".to_string(),
                fallback_models: vec!["gpt-x".to_string()],
                fallback_on: vec![ErrorKind::BadRequest],
            },
        );
        let harness = Harness::new(vec![cloud], routes).await;
        let reply = harness
            .router
            .execute("req-1", "route:r", chat_body("route:r"))
            .await;
        let err = reply.result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        // Fails the request outright: no second attempt despite the route
        assert_eq!(reply.trace.len(), 1);
        harness.stop().await;
    }
}
