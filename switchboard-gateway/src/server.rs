//! # HTTP Server
//!
//! Wires the core subsystems together and exposes them over axum:
//!
//! - `POST /v1/chat/completions` - inference
//! - `GET /v1/models` - model list, provider ids never leak
//! - `GET /health` - liveness plus a scheduler/provider/registry snapshot
//! - `POST /refresh` - cooldown-respecting registry rebuild
//! - `GET /admin/providers`, `/admin/registry`, `/admin/jobs` - diagnostics
//!
//! `create_server` builds every subsystem from the loaded configuration,
//! runs the initial registry build (a duplicate-model conflict keeps the
//! empty snapshot and is surfaced via the admin endpoints), and spawns the
//! scheduling loop.

use crate::config::GatewayConfig;
use crate::handlers;
use crate::request_log::RequestLog;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use switchboard_core::adapters::AdapterSet;
use switchboard_core::provider::ProviderSet;
use switchboard_core::registry::Registry;
use switchboard_core::router::Router as RequestRouter;
use switchboard_core::scheduler::Scheduler;
use switchboard_core::supervisor::ProcessSupervisor;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub providers: Arc<ProviderSet>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub router: Arc<RequestRouter>,
    pub request_log: Arc<RequestLog>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Stop the scheduling loop, fail queued work, and bring every
    /// gateway-owned backend down.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.supervisor.stop_all_owned(&self.providers).await;
    }
}

/// Build the application router and its state from a loaded configuration.
///
/// Also spawns the scheduling loop; the caller is responsible for calling
/// [`AppState::shutdown`] when the server stops.
pub async fn create_server(config: GatewayConfig) -> anyhow::Result<(axum::Router, AppState)> {
    let providers = Arc::new(ProviderSet::from_specs(config.providers.clone())?);
    let supervisor = Arc::new(ProcessSupervisor::new()?);
    let adapters = Arc::new(AdapterSet::new(config.request_timeout())?);

    let registry = Arc::new(Registry::new(
        providers.clone(),
        supervisor.clone(),
        adapters.clone(),
        config.registry.precedence.clone(),
        config.registry_cooldown(),
    ));
    if let Err(e) = registry.refresh().await {
        tracing::warn!(error = %e, "initial registry build failed; starting with an empty snapshot");
    }

    let scheduler = Arc::new(Scheduler::new(
        providers.clone(),
        supervisor.clone(),
        adapters,
        config.models.clone(),
        config.scheduler.aging_bonus_per_second,
    ));
    tokio::spawn(scheduler.clone().run());

    let router = Arc::new(RequestRouter::new(
        scheduler.clone(),
        registry.clone(),
        providers.clone(),
        config.routes.clone(),
        config.routing.max_fallback_attempts,
        config.routing.auto_refresh_on_miss,
        config.request_timeout(),
    ));

    let request_log = Arc::new(RequestLog::open(
        &config.logging.dir,
        config.logging.keep_days,
        config.logging.ring_capacity,
    )?);

    let state = AppState {
        config: Arc::new(config),
        providers,
        supervisor,
        registry,
        scheduler,
        router,
        request_log,
        started_at: Utc::now(),
    };

    let app = axum::Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .route("/refresh", post(handlers::refresh))
        .route("/admin/providers", get(handlers::admin_providers))
        .route("/admin/registry", get(handlers::admin_registry))
        .route("/admin/jobs", get(handlers::admin_jobs))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state.clone());

    Ok((app, state))
}
