//! # Model Registry
//!
//! Maintains the current model→provider mapping and rebuilds it on demand.
//!
//! A build walks every configured provider: detection first, then a health
//! probe, then the model listing - a static `declared_models` list verbatim,
//! otherwise the provider-native listing request. Providers that are down
//! but startable contribute their declared models only; a build never starts
//! anything (lazy start is the scheduler's job).
//!
//! Published snapshots are immutable: readers clone an `Arc` and never block
//! on a rebuild. Rebuilds are serialized and obey a cooldown; a failed build
//! (duplicate model ids with no precedence) leaves the previous snapshot in
//! effect.

use crate::adapters::AdapterSet;
use crate::provider::ProviderSet;
use crate::supervisor::ProcessSupervisor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default refresh cooldown.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Immutable model→provider mapping plus build metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// model id → provider id
    pub models: BTreeMap<String, String>,
    pub built_at: DateTime<Utc>,
    /// Monotonically increasing build counter
    pub build_id: u64,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            models: BTreeMap::new(),
            built_at: Utc::now(),
            build_id: 0,
        }
    }
}

/// One model id offered by more than one provider.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateModel {
    pub model: String,
    pub providers: Vec<String>,
}

/// What a refresh reports back, rebuilt or not.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub provider_count: usize,
    pub model_count: usize,
    /// Duplicates that were resolved via the precedence list
    pub duplicates: Vec<DuplicateModel>,
    pub built_at: DateTime<Utc>,
    /// False when the cooldown short-circuited the rebuild
    pub rebuilt: bool,
}

/// A failed build: unresolved duplicate model ids.
#[derive(Debug, Clone, Error, Serialize)]
#[error("registry build failed: {message}")]
pub struct RegistryBuildError {
    pub message: String,
    pub duplicates: Vec<DuplicateModel>,
}

struct BuildState {
    last_refresh: Option<Instant>,
    last_result: Option<Result<RegistrySummary, RegistryBuildError>>,
    next_build_id: u64,
}

/// The registry: serialized rebuilds, lock-free snapshot reads.
pub struct Registry {
    providers: Arc<ProviderSet>,
    supervisor: Arc<ProcessSupervisor>,
    adapters: Arc<AdapterSet>,
    /// Provider precedence for duplicate resolution, highest first
    precedence: Vec<String>,
    cooldown: Duration,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    build: tokio::sync::Mutex<BuildState>,
}

impl Registry {
    pub fn new(
        providers: Arc<ProviderSet>,
        supervisor: Arc<ProcessSupervisor>,
        adapters: Arc<AdapterSet>,
        precedence: Vec<String>,
        cooldown: Duration,
    ) -> Self {
        Self {
            providers,
            supervisor,
            adapters,
            precedence,
            cooldown,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::empty())),
            build: tokio::sync::Mutex::new(BuildState {
                last_refresh: None,
                last_result: None,
                next_build_id: 1,
            }),
        }
    }

    /// Current snapshot. Never blocks on a rebuild.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolve a model id against the current snapshot.
    pub fn resolve(&self, model_id: &str) -> Option<String> {
        self.snapshot().models.get(model_id).cloned()
    }

    /// The outcome of the most recent build attempt, for diagnostics.
    pub async fn last_build_error(&self) -> Option<RegistryBuildError> {
        let state = self.build.lock().await;
        match &state.last_result {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Rebuild the mapping, respecting the cooldown: a refresh younger than
    /// the cooldown returns the previous result without rebuilding.
    pub async fn refresh(&self) -> Result<RegistrySummary, RegistryBuildError> {
        let mut state = self.build.lock().await;

        if let (Some(last), Some(result)) = (state.last_refresh, state.last_result.as_ref()) {
            if last.elapsed() < self.cooldown {
                debug!("registry refresh within cooldown, returning previous result");
                return match result {
                    Ok(summary) => Ok(RegistrySummary {
                        rebuilt: false,
                        ..summary.clone()
                    }),
                    Err(e) => Err(e.clone()),
                };
            }
        }

        let build_id = state.next_build_id;
        let result = self.build_snapshot(build_id).await;
        state.last_refresh = Some(Instant::now());

        match result {
            Ok((snapshot, summary)) => {
                state.next_build_id += 1;
                let mut published = self
                    .snapshot
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *published = Arc::new(snapshot);
                drop(published);
                info!(
                    models = summary.model_count,
                    providers = summary.provider_count,
                    build_id,
                    "registry rebuilt"
                );
                state.last_result = Some(Ok(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                warn!(error = %e, "registry build failed, previous snapshot stays in effect");
                state.last_result = Some(Err(e.clone()));
                Err(e)
            }
        }
    }

    async fn build_snapshot(
        &self,
        build_id: u64,
    ) -> Result<(RegistrySnapshot, RegistrySummary), RegistryBuildError> {
        // model id → providers offering it, in declaration order
        let mut offers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut provider_count = 0usize;

        for id in self.providers.ids() {
            let Some(provider) = self.providers.get(id) else {
                continue;
            };
            let spec = &provider.spec;

            let detected = self.supervisor.detect(&provider).await;
            if !detected && !spec.start.enabled {
                debug!(provider = %id, "not detected and not startable, skipping");
                continue;
            }

            let healthy = self.supervisor.probe(&provider).await;

            let models = if healthy {
                if !spec.listing.declared_models.is_empty() {
                    spec.listing.declared_models.clone()
                } else {
                    match self.adapters.for_type(spec.kind).list_models(spec).await {
                        Ok(models) => models,
                        Err(e) => {
                            warn!(provider = %id, error = %e, "model listing failed");
                            let mut s = provider.state.lock().await;
                            s.last_error = Some(format!("model listing failed: {e}"));
                            Vec::new()
                        }
                    }
                }
            } else if spec.start.enabled {
                // Down but startable: declared models only, never a lazy
                // start during a build
                spec.listing.declared_models.clone()
            } else {
                debug!(provider = %id, "unhealthy and not startable, skipping");
                continue;
            };

            provider_count += 1;
            for model in models {
                offers.entry(model).or_default().push(id.clone());
            }
        }

        let mut models = BTreeMap::new();
        let mut resolved_duplicates = Vec::new();
        let mut unresolved = Vec::new();

        for (model, mut providers) in offers {
            providers.dedup();
            if providers.len() == 1 {
                models.insert(model, providers.remove(0));
                continue;
            }
            match self.pick_by_precedence(&providers) {
                Some(winner) => {
                    resolved_duplicates.push(DuplicateModel {
                        model: model.clone(),
                        providers: providers.clone(),
                    });
                    models.insert(model, winner);
                }
                None => unresolved.push(DuplicateModel { model, providers }),
            }
        }

        if !unresolved.is_empty() {
            let listing = unresolved
                .iter()
                .map(|d| format!("{} ({})", d.model, d.providers.join(", ")))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RegistryBuildError {
                message: format!(
                    "duplicate model ids with no precedence configured: {listing}"
                ),
                duplicates: unresolved,
            });
        }

        let built_at = Utc::now();
        let summary = RegistrySummary {
            provider_count,
            model_count: models.len(),
            duplicates: resolved_duplicates,
            built_at,
            rebuilt: true,
        };
        Ok((
            RegistrySnapshot {
                models,
                built_at,
                build_id,
            },
            summary,
        ))
    }

    fn pick_by_precedence(&self, providers: &[String]) -> Option<String> {
        self.precedence
            .iter()
            .find(|p| providers.iter().any(|candidate| candidate == *p))
            .cloned()
    }
}
