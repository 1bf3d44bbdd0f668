//! # Configuration
//!
//! YAML configuration for the gateway, loaded once at startup and never hot
//! reloaded. The layout under the config directory:
//!
//! - `config.yaml` - server binding, scheduler knobs, registry cooldown and
//!   precedence, routing limits, logging retention
//! - `providers/*.yaml` - one provider spec per file
//! - `routes.yaml` - route aliases
//! - `models.yaml` - optional per-model scoring overrides
//!
//! Everything is a value type: loaded, validated, then passed by reference.
//! Missing optional files fall back to defaults so a bare directory with a
//! single provider file is a working setup.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use switchboard_core::provider::ProviderSpec;
use switchboard_core::router::RouteSpec;
use switchboard_core::scheduler::ModelSettings;

/// Identifier reported as `owned_by` in `/v1/models`.
pub const GATEWAY_OWNER: &str = "switchboard";

/// The complete, validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
    pub routing: RoutingConfig,
    pub logging: LoggingConfig,
    pub providers: Vec<ProviderSpec>,
    pub routes: HashMap<String, RouteSpec>,
    pub models: HashMap<String, ModelSettings>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Total budget from submission to completion, across all fallback
    /// attempts
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_request_timeout() -> u64 {
    120
}

/// Scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_aging_bonus")]
    pub aging_bonus_per_second: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aging_bonus_per_second: default_aging_bonus(),
        }
    }
}

fn default_aging_bonus() -> f64 {
    switchboard_core::DEFAULT_AGING_BONUS_PER_SECOND
}

/// Registry rebuild behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    /// Provider precedence for duplicate model ids, highest first
    #[serde(default)]
    pub precedence: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown(),
            precedence: Vec::new(),
        }
    }
}

fn default_cooldown() -> u64 {
    30
}

/// Routing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Additional attempts beyond a route's primary model
    #[serde(default = "default_max_fallback_attempts")]
    pub max_fallback_attempts: u32,
    /// Allow one cooldown-respecting registry rebuild on a model miss
    #[serde(default = "default_auto_refresh")]
    pub auto_refresh_on_miss: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_fallback_attempts: default_max_fallback_attempts(),
            auto_refresh_on_miss: default_auto_refresh(),
        }
    }
}

fn default_max_fallback_attempts() -> u32 {
    3
}

fn default_auto_refresh() -> bool {
    true
}

/// Request-log location and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Rotated request-log files older than this are pruned
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,
    /// Ring-buffer capacity backing `/admin/jobs`
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            keep_days: default_keep_days(),
            ring_capacity: default_ring_capacity(),
        }
    }
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_keep_days() -> u32 {
    14
}

fn default_ring_capacity() -> usize {
    256
}

/// Shape of `config.yaml` itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RootFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    registry: RegistryConfig,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load the whole configuration tree from a directory.
    pub fn load(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();

        let root: RootFile = read_yaml_or_default(&dir.join("config.yaml"))?;
        let routes: HashMap<String, RouteSpec> = read_yaml_or_default(&dir.join("routes.yaml"))?;
        let models: HashMap<String, ModelSettings> =
            read_yaml_or_default(&dir.join("models.yaml"))?;
        let providers = load_providers(&dir.join("providers"))?;

        let config = Self {
            server: root.server,
            scheduler: root.scheduler,
            registry: root.registry,
            routing: root.routing,
            logging: root.logging,
            providers,
            routes,
            models,
        };
        config.validate()?;
        Ok(config)
    }

    /// Consistency checks beyond what serde enforces.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.request_timeout_seconds == 0 {
            bail!("server.request_timeout_seconds must be positive");
        }
        for spec in &self.providers {
            spec.validate()
                .with_context(|| format!("provider '{}'", spec.id))?;
        }
        for (name, route) in &self.routes {
            if name.is_empty() {
                bail!("route alias names must not be empty");
            }
            if route.primary_model.is_empty() {
                bail!("route '{name}': primary_model must not be empty");
            }
            if route.fallback_models.iter().any(String::is_empty) {
                bail!("route '{name}': fallback model ids must not be empty");
            }
        }
        for id in &self.registry.precedence {
            if !self.providers.iter().any(|p| &p.id == id) {
                bail!("registry.precedence names unknown provider '{id}'");
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.server.request_timeout_seconds)
    }

    pub fn registry_cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.registry.cooldown_seconds)
    }
}

fn read_yaml_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> anyhow::Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn load_providers(dir: &Path) -> anyhow::Result<Vec<ProviderSpec>> {
    let mut specs = Vec::new();
    if !dir.is_dir() {
        return Ok(specs);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let spec: ProviderSpec =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        specs.push(spec);
    }
    Ok(specs)
}
