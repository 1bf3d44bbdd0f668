//! # Process Supervisor
//!
//! Reconciles a provider's desired state (needed / not needed) with its
//! observed state (healthy / not healthy) using the declared start and stop
//! descriptors. Each provider moves through an explicit lifecycle
//! `{down, starting, up, stopping}`; transitions are driven only by the
//! operations here, never by external callers.
//!
//! Operations:
//!
//! - [`ProcessSupervisor::probe`] - issue the health request; never starts
//!   anything.
//! - [`ProcessSupervisor::ensure_up`] - probe, then launch the configured
//!   command and poll health until the startup grace elapses, within the
//!   provider's start-attempt budget.
//! - [`ProcessSupervisor::ensure_down`] - stop an owned process via the
//!   configured method, escalating from graceful termination to a forced
//!   kill; external processes are never stopped.
//! - [`ProcessSupervisor::detect`] - decide whether the backend exists on
//!   this host at all (binary on the search path and/or probe URL).
//!
//! Children are always reaped; a zombie is a defect. The per-provider mutex
//! is held across each whole transition, so no two `ensure_up`/`ensure_down`
//! calls for the same provider ever interleave.

use crate::error::CoreError;
use crate::provider::{
    DetectPolicy, LifecyclePhase, Provider, ProviderSet, ProviderSpec, StopMethod,
};
use chrono::Utc;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Poll cadence while waiting for a freshly started backend to report healthy.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Bounded wait for a graceful exit before escalating to a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Bounded wait for health to drop after an HTTP shutdown request.
const HTTP_STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("provider '{provider}' failed to start: {reason}")]
    StartFailed { provider: String, reason: String },
}

/// Starts, probes, and stops backend processes owned by the gateway.
pub struct ProcessSupervisor {
    http: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new() -> Result<Self, CoreError> {
        // Probe timeouts are applied per request from each provider's health
        // descriptor; the client itself carries no global timeout.
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    /// Issue the provider's health request. Updates `healthy` and
    /// `last_health_at`; never starts anything.
    pub async fn probe(&self, provider: &Provider) -> bool {
        let healthy = self.probe_spec(&provider.spec).await;
        let mut state = provider.state.lock().await;
        state.healthy = healthy;
        state.last_health_at = Some(Utc::now());
        if healthy {
            state.phase = LifecyclePhase::Up;
        } else if !state.owned {
            state.phase = LifecyclePhase::Down;
        }
        healthy
    }

    /// Decide whether this backend exists on the host at all.
    pub async fn detect(&self, provider: &Provider) -> bool {
        let spec = &provider.spec;
        let detected = match spec.detect {
            DetectPolicy::None => true,
            DetectPolicy::ProbeOnly => self.detect_probe_ok(spec).await,
            DetectPolicy::PathOrProbe => {
                binary_on_path(spec) || self.detect_probe_ok(spec).await
            }
        };
        let mut state = provider.state.lock().await;
        state.detected = detected;
        detected
    }

    /// Bring the provider up: return `Ok` if it is healthy, otherwise launch
    /// the configured command and poll health within the startup grace, up
    /// to the remaining start-attempt budget.
    pub async fn ensure_up(&self, provider: &Provider) -> Result<(), SupervisorError> {
        let spec = &provider.spec;
        let mut state = provider.state.lock().await;

        if self.probe_spec(spec).await {
            state.healthy = true;
            state.last_health_at = Some(Utc::now());
            state.phase = LifecyclePhase::Up;
            state.start_attempts = 0;
            return Ok(());
        }
        state.healthy = false;
        state.last_health_at = Some(Utc::now());

        // Reap a child that exited behind our back, and clear a hung one
        // before attempting a fresh launch.
        let mut crashed = false;
        if let Some(mut child) = state.process.take() {
            crashed = true;
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(provider = %spec.id, %status, "owned process had exited");
                }
                Ok(None) => {
                    warn!(provider = %spec.id, "owned process alive but unhealthy, restarting");
                    let _ = terminate_child(&mut child, STOP_GRACE, false).await;
                }
                Err(e) => {
                    warn!(provider = %spec.id, error = %e, "failed to poll owned process");
                }
            }
            state.owned = false;
        }

        if crashed && !spec.policy.restart_on_failure {
            let reason = "crashed and restart_on_failure is disabled".to_string();
            state.last_error = Some(reason.clone());
            state.phase = LifecyclePhase::Down;
            return Err(SupervisorError::StartFailed {
                provider: spec.id.clone(),
                reason,
            });
        }

        if !spec.start.enabled {
            let reason = "unhealthy and start is disabled".to_string();
            state.last_error = Some(reason.clone());
            state.phase = LifecyclePhase::Down;
            return Err(SupervisorError::StartFailed {
                provider: spec.id.clone(),
                reason,
            });
        }

        let budget = spec.policy.max_start_attempts;
        while state.start_attempts < budget {
            state.start_attempts += 1;
            state.phase = LifecyclePhase::Starting;
            info!(
                provider = %spec.id,
                attempt = state.start_attempts,
                "starting backend process"
            );

            let mut child = match spawn_backend(spec) {
                Ok(child) => child,
                Err(reason) => {
                    warn!(provider = %spec.id, %reason, "spawn failed");
                    state.last_error = Some(reason);
                    continue;
                }
            };

            let deadline = Instant::now() + Duration::from_secs(spec.start.startup_grace_seconds);
            let mut healthy = false;
            loop {
                if let Ok(Some(status)) = child.try_wait() {
                    state.last_error =
                        Some(format!("process exited during startup: {status}"));
                    break;
                }
                if self.probe_spec(spec).await {
                    healthy = true;
                    break;
                }
                if Instant::now() + STARTUP_POLL_INTERVAL > deadline {
                    state.last_error = Some(format!(
                        "not healthy within {}s startup grace",
                        spec.start.startup_grace_seconds
                    ));
                    break;
                }
                tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            }

            if healthy {
                info!(provider = %spec.id, pid = ?child.id(), "backend is up");
                state.healthy = true;
                state.owned = true;
                state.process = Some(child);
                state.phase = LifecyclePhase::Up;
                state.last_health_at = Some(Utc::now());
                state.last_error = None;
                state.start_attempts = 0;
                return Ok(());
            }

            let _ = terminate_child(&mut child, STOP_GRACE, false).await;
        }

        state.phase = LifecyclePhase::Down;
        let reason = state
            .last_error
            .clone()
            .unwrap_or_else(|| "start attempt budget exhausted".to_string());
        Err(SupervisorError::StartFailed {
            provider: spec.id.clone(),
            reason,
        })
    }

    /// Stop an owned process. External processes are never stopped; for
    /// those this is a no-op. On return the provider is
    /// `healthy=false, owned=false` with no process handle.
    pub async fn ensure_down(&self, provider: &Provider) {
        let spec = &provider.spec;
        let mut state = provider.state.lock().await;
        if !state.owned {
            return;
        }
        state.phase = LifecyclePhase::Stopping;

        if spec.stop.method == StopMethod::HttpRequest {
            if let Some(http_stop) = &spec.stop.http {
                let url = crate::provider::join_url(&spec.base_url, &http_stop.path);
                let method = http_stop
                    .method
                    .parse::<reqwest::Method>()
                    .unwrap_or(reqwest::Method::POST);
                debug!(provider = %spec.id, %url, "sending HTTP shutdown request");
                let _ = self
                    .http
                    .request(method, url)
                    .timeout(Duration::from_millis(spec.health.timeout_ms))
                    .send()
                    .await;

                let deadline = Instant::now() + HTTP_STOP_WAIT;
                while Instant::now() < deadline {
                    if !self.probe_spec(spec).await {
                        break;
                    }
                    tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
                }
            }
        }

        if let Some(mut child) = state.process.take() {
            let force = spec.stop.method == StopMethod::KillProcess;
            match terminate_child(&mut child, STOP_GRACE, force).await {
                Ok(status) => debug!(provider = %spec.id, %status, "backend stopped"),
                Err(e) => warn!(provider = %spec.id, error = %e, "error stopping backend"),
            }
        }

        state.owned = false;
        state.healthy = false;
        state.phase = LifecyclePhase::Down;
        state.start_attempts = 0;
    }

    /// Stop every gateway-owned provider. Used on shutdown.
    pub async fn stop_all_owned(&self, providers: &ProviderSet) {
        for id in providers.ids() {
            if let Some(provider) = providers.get(id) {
                self.ensure_down(&provider).await;
            }
        }
    }

    async fn probe_spec(&self, spec: &ProviderSpec) -> bool {
        self.request_ok(
            &spec.health.method,
            &spec.health_url(),
            &spec.health.success_codes,
            Duration::from_millis(spec.health.timeout_ms),
        )
        .await
    }

    async fn detect_probe_ok(&self, spec: &ProviderSpec) -> bool {
        self.request_ok(
            &spec.health.method,
            &spec.detect_probe_url(),
            &spec.health.success_codes,
            Duration::from_millis(spec.health.timeout_ms),
        )
        .await
    }

    async fn request_ok(
        &self,
        method: &str,
        url: &str,
        success_codes: &[u16],
        timeout: Duration,
    ) -> bool {
        let method = method.parse::<reqwest::Method>().unwrap_or(reqwest::Method::GET);
        match self.http.request(method, url).timeout(timeout).send().await {
            Ok(resp) => success_codes.contains(&resp.status().as_u16()),
            Err(_) => false,
        }
    }
}

fn binary_on_path(spec: &ProviderSpec) -> bool {
    spec.binary
        .as_ref()
        .map(|name| which::which(name).is_ok())
        .unwrap_or(false)
}

/// Launch the configured backend command with the parent environment merged
/// with the provider's `env` map.
fn spawn_backend(spec: &ProviderSpec) -> Result<Child, String> {
    let command = spec
        .start
        .command
        .as_ref()
        .ok_or_else(|| "start.command is not configured".to_string())?;

    let mut cmd = Command::new(command);
    cmd.args(&spec.start.args)
        .envs(&spec.start.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.start.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn '{command}': {e}"))?;
    spawn_output_readers(&spec.id, &mut child);
    Ok(child)
}

/// Forward child stdout/stderr lines into the gateway's own log stream.
fn spawn_output_readers(provider_id: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let id = provider_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(provider = %id, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let id = provider_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(provider = %id, "{line}");
            }
        });
    }
}

/// Stop a child process, escalating from graceful termination to a forced
/// kill after the grace period. Always reaps the child.
async fn terminate_child(
    child: &mut Child,
    grace: Duration,
    force: bool,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        if !force {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) => {}
                    // Already gone; fall through to reaping
                    Err(nix::errno::Errno::ESRCH) => return child.wait().await,
                    Err(e) => return Err(std::io::Error::other(e)),
                }
                if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
                    return result;
                }
            }
        }
        child.kill().await?;
        child.wait().await
    }

    #[cfg(not(unix))]
    {
        let _ = (grace, force);
        child.kill().await?;
        child.wait().await
    }
}
