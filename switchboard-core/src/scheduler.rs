//! # Scheduler
//!
//! Owns the per-model FIFO queues, the active-model/active-provider pair,
//! and the global execution lock that enforces "one local job runs at a
//! time". The scheduling loop is a single cooperative task: it drains the
//! active model's queue completely, switches providers stop-before-start
//! when the next model lives elsewhere, and forwards each job under the
//! execution lock.
//!
//! Model switching is score-driven. When the active queue empties, the next
//! model is the non-empty queue maximizing
//!
//! ```text
//! score = base_priority - load_penalty - runtime_penalty
//!       + aging_bonus_per_second · age(oldest queued job)
//! ```
//!
//! with `always_run_last` models deferred until they are the only
//! candidates, ties broken by the older waiting job and then by
//! lexicographic model id. The aging term bounds starvation.
//!
//! Ordering guarantees: within a model, completions follow enqueue order;
//! across models, an already-chosen active model drains completely before a
//! switch, and jobs arriving for the active model run before the switch.

use crate::adapters::AdapterSet;
use crate::error::{ErrorKind, NormalizedError};
use crate::job::{CompletionHandle, Job, JobOutcome};
use crate::provider::ProviderSet;
use crate::supervisor::ProcessSupervisor;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-model scoring attributes, overridable in `models.yaml`.
///
/// Penalties are static constants in this revision; a measured or
/// time-decayed source can later feed the same struct without touching the
/// scheduling loop.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelSettings {
    #[serde(default)]
    pub base_priority: f64,
    #[serde(default)]
    pub load_penalty: f64,
    #[serde(default)]
    pub runtime_penalty: f64,
    /// Defer this model until it is the only one with queued work
    #[serde(default)]
    pub always_run_last: bool,
}

/// Default aging bonus: one priority point per 20 s of queue age.
pub const DEFAULT_AGING_BONUS_PER_SECOND: f64 = 0.05;

struct QueuedJob {
    job: Job,
    tx: oneshot::Sender<JobOutcome>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct SchedState {
    queues: HashMap<String, VecDeque<QueuedJob>>,
    active_model: Option<String>,
    active_provider: Option<String>,
    /// When the last job finished, for idle-shutdown bookkeeping
    last_active_at: Option<Instant>,
    stopping: bool,
}

impl SchedState {
    fn pending_anywhere(&self) -> bool {
        self.queues.values().any(|q| !q.is_empty())
    }
}

enum Pick {
    Stop,
    Job(QueuedJob),
    Idle { deadline: Option<Instant> },
}

/// The scheduler: queues, the single-flight lock, and the switching policy.
pub struct Scheduler {
    providers: Arc<ProviderSet>,
    supervisor: Arc<ProcessSupervisor>,
    adapters: Arc<AdapterSet>,
    model_settings: HashMap<String, ModelSettings>,
    aging_bonus_per_second: f64,
    state: Mutex<SchedState>,
    notify: Notify,
    /// The global execution lock: at most one adapter forward in flight
    exec_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(
        providers: Arc<ProviderSet>,
        supervisor: Arc<ProcessSupervisor>,
        adapters: Arc<AdapterSet>,
        model_settings: HashMap<String, ModelSettings>,
        aging_bonus_per_second: f64,
    ) -> Self {
        Self {
            providers,
            supervisor,
            adapters,
            model_settings,
            aging_bonus_per_second,
            state: Mutex::new(SchedState::default()),
            notify: Notify::new(),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Enqueue a job and return the handle its completion arrives on.
    pub fn submit(&self, job: Job) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            if state.stopping {
                let _ = tx.send(JobOutcome {
                    result: Err(NormalizedError::unreachable("gateway is shutting down")),
                    queue_wait_ms: 0,
                    runtime_ms: 0,
                });
                return rx;
            }
            debug!(job_id = %job.job_id, model = %job.model_id, "job queued");
            state
                .queues
                .entry(job.model_id.clone())
                .or_default()
                .push_back(QueuedJob {
                    job,
                    tx,
                    enqueued_at: Instant::now(),
                });
        }
        self.notify.notify_one();
        rx
    }

    /// Cancel a queued job (request-timeout path). A running job cannot be
    /// preempted; its caller discards the result instead. Returns whether a
    /// queued job was removed.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.lock_state();
        for queue in state.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|q| q.job.job_id == job_id) {
                if let Some(item) = queue.remove(pos) {
                    let wait = item.enqueued_at.elapsed().as_millis() as u64;
                    let _ = item.tx.send(JobOutcome {
                        result: Err(NormalizedError::timeout(
                            "request timed out while queued",
                        )),
                        queue_wait_ms: wait,
                        runtime_ms: 0,
                    });
                    return true;
                }
            }
        }
        false
    }

    /// Queue sizes and the active pair, for `/health`.
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        let state = self.lock_state();
        let queued: BTreeMap<String, usize> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(m, q)| (m.clone(), q.len()))
            .collect();
        QueueSnapshot {
            total_queued: queued.values().sum(),
            active_model: state.active_model.clone(),
            active_provider: state.active_provider.clone(),
            queued,
        }
    }

    /// Stop the loop and fail everything still queued.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.stopping = true;
        for (_, queue) in state.queues.drain() {
            for item in queue {
                let _ = item.tx.send(JobOutcome {
                    result: Err(NormalizedError::unreachable("gateway is shutting down")),
                    queue_wait_ms: item.enqueued_at.elapsed().as_millis() as u64,
                    runtime_ms: 0,
                });
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    /// The scheduling loop. Runs until `shutdown`.
    pub async fn run(self: Arc<Self>) {
        info!("scheduler loop started");
        loop {
            let notified = self.notify.notified();
            match self.pick_next() {
                Pick::Stop => break,
                Pick::Job(item) => self.process(item).await,
                Pick::Idle { deadline: None } => notified.await,
                Pick::Idle {
                    deadline: Some(deadline),
                } => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            self.idle_shutdown_check().await;
                        }
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pick_next(&self) -> Pick {
        let mut state = self.lock_state();
        if state.stopping {
            return Pick::Stop;
        }

        // An active model drains completely before any switch.
        if let Some(active) = state.active_model.clone() {
            if let Some(queue) = state.queues.get_mut(&active) {
                if let Some(item) = queue.pop_front() {
                    return Pick::Job(item);
                }
            }
            state.queues.remove(&active);
            state.active_model = None;
        }

        let now = Instant::now();
        let candidates: Vec<(String, Duration)> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(model, q)| {
                let age = q
                    .front()
                    .map(|item| now.duration_since(item.enqueued_at))
                    .unwrap_or_default();
                (model.clone(), age)
            })
            .collect();

        if let Some(model) =
            pick_next_model(&candidates, &self.model_settings, self.aging_bonus_per_second)
        {
            debug!(%model, "switching active model");
            state.active_model = Some(model.clone());
            if let Some(queue) = state.queues.get_mut(&model) {
                if let Some(item) = queue.pop_front() {
                    return Pick::Job(item);
                }
            }
        }

        Pick::Idle {
            deadline: self.idle_deadline(&state),
        }
    }

    /// When an owned provider sits idle with nothing queued anywhere, wake
    /// up at the moment its idle-shutdown interval expires.
    fn idle_deadline(&self, state: &SchedState) -> Option<Instant> {
        if state.pending_anywhere() {
            return None;
        }
        let provider_id = state.active_provider.as_ref()?;
        let provider = self.providers.get(provider_id)?;
        let policy = &provider.spec.policy;
        if policy.keep_warm {
            return None;
        }
        let idle = Duration::from_secs(policy.idle_shutdown_seconds?);
        Some(state.last_active_at? + idle)
    }

    async fn idle_shutdown_check(&self) {
        let target = {
            let state = self.lock_state();
            if state.stopping || state.pending_anywhere() {
                return;
            }
            match (&state.active_provider, state.last_active_at) {
                (Some(p), Some(last)) => (p.clone(), last),
                _ => return,
            }
        };
        let (provider_id, last_active) = target;
        let Some(provider) = self.providers.get(&provider_id) else {
            return;
        };
        let policy = &provider.spec.policy;
        if policy.keep_warm {
            return;
        }
        let Some(idle_secs) = policy.idle_shutdown_seconds else {
            return;
        };
        if last_active.elapsed() < Duration::from_secs(idle_secs) {
            return;
        }

        info!(provider = %provider_id, idle_seconds = idle_secs, "idle shutdown");
        self.supervisor.ensure_down(&provider).await;
        let mut state = self.lock_state();
        if state.active_provider.as_deref() == Some(provider_id.as_str())
            && !state.pending_anywhere()
        {
            state.active_provider = None;
        }
    }

    async fn process(&self, item: QueuedJob) {
        let QueuedJob {
            job,
            tx,
            enqueued_at,
        } = item;

        let Some(provider) = self.providers.get(&job.provider_id) else {
            let _ = tx.send(JobOutcome {
                result: Err(NormalizedError::not_found(format!(
                    "provider '{}' is not configured",
                    job.provider_id
                ))),
                queue_wait_ms: enqueued_at.elapsed().as_millis() as u64,
                runtime_ms: 0,
            });
            return;
        };

        // Provider switch: stop the resident backend before starting the
        // next one, so a single GPU is never asked to hold two models.
        let previous = self.lock_state().active_provider.clone();
        let switching = previous.as_deref() != Some(job.provider_id.as_str());
        if switching {
            if let Some(prev_id) = previous {
                if let Some(prev) = self.providers.get(&prev_id) {
                    info!(from = %prev_id, to = %job.provider_id, "provider switch");
                    self.supervisor.ensure_down(&prev).await;
                }
                self.lock_state().active_provider = None;
            }
        }

        // A crash between jobs surfaces as a health regression here and
        // forces a fresh ensure_up, within the start-attempt budget.
        let needs_up = switching || !provider.state.lock().await.healthy;
        if needs_up {
            if let Err(e) = self.supervisor.ensure_up(&provider).await {
                warn!(job_id = %job.job_id, error = %e, "provider start failed");
                self.lock_state().active_provider = None;
                let _ = tx.send(JobOutcome {
                    result: Err(NormalizedError::unreachable(e.to_string())),
                    queue_wait_ms: enqueued_at.elapsed().as_millis() as u64,
                    runtime_ms: 0,
                });
                return;
            }
        }

        {
            let mut state = self.lock_state();
            state.active_provider = Some(job.provider_id.clone());
            state.last_active_at = Some(Instant::now());
        }

        let queue_wait = enqueued_at.elapsed();
        let started = Instant::now();
        let result = {
            let _flight = self.exec_lock.lock().await;
            self.adapters
                .for_type(provider.spec.kind)
                .forward(&provider.spec, &job.model_id, &job.body)
                .await
        };
        let runtime = started.elapsed();

        {
            let mut pstate = provider.state.lock().await;
            pstate.last_used_at = Some(Utc::now());
            match &result {
                Ok(_) => {
                    pstate.healthy = true;
                    pstate.start_attempts = 0;
                }
                Err(e) if matches!(e.kind, ErrorKind::Unreachable | ErrorKind::Timeout) => {
                    // The backend went away under us; the failure counts
                    // toward the start budget of an owned provider.
                    pstate.healthy = false;
                    pstate.last_error = Some(e.message.clone());
                    if pstate.owned {
                        pstate.start_attempts = pstate.start_attempts.saturating_add(1);
                    }
                }
                Err(e) => {
                    pstate.last_error = Some(e.message.clone());
                }
            }
        }
        self.lock_state().last_active_at = Some(Instant::now());

        debug!(
            job_id = %job.job_id,
            model = %job.model_id,
            queue_wait_ms = queue_wait.as_millis() as u64,
            runtime_ms = runtime.as_millis() as u64,
            ok = result.is_ok(),
            "job finished"
        );
        let _ = tx.send(JobOutcome {
            result,
            queue_wait_ms: queue_wait.as_millis() as u64,
            runtime_ms: runtime.as_millis() as u64,
        });
    }
}

/// Queue-size summary served by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub active_model: Option<String>,
    pub active_provider: Option<String>,
    pub queued: BTreeMap<String, usize>,
    pub total_queued: usize,
}

/// Pick the next model among non-empty queues: defer `always_run_last`
/// models until they are the only candidates, then take the best score,
/// breaking ties by the older waiting job and then by lexicographic id.
fn pick_next_model(
    candidates: &[(String, Duration)],
    settings: &HashMap<String, ModelSettings>,
    aging_bonus_per_second: f64,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let run_last = |model: &str| {
        settings
            .get(model)
            .map(|s| s.always_run_last)
            .unwrap_or(false)
    };
    let eligible: Vec<&(String, Duration)> = {
        let regular: Vec<_> = candidates.iter().filter(|(m, _)| !run_last(m)).collect();
        if regular.is_empty() {
            candidates.iter().collect()
        } else {
            regular
        }
    };

    let score = |model: &str, age: &Duration| {
        let s = settings.get(model).cloned().unwrap_or_default();
        s.base_priority - s.load_penalty - s.runtime_penalty
            + aging_bonus_per_second * age.as_secs_f64()
    };

    eligible
        .into_iter()
        .max_by(|(am, aa), (bm, ba)| {
            score(am, aa)
                .partial_cmp(&score(bm, ba))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| aa.cmp(ba))
                // smaller id wins the final tie, so reverse for max_by
                .then_with(|| bm.cmp(am))
        })
        .map(|(model, _)| model.clone())
}
