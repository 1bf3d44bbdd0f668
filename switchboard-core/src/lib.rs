//! # Switchboard Core
//!
//! The engine behind the Switchboard gateway: everything between an
//! already-validated chat-completion request and the backend that serves it.
//!
//! ## Subsystems
//!
//! - [`provider`] - the provider model: declarative specs from
//!   `providers/*.yaml` plus mutex-guarded runtime state.
//! - [`supervisor`] - process lifecycle: health probing, start with a grace
//!   interval and an attempt budget, stop with graceful-to-forced
//!   escalation, detection.
//! - [`registry`] - the model→provider mapping, rebuilt on demand behind a
//!   cooldown, published as immutable snapshots.
//! - [`adapters`] - per-provider-type translation between the OpenAI wire
//!   shape and the backend's native shape, plus normalized error
//!   classification.
//! - [`scheduler`] - per-model FIFO queues, the global single-flight
//!   execution lock, score-driven model switching, idle shutdown.
//! - [`router`] - `route:<name>` alias resolution and the fallback cascade.
//!
//! One request flows router → scheduler → supervisor (on a provider switch)
//! → adapter, and the classified outcome flows back the same way. At most
//! one adapter forward is ever in flight: a single host serves one local
//! model at a time.

pub mod adapters;
pub mod error;
pub mod job;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod supervisor;

pub use adapters::{Adapter, AdapterSet};
pub use error::{CoreError, ErrorKind, NormalizedError};
pub use job::{AttemptRecord, CompletionHandle, Job, JobOutcome, JobStatus};
pub use openai::{ChatRequest, ChatResponse, Message, ModelList, Role};
pub use provider::{Provider, ProviderSet, ProviderSpec, ProviderStatus, ProviderType};
pub use registry::{Registry, RegistrySnapshot, RegistrySummary};
pub use router::{RouteSpec, Router, RouterReply, ROUTE_PREFIX};
pub use scheduler::{ModelSettings, QueueSnapshot, Scheduler, DEFAULT_AGING_BONUS_PER_SECOND};
pub use supervisor::{ProcessSupervisor, SupervisorError};
