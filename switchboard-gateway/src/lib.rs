//! # Switchboard Gateway
//!
//! The HTTP face of Switchboard: one OpenAI-compatible front door for the
//! local inference backends a single host runs. Clients name a model id or
//! a `route:<name>` alias; the engine in `switchboard-core` brings the right
//! backend up, runs one local model at a time, and falls back across route
//! alternates on classified failures.
//!
//! This crate owns what the core deliberately does not: YAML configuration
//! loading, the axum server and its handlers, the HTTP error mapping, and
//! the JSON-lines request log.

pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod request_log;
pub mod server;
