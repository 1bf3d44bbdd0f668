//! # Provider Adapters
//!
//! Per-provider-type translation between the OpenAI wire shape and a
//! backend's native shape. Adapters are the only components that touch a
//! backend's HTTP surface, and they are stateless beyond a shared HTTP
//! client: the same adapter instance serves every provider of its type.
//!
//! Two variants sit behind the common [`Adapter`] trait:
//!
//! - [`openai_compat::OpenAiCompatAdapter`] forwards the request body
//!   unchanged and returns the backend response verbatim;
//! - [`ollama::OllamaAdapter`] translates to and from the native Ollama
//!   chat API.
//!
//! Error normalization lives here too: [`classify_transport`] and
//! [`classify_http`] form a total pure function from (status, body excerpt,
//! transport error kind) to the normalized taxonomy. Every input maps to
//! exactly one kind; the decision uses nothing but the response itself.

use crate::error::{CoreError, ErrorKind, NormalizedError};
use crate::provider::{ProviderSpec, ProviderType};
use serde_json::Value;
use std::time::Duration;

pub mod http;
pub mod ollama;
pub mod openai_compat;

pub use http::BackendHttp;

/// Common interface of the two adapter variants.
///
/// `forward` takes the resolved model id separately from the body because a
/// fallback attempt re-targets the same body at a different model.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// The provider type this adapter serves.
    fn kind(&self) -> ProviderType;

    /// Forward one chat completion and return the OpenAI-shaped response.
    async fn forward(
        &self,
        spec: &ProviderSpec,
        model: &str,
        body: &Value,
    ) -> Result<Value, NormalizedError>;

    /// List the model ids this provider serves, in its native shape.
    async fn list_models(&self, spec: &ProviderSpec) -> Result<Vec<String>, NormalizedError>;
}

/// The two adapter instances, built once with the request timeout and shared
/// by the scheduler and the registry.
pub struct AdapterSet {
    ollama: ollama::OllamaAdapter,
    openai_compat: openai_compat::OpenAiCompatAdapter,
}

impl AdapterSet {
    pub fn new(request_timeout: Duration) -> Result<Self, CoreError> {
        let http = BackendHttp::new(request_timeout)?;
        Ok(Self {
            ollama: ollama::OllamaAdapter::new(http.clone()),
            openai_compat: openai_compat::OpenAiCompatAdapter::new(http),
        })
    }

    pub fn for_type(&self, kind: ProviderType) -> &dyn Adapter {
        match kind {
            ProviderType::Ollama => &self.ollama,
            ProviderType::OpenaiCompat => &self.openai_compat,
        }
    }
}

/// Classify a transport-level failure.
///
/// Connection refused, DNS, and socket errors are `unreachable`; an elapsed
/// client timeout is `timeout`; anything else is `other`.
pub fn classify_transport(err: &reqwest::Error) -> NormalizedError {
    if err.is_timeout() {
        NormalizedError::new(ErrorKind::Timeout, format!("request timed out: {err}"))
    } else if err.is_connect() {
        NormalizedError::new(ErrorKind::Unreachable, format!("backend unreachable: {err}"))
    } else {
        NormalizedError::new(ErrorKind::Other, format!("transport error: {err}"))
    }
}

/// Classify a non-2xx HTTP response from a backend.
///
/// 5xx bodies mentioning an out-of-memory condition map to `oom`; 4xx bodies
/// indicating the prompt exceeds the model context map to `context_length`;
/// everything else is `other`. Total over all inputs.
pub fn classify_http(status: u16, body: &str) -> NormalizedError {
    let excerpt: String = body.chars().take(300).collect();
    let lowered = excerpt.to_lowercase();

    if (500..600).contains(&status) && mentions_oom(&lowered) {
        return NormalizedError::new(
            ErrorKind::Oom,
            format!("backend out of memory (HTTP {status}): {excerpt}"),
        );
    }
    if (400..500).contains(&status) && mentions_context_overflow(&lowered) {
        return NormalizedError::new(
            ErrorKind::ContextLength,
            format!("prompt exceeds model context (HTTP {status}): {excerpt}"),
        );
    }
    NormalizedError::new(
        ErrorKind::Other,
        format!("backend returned HTTP {status}: {excerpt}"),
    )
}

fn mentions_oom(body: &str) -> bool {
    body.contains("out of memory")
        || body.contains("oom")
        || body.contains("insufficient memory")
        || body.contains("cuda error: out of memory")
}

fn mentions_context_overflow(body: &str) -> bool {
    body.contains("context length")
        || body.contains("context window")
        || body.contains("maximum context")
        || body.contains("too many tokens")
        || body.contains("exceeds the context")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_only_on_5xx() {
        assert_eq!(classify_http(500, "CUDA out of memory").kind, ErrorKind::Oom);
        assert_eq!(classify_http(503, "server OOM killed").kind, ErrorKind::Oom);
        // A 4xx mentioning memory is not an OOM
        assert_eq!(classify_http(400, "out of memory").kind, ErrorKind::Other);
    }

    #[test]
    fn context_overflow_only_on_4xx() {
        assert_eq!(
            classify_http(400, "this model's maximum context length is 8192 tokens").kind,
            ErrorKind::ContextLength
        );
        assert_eq!(
            classify_http(413, "prompt exceeds the context window").kind,
            ErrorKind::ContextLength
        );
        assert_eq!(
            classify_http(500, "context length exceeded").kind,
            ErrorKind::Other
        );
    }

    #[test]
    fn everything_else_is_other() {
        assert_eq!(classify_http(404, "no such model").kind, ErrorKind::Other);
        assert_eq!(classify_http(502, "bad gateway").kind, ErrorKind::Other);
        assert_eq!(classify_http(200, "").kind, ErrorKind::Other);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(10_000);
        let err = classify_http(500, &body);
        assert!(err.message.len() < 400);
    }
}
