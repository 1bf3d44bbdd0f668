//! OpenAI-compatible adapter: passthrough to any backend speaking the
//! OpenAI HTTP surface (LM Studio, llama.cpp server, vLLM, cloud services).
//!
//! The request body is forwarded unchanged apart from `model`, which is
//! rewritten to the resolved id so that fallback attempts re-target the same
//! body. The 2xx response is returned verbatim.

use super::{Adapter, BackendHttp};
use crate::error::NormalizedError;
use crate::provider::{join_url, ProviderSpec, ProviderType};
use serde_json::Value;

pub struct OpenAiCompatAdapter {
    http: BackendHttp,
}

impl OpenAiCompatAdapter {
    pub fn new(http: BackendHttp) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl Adapter for OpenAiCompatAdapter {
    fn kind(&self) -> ProviderType {
        ProviderType::OpenaiCompat
    }

    async fn forward(
        &self,
        spec: &ProviderSpec,
        model: &str,
        body: &Value,
    ) -> Result<Value, NormalizedError> {
        let mut forwarded = body.clone();
        if let Some(obj) = forwarded.as_object_mut() {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
        let url = join_url(&spec.base_url, "/v1/chat/completions");
        let bearer = spec.resolve_api_key();
        self.http
            .post_json(&url, bearer.as_deref(), &forwarded)
            .await
    }

    async fn list_models(&self, spec: &ProviderSpec) -> Result<Vec<String>, NormalizedError> {
        let url = join_url(&spec.base_url, &spec.listing_path());
        let bearer = spec.resolve_api_key();
        let listing = self.http.get_json(&url, bearer.as_deref()).await?;
        let ids = listing["data"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e["id"].as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}
