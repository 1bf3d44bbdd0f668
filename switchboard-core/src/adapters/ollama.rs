//! Ollama adapter: translates between the OpenAI chat-completion shape and
//! the native Ollama `/api/chat` API.
//!
//! Request translation copies `model` and `messages` as-is, forces
//! `stream=false`, and maps sampling parameters into Ollama's `options`
//! object (`max_tokens` becomes `options.num_predict`). Response translation
//! rebuilds an OpenAI chat-completion object around the assistant content,
//! mapping `done_reason` to `finish_reason` best-effort and the eval
//! counters to usage fields when present.

use super::{Adapter, BackendHttp};
use crate::error::NormalizedError;
use crate::provider::{join_url, ProviderSpec, ProviderType};
use serde_json::{json, Value};

pub struct OllamaAdapter {
    http: BackendHttp,
}

impl OllamaAdapter {
    pub fn new(http: BackendHttp) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl Adapter for OllamaAdapter {
    fn kind(&self) -> ProviderType {
        ProviderType::Ollama
    }

    async fn forward(
        &self,
        spec: &ProviderSpec,
        model: &str,
        body: &Value,
    ) -> Result<Value, NormalizedError> {
        let native_request = to_native_request(model, body);
        let url = join_url(&spec.base_url, "/api/chat");
        let native_response = self.http.post_json(&url, None, &native_request).await?;
        Ok(from_native_response(model, &native_response))
    }

    async fn list_models(&self, spec: &ProviderSpec) -> Result<Vec<String>, NormalizedError> {
        let url = join_url(&spec.base_url, &spec.listing_path());
        let tags = self.http.get_json(&url, None).await?;
        let names = tags["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

/// Build the native `/api/chat` request from an OpenAI-shaped body.
pub(crate) fn to_native_request(model: &str, body: &Value) -> Value {
    let mut native = json!({
        "model": model,
        "messages": body.get("messages").cloned().unwrap_or_else(|| json!([])),
        "stream": false,
    });

    let mut options = serde_json::Map::new();
    if let Some(t) = body.get("temperature").and_then(Value::as_f64) {
        options.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = body.get("top_p").and_then(Value::as_f64) {
        options.insert("top_p".to_string(), json!(p));
    }
    if let Some(n) = body.get("max_tokens").and_then(Value::as_u64) {
        options.insert("num_predict".to_string(), json!(n));
    }
    if !options.is_empty() {
        native["options"] = Value::Object(options);
    }
    native
}

/// Rebuild an OpenAI chat-completion object from the native response.
pub(crate) fn from_native_response(model: &str, native: &Value) -> Value {
    let content = native["message"]["content"].as_str().unwrap_or("");
    let finish_reason = map_done_reason(native["done_reason"].as_str());

    let mut response = json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": content,
            },
            "finish_reason": finish_reason,
        }],
    });

    let prompt = native["prompt_eval_count"].as_u64();
    let completion = native["eval_count"].as_u64();
    if prompt.is_some() || completion.is_some() {
        let prompt = prompt.unwrap_or(0);
        let completion = completion.unwrap_or(0);
        response["usage"] = json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        });
    }
    response
}

fn map_done_reason(done_reason: Option<&str>) -> &'static str {
    match done_reason {
        Some("length") => "length",
        // "stop", "load", unknown values, and an absent field all report
        // the literal "stop"
        _ => "stop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn request_translation_maps_sampling_options() {
        let body = json!({
            "model": "route:fast",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "top_p": 0.9,
            "max_tokens": 64,
        });
        let native = to_native_request("llama3:8b", &body);
        assert_eq!(native["model"], "llama3:8b");
        assert_eq!(native["stream"], false);
        assert_eq!(native["messages"][0]["content"], "hi");
        assert_eq!(native["options"]["temperature"], json!(0.2));
        assert_eq!(native["options"]["top_p"], json!(0.9));
        assert_eq!(native["options"]["num_predict"], json!(64));
    }

    #[test]
    fn request_translation_omits_absent_options() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let native = to_native_request("m", &body);
        assert!(native.get("options").is_none());
    }

    #[test]
    fn response_translation_builds_assistant_choice() {
        let native = json!({
            "message": {"role": "assistant", "content": "hello there"},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 12,
            "eval_count": 7,
        });
        let resp = from_native_response("llama3:8b", &native);
        assert_eq!(resp["object"], "chat.completion");
        assert_eq!(resp["choices"][0]["message"]["role"], "assistant");
        assert_eq!(resp["choices"][0]["message"]["content"], "hello there");
        assert_eq!(resp["choices"][0]["finish_reason"], "stop");
        assert_eq!(resp["usage"]["prompt_tokens"], 12);
        assert_eq!(resp["usage"]["completion_tokens"], 7);
        assert_eq!(resp["usage"]["total_tokens"], 19);
    }

    #[test]
    fn response_translation_without_counters_omits_usage() {
        let native = json!({"message": {"content": "ok"}, "done": true});
        let resp = from_native_response("m", &native);
        assert!(resp.get("usage").is_none());
        assert_eq!(resp["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn done_reason_length_is_preserved() {
        let native = json!({
            "message": {"content": "truncated"},
            "done_reason": "length",
        });
        let resp = from_native_response("m", &native);
        assert_eq!(resp["choices"][0]["finish_reason"], "length");
    }

    fn test_spec(base_url: &str) -> ProviderSpec {
        serde_yaml::from_str(&format!(
            "id: ollama\ntype: ollama\nbase_url: {base_url}\n"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn forward_posts_native_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "llama3", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "pong"},
                "done": true,
                "done_reason": "stop",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = OllamaAdapter::new(
            BackendHttp::new(std::time::Duration::from_secs(5)).unwrap(),
        );
        let body = json!({"model": "llama3", "messages": [{"role": "user", "content": "ping"}]});
        let resp = adapter
            .forward(&test_spec(&server.uri()), "llama3", &body)
            .await
            .unwrap();
        assert_eq!(resp["choices"][0]["message"]["content"], "pong");
    }

    #[tokio::test]
    async fn list_models_parses_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3:8b"}, {"name": "qwen2:7b"}]
            })))
            .mount(&server)
            .await;

        let adapter = OllamaAdapter::new(
            BackendHttp::new(std::time::Duration::from_secs(5)).unwrap(),
        );
        let models = adapter.list_models(&test_spec(&server.uri())).await.unwrap();
        assert_eq!(models, vec!["llama3:8b", "qwen2:7b"]);
    }
}
