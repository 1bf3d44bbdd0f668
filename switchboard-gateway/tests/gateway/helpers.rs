// Shared test scaffolding: config construction and mock backends.

use axum_test::TestServer;
use serde_json::json;
use std::collections::HashMap;
use switchboard_core::provider::ProviderSpec;
use switchboard_core::router::RouteSpec;
use switchboard_gateway::config::{
    GatewayConfig, LoggingConfig, RegistryConfig, RoutingConfig, SchedulerConfig, ServerConfig,
};
use switchboard_gateway::server::{create_server, AppState};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub struct TestGateway {
    pub server: TestServer,
    pub state: AppState,
    // Keeps the request-log directory alive for the test's duration
    _log_dir: tempfile::TempDir,
}

/// Build a gateway around the given providers and routes, with a short
/// request timeout suitable for tests.
pub async fn gateway(
    providers: Vec<ProviderSpec>,
    routes: HashMap<String, RouteSpec>,
) -> TestGateway {
    gateway_with_timeout(providers, routes, 15).await
}

pub async fn gateway_with_timeout(
    providers: Vec<ProviderSpec>,
    routes: HashMap<String, RouteSpec>,
    request_timeout_seconds: u64,
) -> TestGateway {
    let log_dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        server: ServerConfig {
            request_timeout_seconds,
            ..Default::default()
        },
        scheduler: SchedulerConfig::default(),
        registry: RegistryConfig::default(),
        routing: RoutingConfig::default(),
        logging: LoggingConfig {
            dir: log_dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        },
        providers,
        routes,
        models: HashMap::new(),
    };
    let (app, state) = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();
    TestGateway {
        server,
        state,
        _log_dir: log_dir,
    }
}

pub fn spec_yaml(yaml: &str) -> ProviderSpec {
    serde_yaml::from_str(yaml).unwrap()
}

/// A base URL nothing listens on.
pub fn unreachable_base() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

/// Startable on paper, but the command exits immediately and health never
/// comes up: every use ends in `unreachable`, quickly.
pub fn dead_local_provider(id: &str, model: &str) -> ProviderSpec {
    spec_yaml(&format!(
        "id: {id}\ntype: openai_compat\nbase_url: {}\ndetect: none\nstart:\n  enabled: true\n  command: \"true\"\n  startup_grace_seconds: 1\npolicy:\n  max_start_attempts: 1\nlisting:\n  declared_models: [{model}]\n",
        unreachable_base()
    ))
}

/// A healthy OpenAI-compatible mock backend serving one model.
pub async fn healthy_provider(id: &str, model: &str) -> (MockServer, ProviderSpec) {
    healthy_provider_with_delay(id, model, 0).await
}

pub async fn healthy_provider_with_delay(
    id: &str,
    model: &str,
    delay_ms: u64,
) -> (MockServer, ProviderSpec) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list", "data": [{"id": model}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "id": "chatcmpl-mock",
                    "object": "chat.completion",
                    "created": 0,
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "mock reply"},
                        "finish_reason": "stop",
                    }],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
                }))
                .set_delay(std::time::Duration::from_millis(delay_ms)),
        )
        .mount(&server)
        .await;

    let spec = spec_yaml(&format!(
        "id: {id}\ntype: openai_compat\nbase_url: {}\ndetect: none\n",
        server.uri()
    ));
    (server, spec)
}

pub fn chat_body(model: &str) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello"}],
    })
}

pub fn route(
    primary: &str,
    fallbacks: &[&str],
    fallback_on: &[switchboard_core::ErrorKind],
) -> RouteSpec {
    RouteSpec {
        primary_model: primary.to_string(),
        fallback_models: fallbacks.iter().map(|s| s.to_string()).collect(),
        fallback_on: fallback_on.to_vec(),
    }
}
