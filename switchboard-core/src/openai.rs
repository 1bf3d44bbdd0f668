//! # OpenAI Wire Types
//!
//! The request and response shapes of the OpenAI chat-completion API, as the
//! gateway presents them to clients and as the adapters translate them for
//! backends. Only the surface this gateway serves is modeled: chat
//! completions and the model list. Streaming, embeddings, and tool calling
//! are out of scope and their fields are not carried.
//!
//! Optional request fields use `skip_serializing_if` so a forwarded body
//! never grows `null` members a backend might reject.

use serde::{Deserialize, Serialize};

/// Chat completion request, validated from the client body.
///
/// The gateway keeps the raw JSON body alongside this parsed form; the
/// `openai_compat` adapter forwards the raw body, while the `ollama` adapter
/// reads the typed fields it needs for translation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Concrete model id or `route:<name>` alias
    pub model: String,
    /// Conversation messages, oldest first
    pub messages: Vec<Message>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Streaming flag; the gateway refuses `true` with 501
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Caller identifier, passed through for accounting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }
}

/// Message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Chat completion response in the OpenAI shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response shape of `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    /// Build the list from model ids. Provider ids never leak: `owned_by` is
    /// always the gateway's own identifier.
    pub fn from_ids(ids: impl IntoIterator<Item = String>, owned_by: &str, created: u64) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model".to_string(),
                    created,
                    owned_by: owned_by.to_string(),
                })
                .collect(),
        }
    }
}

/// One entry of the model list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}
