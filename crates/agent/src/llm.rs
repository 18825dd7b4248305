use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagewise_core::domain::routing::Domain;
use stagewise_core::models::ModelRole;

/// Error-chain fragments that mean the backend could not be reached at all,
/// as opposed to answering badly.
const UNAVAILABLE_SIGNATURES: [&str; 14] = [
    "timeout",
    "timed out",
    "network",
    "connection",
    "connect error",
    "econnrefused",
    "econnreset",
    "enotfound",
    "etimedout",
    "fetch failed",
    "socket hang up",
    "unavailable",
    "aborted",
    "dns",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatOptions {
    /// Resolved model id; `None` lets the backend pick its default.
    pub model: Option<String>,
    pub domain: Option<Domain>,
    pub pipeline_id: String,
    pub trace_id: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }
}

#[async_trait]
pub trait ModelChat: Send + Sync {
    async fn chat(
        &self,
        role: ModelRole,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse>;
}

pub fn is_model_unavailable(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        let text = cause.to_string().to_ascii_lowercase();
        UNAVAILABLE_SIGNATURES.iter().any(|signature| text.contains(signature))
    })
}
