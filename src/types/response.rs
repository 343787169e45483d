//! Response types and shared usage/metadata primitives.

use serde::{Deserialize, Serialize};

/// Token accounting reported by the backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Per-dispatch attribution attached to every response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Id of the service that produced the response (or that originally
    /// produced it, for cache hits).
    pub service_id: String,
    pub duration_ms: u64,
    /// True when the response was served from the orchestrator cache.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Backend-reported cost for this call, in the provider's currency.
    #[serde(default)]
    pub cost: f64,
}

/// Result of a text generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateTextResponse {
    pub id: String,
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

/// Result of a topic extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateTopicsResponse {
    pub topics: Vec<String>,
    pub model: String,
    pub usage: TokenUsage,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

/// Result of a content optimization call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeContentResponse {
    pub optimized_content: String,
    pub improvements: Vec<String>,
    /// Quality score in `0.0..=100.0` as judged by the backend.
    pub score: f64,
    pub usage: TokenUsage,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

/// One message of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "user", "assistant" or "system".
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Result of a conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    /// Transcript as maintained by the backend, including this turn.
    pub messages: Vec<ChatMessage>,
    pub usage: TokenUsage,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}
