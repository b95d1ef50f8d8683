//! Core traits for generation backends.
//!
//! The `GenerationBackend` trait abstracts over chat-completion
//! providers. Sessions only ever consume the streaming path; the
//! non-streaming call exists for auxiliary one-shot work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

/// Error types for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Backend is not available
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Request failed
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Rate limited by the provider
    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Content was filtered by the provider
    #[error("content filtered: {reason}")]
    ContentFiltered { reason: String },

    /// Network error
    #[error("network error: {0}")]
    Network(String),

    /// Response could not be parsed
    #[error("parse error: {0}")]
    Parse(String),
}

/// A chat-completion provider.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Backend identifier (model name).
    fn id(&self) -> &str;

    /// Whether the backend can currently serve requests.
    async fn is_available(&self) -> bool;

    /// Generate a completion without streaming.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, BackendError>;

    /// Generate a streaming completion.
    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<crate::stream::TokenStream, BackendError>;

    fn capabilities(&self) -> &ModelCapabilities;
}

/// Request for a completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct CompletionRequest {
    /// System prompt (optional)
    pub system_prompt: Option<String>,
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature (0.0-2.0)
    pub temperature: Option<f32>,
    /// Sequences that stop generation
    pub stop_sequences: Vec<String>,
}

impl CompletionRequest {
    /// Create a request from a conversation transcript.
    pub fn from_messages(messages: impl Into<Vec<Message>>) -> Self {
        Self {
            messages: messages.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp.clamp(0.0, 2.0));
        self
    }
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Response from a non-streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop (end of response or stop sequence)
    Stop,
    /// Hit max tokens limit
    Length,
    /// Content was filtered by the provider
    ContentFilter,
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Capabilities of a model/backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            context_window: 4096,
            max_output_tokens: 1024,
            supports_streaming: false,
        }
    }
}
