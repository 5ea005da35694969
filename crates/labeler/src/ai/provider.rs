//! Completion and embedding provider traits and common types.
//!
//! Defines the interface the inference pipeline talks to, plus a typed
//! provider error that exposes its retry classification so the retry
//! policy does not depend on any one provider's concrete error shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System message (sets context/behavior)
    System,
    /// User message (input)
    User,
    /// Assistant message (model response)
    Assistant,
}

/// A message in a conversation with a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: ChatRole,
    /// Content of the message
    pub content: String,
    /// Tool calls attached to the message, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// A structured function call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call ID
    pub id: String,
    /// Function name
    pub name: String,
    /// JSON-encoded function arguments
    pub arguments: String,
}

/// A function the model may call, described by a JSON schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Function name
    pub name: String,
    /// What the function does
    pub description: String,
    /// JSON schema of the parameters
    pub parameters: serde_json::Value,
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier
    pub model: String,
    /// Ordered prompt messages
    pub messages: Vec<ChatMessage>,
    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature
    pub temperature: f32,
    /// Request token-level log-probabilities
    pub logprobs: bool,
}

/// Token usage reported by a completion response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of prompt tokens
    pub prompt_tokens: u32,
    /// Number of completion tokens
    pub completion_tokens: u32,
    /// Total tokens (prompt + completion)
    pub total_tokens: u32,
}

/// One completion choice.
#[derive(Debug, Clone)]
pub struct ChatChoice {
    /// The generated message
    pub message: ChatMessage,
    /// Why generation stopped
    pub finish_reason: Option<String>,
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Completion choices (the pipeline expects exactly one)
    pub choices: Vec<ChatChoice>,
    /// Token usage for cost accounting
    pub usage: TokenUsage,
    /// Model that generated the response
    pub model: String,
}

/// Retry classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Server overload or rate limiting; expected to succeed on retry
    Transient,
    /// The request itself was rejected; retrying is pointless
    Client,
    /// Transport or decode failure of unknown cause
    Unknown,
}

/// Error returned by completion and embedding providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success status.
    #[error("provider API error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error message from the provider, or the raw body
        message: String,
    },

    /// The request never produced a usable response.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered 2xx but the body did not decode.
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Classify the error for retry purposes. Only HTTP 5xx and 429
    /// responses are worth retrying.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Api { status, .. } => {
                if *status >= 500 || *status == 429 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Client
                }
            }
            Self::Http(_) | Self::Malformed(_) => ErrorClass::Unknown,
        }
    }
}

/// Trait for chat completion providers.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Get the provider name (e.g., "openai").
    fn name(&self) -> &'static str;

    /// Run a chat completion.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Trait for text embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text into a vector of the requested dimensionality.
    async fn embed(&self, text: &str, dimensions: u32) -> Result<Vec<f64>, ProviderError>;
}
