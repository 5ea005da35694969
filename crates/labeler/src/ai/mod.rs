//! Model integration: provider abstraction and the OpenAI implementation.

pub mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, ChatRole, CompletionProvider,
    EmbeddingProvider, ErrorClass, ProviderError, TokenUsage, ToolCall, ToolDefinition,
};
