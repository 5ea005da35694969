//! Prompt token accounting with a cl100k-compatible BPE tokenizer.

use anyhow::{Context, Result};
use tiktoken_rs::CoreBPE;

use crate::ai::ChatMessage;

/// Counts prompt tokens the way the completion provider will.
///
/// Construction loads the BPE ranks and is fallible; the tokenizer is a
/// process-level dependency, so binaries call [`TokenCounter::new`] once
/// at startup and treat failure as fatal.
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl TokenCounter {
    /// Load the cl100k tokenizer.
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().context("load cl100k tokenizer")?;
        Ok(Self { bpe })
    }

    /// Count tokens across message content and tool-call arguments.
    /// Both consume context window.
    #[must_use]
    pub fn count(&self, messages: &[ChatMessage]) -> usize {
        let mut tokens = 0;
        for msg in messages {
            tokens += self.bpe.encode_with_special_tokens(&msg.content).len();
            for call in &msg.tool_calls {
                tokens += self.bpe.encode_with_special_tokens(&call.arguments).len();
            }
        }
        tokens
    }

    /// Count tokens in a single text.
    #[must_use]
    pub fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Truncate a text to at most `max_tokens` tokens, decoding the kept
    /// prefix back to a string. Used to respect the embedding model's
    /// input limit.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> Result<String> {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return Ok(text.to_string());
        }
        self.bpe
            .decode(tokens[..max_tokens].to_vec())
            .map_err(|e| anyhow::anyhow!("decode truncated text: {e}"))
    }
}
