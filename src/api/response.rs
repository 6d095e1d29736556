//! Provider-facing response structures

use serde::{Deserialize, Serialize};

/// Reply from a single provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    /// The generated content
    pub content: String,

    /// Token usage as reported by the provider, if it reported any
    pub usage: Option<TokenUsage>,

    /// Model name echoed back by the provider
    pub model: String,

    /// Whether the response was truncated
    pub truncated: bool,
}

impl ProviderReply {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
            model: model.into(),
            truncated: false,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub input_tokens: u32,
    /// Tokens in the response
    pub output_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }
}
