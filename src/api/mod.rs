//! Provider backend abstraction
//!
//! The router never talks HTTP directly. Each provider is reached through a
//! [`ModelBackend`], registered by provider name in a [`BackendRegistry`].

mod client;
mod request;
mod response;

pub use client::{HttpBackend, ProviderEndpoint};
pub use request::{Message, Payload, ProviderRequest, Role};
pub use response::{ProviderReply, TokenUsage};

use crate::catalog::Model;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Rate limit exceeded for model {model}")]
    RateLimitExceeded { model: String },

    #[error("No backend registered for provider '{0}'")]
    NotConfigured(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl ProviderError {
    /// Whether another attempt against the same model could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::RateLimitExceeded { .. } | ProviderError::NotConfigured(_)
        )
    }
}

/// Wire dialect spoken by an HTTP provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    /// OpenAI-compatible `/chat/completions`
    OpenAI,
    /// Anthropic `/messages`
    Anthropic,
}

/// Trait for provider backends
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Execute one call against `model`
    async fn invoke(
        &self,
        model: &Model,
        request: &ProviderRequest,
    ) -> Result<ProviderReply, ProviderError>;

    /// Lightweight liveness check used by the background health probe
    async fn health_check(&self, model: &Model) -> Result<(), ProviderError>;

    /// Provider name this backend serves (matches `Model::provider`)
    fn provider(&self) -> &str;
}

/// Backends keyed by provider name
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.provider().to_string(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn ModelBackend>, ProviderError> {
        self.backends
            .get(provider)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<&str> {
        self.backends.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
