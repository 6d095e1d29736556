//! Routing response envelope

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token breakdown for one routed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    /// True when counts were estimated because the provider reported none
    pub estimated: bool,
}

/// Result of a successful `route` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResponse {
    pub request_id: Uuid,
    pub content: String,
    pub model_id: String,
    pub provider: String,
    /// Served from the response cache without a provider call
    pub cached: bool,
    pub tokens: TokenBreakdown,
    /// USD; zero for cache hits
    pub cost: f64,
    /// End-to-end latency including retries and backoff
    pub latency_ms: u64,
    /// Failed attempts before the successful one
    pub retries: u32,
    pub fallback_used: bool,
    /// Human-readable account of how the model was chosen. Not machine-parsed.
    pub explanation: String,
}

/// What the cache stores for a routed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CachedCompletion {
    pub content: String,
    pub model_id: String,
    pub provider: String,
}
