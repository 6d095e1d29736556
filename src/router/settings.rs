//! Runtime-replaceable router settings

use super::rules::RoutingRule;
use super::strategy::{LoadBalancingStrategy, ScoreWeights};
use super::OperationKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// What to do when a budget is set but a model's cost cannot be computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCostPolicy {
    #[default]
    Reject,
    Allow,
}

/// Token counts priced to compare models against a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceWorkload {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl Default for ReferenceWorkload {
    fn default() -> Self {
        Self {
            input_tokens: 1000,
            output_tokens: 500,
        }
    }
}

/// Attempts and backoff for calls against one model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts against the primary model, including the first
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub multiplier: f64,
    /// Per-call timeout; an expired call counts as a failure
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            multiplier: 2.0,
            call_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): `base * multiplier^attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(16) as i32);
        Duration::from_millis((self.base_backoff_ms as f64 * factor) as u64)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Cache lifetime per operation kind, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    pub chat: u64,
    pub completion: u64,
    pub analysis: u64,
    pub creative: u64,
    pub code: u64,
    pub reasoning: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            chat: 300,
            completion: 600,
            analysis: 3600,
            creative: 300,
            code: 1800,
            reasoning: 1800,
        }
    }
}

impl CacheTtls {
    /// TTL for `operation`; `None` for operations that are never cached
    pub fn ttl_for(&self, operation: OperationKind) -> Option<Duration> {
        let secs = match operation {
            OperationKind::Chat => self.chat,
            OperationKind::Completion => self.completion,
            OperationKind::Analysis => self.analysis,
            OperationKind::Creative => self.creative,
            OperationKind::Code => self.code,
            OperationKind::Reasoning => self.reasoning,
            OperationKind::ToolCall => return None,
        };
        Some(Duration::from_secs(secs))
    }
}

/// Everything the router reads per request. Replaced wholesale at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub strategy: LoadBalancingStrategy,
    pub weights: ScoreWeights,
    /// Per-model weights for the weighted strategy (default 1.0)
    pub model_weights: HashMap<String, f64>,
    /// Providers tried for the fallback call, in order
    pub fallback_providers: Vec<String>,
    /// Responses cheaper than this (USD) are cached
    pub cache_cost_threshold: f64,
    pub reference_workload: ReferenceWorkload,
    pub unknown_cost: UnknownCostPolicy,
    pub default_max_output_tokens: u32,
    pub retry: RetryPolicy,
    pub cache_ttl: CacheTtls,
    pub rules: Vec<RoutingRule>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::default(),
            weights: ScoreWeights::default(),
            model_weights: HashMap::new(),
            fallback_providers: Vec::new(),
            cache_cost_threshold: 0.10,
            reference_workload: ReferenceWorkload::default(),
            unknown_cost: UnknownCostPolicy::default(),
            default_max_output_tokens: 1024,
            retry: RetryPolicy::default(),
            cache_ttl: CacheTtls::default(),
            rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_is_two_then_four_seconds() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_tool_calls_have_no_ttl() {
        let ttls = CacheTtls::default();
        assert_eq!(ttls.ttl_for(OperationKind::ToolCall), None);
        assert!(ttls.ttl_for(OperationKind::Analysis) > ttls.ttl_for(OperationKind::Chat));
    }
}
