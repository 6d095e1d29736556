//! Router-wide counters and the summary exposed through `Router::metrics`

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-model accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub provider: String,
    pub requests: u64,
    pub failed_attempts: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub total_latency_ms: u64,
}

/// Thread-safe metrics tracker
///
/// Request-level counters are atomics; per-model data sits in a sharded map so
/// concurrent requests on different models never contend.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
    total_latency_ms: AtomicU64,
    models: DashMap<String, ModelUsage>,
}

/// What one provider-served success contributes
#[derive(Debug, Clone, Copy)]
pub struct CallOutcome<'a> {
    pub model_id: &'a str,
    pub provider: &'a str,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub retries: u32,
    pub fallback_used: bool,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_success(&self, outcome: CallOutcome<'_>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.retries.fetch_add(outcome.retries as u64, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(outcome.latency_ms, Ordering::Relaxed);
        if outcome.fallback_used {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }

        let mut usage = self.models.entry(outcome.model_id.to_string()).or_default();
        if usage.provider.is_empty() {
            usage.provider = outcome.provider.to_string();
        }
        usage.requests += 1;
        usage.input_tokens += outcome.input_tokens as u64;
        usage.output_tokens += outcome.output_tokens as u64;
        usage.cost += outcome.cost;
        usage.total_latency_ms += outcome.latency_ms;
    }

    /// A request that ended in an error
    pub fn record_failure(&self, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// A single provider attempt that failed, whatever the request's final outcome
    pub fn record_attempt_failure(&self, model_id: &str, provider: &str) {
        let mut usage = self.models.entry(model_id.to_string()).or_default();
        if usage.provider.is_empty() {
            usage.provider = provider.to_string();
        }
        usage.failed_attempts += 1;
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.fallbacks.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
        self.models.clear();
    }

    pub fn summary(&self) -> MetricsSummary {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let failed_requests = self.failed_requests.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        let by_model: BTreeMap<String, ModelUsage> = self
            .models
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut by_provider: BTreeMap<String, u64> = BTreeMap::new();
        for usage in by_model.values() {
            *by_provider.entry(usage.provider.clone()).or_default() += usage.requests;
        }

        let ratio = |n: u64| {
            if total_requests == 0 {
                0.0
            } else {
                n as f64 / total_requests as f64
            }
        };

        MetricsSummary {
            total_requests,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests,
            cache_hits,
            cache_hit_rate: ratio(cache_hits),
            failure_rate: ratio(failed_requests),
            retries: self.retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            avg_latency_ms: ratio(total_latency),
            total_input_tokens: by_model.values().map(|u| u.input_tokens).sum(),
            total_output_tokens: by_model.values().map(|u| u.output_tokens).sum(),
            total_cost: by_model.values().map(|u| u.cost).sum(),
            by_provider,
            by_model,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub failure_rate: f64,
    pub retries: u64,
    pub fallbacks: u64,
    pub avg_latency_ms: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    /// Provider-served requests per provider
    pub by_provider: BTreeMap<String, u64>,
    pub by_model: BTreeMap<String, ModelUsage>,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Router Metrics Summary ===")?;
        writeln!(f, "Total requests: {}", self.total_requests)?;
        writeln!(f, "Failure rate: {:.2}%", self.failure_rate * 100.0)?;
        writeln!(f, "Cache hit rate: {:.2}%", self.cache_hit_rate * 100.0)?;
        writeln!(f, "Retries: {}  Fallbacks: {}", self.retries, self.fallbacks)?;
        writeln!(f, "Avg latency: {:.1}ms", self.avg_latency_ms)?;
        writeln!(
            f,
            "Tokens: {} in / {} out",
            self.total_input_tokens, self.total_output_tokens
        )?;
        writeln!(f, "Total cost: ${:.4}", self.total_cost)?;
        for (provider, requests) in &self.by_provider {
            writeln!(f, "  {:<16} {} requests", provider, requests)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome<'a>(model_id: &'a str, provider: &'a str) -> CallOutcome<'a> {
        CallOutcome {
            model_id,
            provider,
            input_tokens: 100,
            output_tokens: 50,
            cost: 0.01,
            latency_ms: 200,
            retries: 1,
            fallback_used: false,
        }
    }

    #[test]
    fn test_summary_rates_and_distribution() {
        let metrics = MetricsTracker::new();
        metrics.record_success(outcome("m1", "p1"));
        metrics.record_success(outcome("m2", "p1"));
        metrics.record_cache_hit(0);
        metrics.record_failure(400);
        metrics.record_attempt_failure("m3", "p2");

        let summary = metrics.summary();
        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.cache_hit_rate, 0.25);
        assert_eq!(summary.failure_rate, 0.25);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.avg_latency_ms, 200.0);
        assert_eq!(summary.by_provider.get("p1"), Some(&2));
        assert_eq!(summary.by_model["m3"].failed_attempts, 1);
        assert!((summary.total_cost - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = MetricsTracker::new();
        metrics.record_success(outcome("m1", "p1"));
        metrics.reset();

        let summary = metrics.summary();
        assert_eq!(summary.total_requests, 0);
        assert!(summary.by_model.is_empty());
        assert!(summary.to_string().contains("Total requests: 0"));
    }
}
