//! Rolling per-model health and circuit breaking
//!
//! Every call outcome (and every background probe) is reported through
//! [`HealthRegistry::record_outcome`]. The registry keeps a bounded window of
//! recent latencies, a consecutive-failure counter and a [`CircuitBreaker`] per
//! model. State lives in a sharded map, so concurrent updates to different
//! models never contend and updates to the same model are serialized per key.

mod breaker;
mod probe;

pub use breaker::{BreakerState, CircuitBreaker};
pub use probe::{probe_once, spawn_probe, ProbeReport};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

impl HealthStatus {
    /// Contribution to the cost-optimized score, 0.0 - 1.0
    pub fn score(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unavailable => 0.0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Thresholds for health classification and breaker tripping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthConfig {
    /// Latency samples kept for the moving average
    pub window_size: usize,
    /// Average latency above which a model is degraded
    pub degraded_latency_ms: f64,
    /// Consecutive failures that make a model unavailable and open its breaker
    pub failure_threshold: u32,
    /// How long an opened breaker excludes the model
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            degraded_latency_ms: 5000.0,
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Whether a model may be selected right now
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Selectable with the given status
    Admit(HealthStatus),
    /// Cooldown elapsed on an unavailable model; one trial call is allowed
    Trial,
    /// Cooldown elapsed but another caller holds the trial call
    TrialInFlight,
    /// Breaker open
    BreakerOpen { retry_in: Duration },
    /// Unavailable without a breaker to wait on
    Unavailable,
}

#[derive(Debug, Default)]
struct ModelHealth {
    latencies: VecDeque<u64>,
    avg_latency_ms: f64,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    last_checked: Option<DateTime<Utc>>,
    breaker: CircuitBreaker,
}

impl ModelHealth {
    fn push_latency(&mut self, latency_ms: u64, window: usize) {
        self.latencies.push_back(latency_ms);
        while self.latencies.len() > window.max(1) {
            self.latencies.pop_front();
        }
        let sum: u64 = self.latencies.iter().sum();
        self.avg_latency_ms = sum as f64 / self.latencies.len() as f64;
    }

    fn status(&self, config: &HealthConfig) -> HealthStatus {
        if self.consecutive_failures >= config.failure_threshold {
            HealthStatus::Unavailable
        } else if self.avg_latency_ms > config.degraded_latency_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Point-in-time health of one model
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub model_id: String,
    pub status: HealthStatus,
    pub breaker: BreakerState,
    pub avg_latency_ms: f64,
    pub samples: usize,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl std::fmt::Display for HealthSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<32} {:<12} breaker={:<9} avg={:>8.1}ms failures={}",
            self.model_id, self.status, self.breaker, self.avg_latency_ms, self.consecutive_failures
        )
    }
}

/// Process-lifetime health state for every model that has reported an outcome
pub struct HealthRegistry {
    models: DashMap<String, ModelHealth>,
    config: RwLock<HealthConfig>,
}

impl HealthRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            models: DashMap::new(),
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> HealthConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_config(&self, config: HealthConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Record one call or probe outcome. Returns the model's new status.
    pub fn record_outcome(&self, model_id: &str, success: bool, latency_ms: u64) -> HealthStatus {
        let config = self.config();
        let now = Instant::now();
        let mut health = self.models.entry(model_id.to_string()).or_default();

        health.push_latency(latency_ms, config.window_size);
        health.last_checked = Some(Utc::now());

        if success {
            health.consecutive_failures = 0;
            health.total_successes += 1;
            if health.breaker.record_success(now, config.cooldown) {
                info!(model = model_id, "Circuit breaker closed");
            }
        } else {
            health.consecutive_failures += 1;
            health.total_failures += 1;
            let consecutive = health.consecutive_failures;
            if health
                .breaker
                .record_failure(now, consecutive, config.failure_threshold, config.cooldown)
            {
                warn!(
                    model = model_id,
                    consecutive_failures = consecutive,
                    cooldown_secs = config.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
            }
        }

        health.status(&config)
    }

    pub fn status(&self, model_id: &str) -> HealthStatus {
        let config = self.config();
        self.models
            .get(model_id)
            .map(|h| h.status(&config))
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Moving-average latency, or `None` if the model has no samples yet
    pub fn avg_latency_ms(&self, model_id: &str) -> Option<f64> {
        self.models
            .get(model_id)
            .filter(|h| !h.latencies.is_empty())
            .map(|h| h.avg_latency_ms)
    }

    pub fn consecutive_failures(&self, model_id: &str) -> u32 {
        self.models
            .get(model_id)
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn breaker_state(&self, model_id: &str) -> BreakerState {
        let config = self.config();
        self.models
            .get(model_id)
            .map(|h| h.breaker.state(Instant::now(), config.cooldown))
            .unwrap_or(BreakerState::Closed)
    }

    /// Decide whether `model_id` may be selected now
    pub fn admission(&self, model_id: &str) -> Admission {
        let config = self.config();
        let now = Instant::now();
        let Some(health) = self.models.get(model_id) else {
            return Admission::Admit(HealthStatus::Healthy);
        };

        match (health.breaker.state(now, config.cooldown), health.status(&config)) {
            (BreakerState::Open, _) => Admission::BreakerOpen {
                retry_in: health.breaker.remaining(now, config.cooldown),
            },
            (BreakerState::HalfOpen, HealthStatus::Unavailable) => {
                if health.breaker.trial_in_flight(now, config.cooldown) {
                    Admission::TrialInFlight
                } else {
                    Admission::Trial
                }
            }
            (BreakerState::Closed, HealthStatus::Unavailable) => Admission::Unavailable,
            (_, status) => Admission::Admit(status),
        }
    }

    /// Claim the single half-open trial call for `model_id`. Returns false when
    /// another caller already holds it. Models not awaiting a trial always pass.
    pub fn claim_trial(&self, model_id: &str) -> bool {
        let config = self.config();
        let Some(mut health) = self.models.get_mut(model_id) else {
            return true;
        };
        if health.status(&config) != HealthStatus::Unavailable {
            return true;
        }
        health.breaker.try_claim_trial(Instant::now(), config.cooldown)
    }

    /// Return a claimed trial that was never attempted
    pub fn release_trial(&self, model_id: &str) {
        if let Some(mut health) = self.models.get_mut(model_id) {
            health.breaker.release_trial();
        }
    }

    pub fn reset(&self, model_id: &str) {
        self.models.remove(model_id);
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let config = self.config();
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut snapshots: Vec<HealthSnapshot> = self
            .models
            .iter()
            .map(|entry| {
                let h = entry.value();
                HealthSnapshot {
                    model_id: entry.key().clone(),
                    status: h.status(&config),
                    breaker: h.breaker.state(now, config.cooldown),
                    avg_latency_ms: h.avg_latency_ms,
                    samples: h.latencies.len(),
                    consecutive_failures: h.consecutive_failures,
                    total_successes: h.total_successes,
                    total_failures: h.total_failures,
                    last_checked: h.last_checked,
                    last_failure: h.breaker.last_failure().and_then(|at| {
                        let ago = chrono::Duration::from_std(now.saturating_duration_since(at));
                        ago.ok().map(|ago| wall_now - ago)
                    }),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        snapshots
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_after_three_consecutive_failures() {
        let registry = HealthRegistry::default();

        assert_eq!(registry.record_outcome("m1", false, 100), HealthStatus::Healthy);
        assert_eq!(registry.record_outcome("m1", false, 100), HealthStatus::Healthy);
        assert_eq!(registry.record_outcome("m1", false, 100), HealthStatus::Unavailable);
        assert_eq!(registry.breaker_state("m1"), BreakerState::Open);
        assert!(matches!(registry.admission("m1"), Admission::BreakerOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let registry = HealthRegistry::default();
        registry.record_outcome("m1", false, 100);
        registry.record_outcome("m1", false, 100);
        registry.record_outcome("m1", true, 100);
        registry.record_outcome("m1", false, 100);

        assert_eq!(registry.consecutive_failures("m1"), 1);
        assert_eq!(registry.status("m1"), HealthStatus::Healthy);
        assert_eq!(registry.breaker_state("m1"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_average_uses_last_ten_samples() {
        let registry = HealthRegistry::default();
        for _ in 0..10 {
            registry.record_outcome("m1", true, 10_000);
        }
        assert_eq!(registry.status("m1"), HealthStatus::Degraded);

        for _ in 0..10 {
            registry.record_outcome("m1", true, 100);
        }
        assert_eq!(registry.avg_latency_ms("m1"), Some(100.0));
        assert_eq!(registry.status("m1"), HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_then_trial_then_recovery() {
        let registry = HealthRegistry::default();
        for _ in 0..3 {
            registry.record_outcome("m1", false, 100);
        }

        // A success inside the cooldown does not reopen traffic
        tokio::time::advance(Duration::from_secs(30)).await;
        registry.record_outcome("m1", true, 100);
        assert!(matches!(registry.admission("m1"), Admission::BreakerOpen { .. }));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.breaker_state("m1"), BreakerState::HalfOpen);
        assert_eq!(registry.admission("m1"), Admission::Admit(HealthStatus::Healthy));

        registry.record_outcome("m1", true, 100);
        assert_eq!(registry.breaker_state("m1"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_model_gets_trial_after_cooldown() {
        let registry = HealthRegistry::default();
        for _ in 0..3 {
            registry.record_outcome("m1", false, 100);
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.admission("m1"), Admission::Trial);

        // Trial failure re-trips immediately
        registry.record_outcome("m1", false, 100);
        assert!(matches!(registry.admission("m1"), Admission::BreakerOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_caller_gets_the_trial() {
        let registry = HealthRegistry::default();
        for _ in 0..3 {
            registry.record_outcome("m1", false, 100);
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(registry.claim_trial("m1"));
        assert_eq!(registry.admission("m1"), Admission::TrialInFlight);
        assert!(!registry.claim_trial("m1"));

        registry.release_trial("m1");
        assert_eq!(registry.admission("m1"), Admission::Trial);

        // Healthy models are never gated
        assert!(registry.claim_trial("m2"));
        assert!(registry.claim_trial("m2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_last_failure() {
        let registry = HealthRegistry::default();
        registry.record_outcome("m1", true, 100);
        registry.record_outcome("m2", false, 100);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].model_id, "m1");
        assert!(snapshot[0].last_failure.is_none());
        assert!(snapshot[1].last_failure.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_lose_counts() {
        let registry = Arc::new(HealthRegistry::default());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    registry.record_outcome("m1", true, 5);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].total_successes, 800);
        assert_eq!(snapshot[0].samples, 10);
    }
}
