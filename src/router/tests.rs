//! Router scenarios against scripted in-memory backends

use super::*;
use crate::api::{ModelBackend, TokenUsage};
use crate::catalog::{Capability, Pricing};
use crate::health::BreakerState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Backend that answers or fails on command and records when it was called
struct ScriptedBackend {
    provider: String,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedBackend {
    fn new(provider: &str) -> Arc<Self> {
        Arc::new(Self {
            provider: provider.to_string(),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
        })
    }

    fn failing(provider: &str) -> Arc<Self> {
        let backend = Self::new(provider);
        backend.set_failing(true);
        backend
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every call sleeps this long before answering
    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn invoke(
        &self,
        model: &Model,
        _request: &ProviderRequest,
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 503,
                body: "overloaded".into(),
            });
        }
        Ok(ProviderReply::new(format!("reply from {}", model.id), model.id.clone())
            .with_usage(TokenUsage::new(10, 5)))
    }

    async fn health_check(&self, _model: &Model) -> Result<(), ProviderError> {
        Ok(())
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

/// m1 on p1 is cheap and preferred; m2 on p2 costs ten times more
fn catalog() -> Arc<ModelCatalog> {
    Arc::new(ModelCatalog::from_models([
        Model::new("m1", "p1", Pricing::new(0.001, 0.001))
            .with_capabilities(&[Capability::Chat, Capability::Analysis, Capability::ToolCalling]),
        Model::new("m2", "p2", Pricing::new(0.01, 0.01)).with_capabilities(&[
            Capability::Chat,
            Capability::Analysis,
            Capability::Code,
            Capability::ToolCalling,
        ]),
        Model::new("legacy", "p1", Pricing::new(0.0001, 0.0001)).deprecated(),
    ]))
}

struct Harness {
    router: Router,
    p1: Arc<ScriptedBackend>,
    p2: Arc<ScriptedBackend>,
    ledger: Arc<InMemoryLedger>,
}

fn harness(p1: Arc<ScriptedBackend>, p2: Arc<ScriptedBackend>) -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    let backends = BackendRegistry::new().with(p1.clone()).with(p2.clone());
    let router = Router::new(catalog(), backends).with_ledger(ledger.clone());
    Harness {
        router,
        p1,
        p2,
        ledger,
    }
}

fn healthy() -> Harness {
    harness(ScriptedBackend::new("p1"), ScriptedBackend::new("p2"))
}

#[tokio::test(start_paused = true)]
async fn test_identical_request_is_served_from_cache() {
    let h = healthy();

    let first = h.router.chat("ping", RoutingContext::default()).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.model_id, "m1");
    assert!(first.cost > 0.0);

    let second = h.router.chat("ping", RoutingContext::default()).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.cost, 0.0);
    assert_eq!(second.tokens, TokenBreakdown::default());
    assert_eq!(second.content, first.content);
    assert_eq!(h.p1.calls(), 1);

    let metrics = h.router.metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(h.ledger.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_entry_expires_after_operation_ttl() {
    let h = healthy();

    h.router.chat("ping", RoutingContext::default()).await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;
    let third = h.router.chat("ping", RoutingContext::default()).await.unwrap();

    assert!(!third.cached);
    assert_eq!(h.p1.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_user_scoped_and_tool_call_responses_are_not_cached() {
    let h = healthy();

    let context = RoutingContext {
        user_id: Some("u1".into()),
        ..RoutingContext::default()
    };
    h.router.chat("ping", context.clone()).await.unwrap();
    let again = h.router.chat("ping", context).await.unwrap();
    assert!(!again.cached);

    let tool = || RoutingRequest::new("lookup order 42", OperationKind::ToolCall);
    h.router.route(tool()).await.unwrap();
    let again = h.router.route(tool()).await.unwrap();
    assert!(!again.cached);

    assert_eq!(h.p1.calls(), 4);
    assert!(h.router.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failover_to_healthy_model() {
    let h = harness(ScriptedBackend::failing("p1"), ScriptedBackend::new("p2"));

    let response = h
        .router
        .route(RoutingRequest::new("summarize", OperationKind::Analysis))
        .await
        .unwrap();

    assert!(response.fallback_used);
    assert_eq!(response.retries, 3);
    assert_eq!(response.model_id, "m2");
    assert_eq!(response.provider, "p2");
    assert_eq!(h.p1.calls(), 3);
    assert_eq!(h.p2.calls(), 1);
    assert!(response.explanation.contains("fallback m2"));

    let records = h.ledger.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].model_id, "m2");
    assert_eq!(records[0].request_id, response.request_id);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_are_bounded_and_non_decreasing() {
    let h = harness(ScriptedBackend::failing("p1"), ScriptedBackend::failing("p2"));

    let err = h
        .router
        .route(RoutingRequest::new("summarize", OperationKind::Analysis))
        .await
        .unwrap_err();

    assert!(matches!(err, RoutingError::FallbackExhausted { .. }));
    assert_eq!(h.p1.calls(), 3);
    // Single fallback attempt, no retries
    assert_eq!(h.p2.calls(), 1);

    let gaps = h.p1.gaps();
    assert_eq!(gaps, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]));

    let trail = err.trail().unwrap();
    assert_eq!(trail.subjects(TrailStep::Failed), vec!["m1", "m1", "m1", "m2"]);
    assert_eq!(h.router.metrics().failed_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_excludes_model_until_cooldown() {
    let h = harness(ScriptedBackend::failing("p1"), ScriptedBackend::new("p2"));
    let request = |input: &str| RoutingRequest::new(input, OperationKind::Chat).with_user("u1");

    h.router.route(request("first")).await.unwrap();
    assert_eq!(h.router.health().breaker_state("m1"), BreakerState::Open);

    // Before cooldown: m1 is never selected
    let during = h.router.route(request("second")).await.unwrap();
    assert_eq!(during.model_id, "m2");
    assert!(!during.fallback_used);
    assert_eq!(h.p1.calls(), 3);
    assert!(during.explanation.contains("skipped m1: breaker open"));

    // After cooldown m1 gets a trial call and recovers
    h.p1.set_failing(false);
    tokio::time::advance(Duration::from_secs(61)).await;
    let after = h.router.route(request("third")).await.unwrap();
    assert_eq!(after.model_id, "m1");
    assert_eq!(h.router.health().breaker_state("m1"), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_counts_as_provider_failure() {
    let h = healthy();
    h.p1.set_delay(Duration::from_secs(60));

    let response = h
        .router
        .route(RoutingRequest::new("summarize", OperationKind::Analysis))
        .await
        .unwrap();

    assert_eq!(response.model_id, "m2");
    assert!(response.fallback_used);
    assert_eq!(response.retries, 3);
    assert_eq!(h.p1.calls(), 3);
    // 30s timeout each, plus 2s and 4s of backoff between attempts
    assert_eq!(
        h.p1.gaps(),
        vec![Duration::from_secs(32), Duration::from_secs(34)]
    );
    assert_eq!(h.router.health().consecutive_failures("m1"), 3);
    assert_eq!(h.router.health().breaker_state("m1"), BreakerState::Open);
    assert_eq!(h.router.metrics().retries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_model_gets_a_single_trial() {
    let h = harness(ScriptedBackend::failing("p1"), ScriptedBackend::new("p2"));
    let request = |input: &str| RoutingRequest::new(input, OperationKind::Chat).with_user("u1");

    h.router.route(request("open it")).await.unwrap();
    assert_eq!(h.router.health().breaker_state("m1"), BreakerState::Open);

    h.p1.set_failing(false);
    h.p1.set_delay(Duration::from_secs(5));
    tokio::time::advance(Duration::from_secs(61)).await;

    let (a, b) = tokio::join!(h.router.route(request("one")), h.router.route(request("two")));
    let (a, b) = (a.unwrap(), b.unwrap());

    let mut models = vec![a.model_id.as_str(), b.model_id.as_str()];
    models.sort();
    assert_eq!(models, vec!["m1", "m2"]);
    assert_eq!(h.p1.calls(), 4);

    let skipped = if a.model_id == "m2" { &a } else { &b };
    assert!(skipped
        .explanation
        .contains("skipped m1: half-open trial already in flight"));
    assert_eq!(h.router.health().breaker_state("m1"), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_max_latency_excludes_slow_models() {
    let h = healthy();
    for _ in 0..3 {
        h.router.health().record_outcome("m1", true, 5000);
    }

    let context = RoutingContext {
        max_latency_ms: Some(1000),
        ..RoutingContext::default()
    };
    let response = h.router.chat("ping", context).await.unwrap();

    assert_eq!(response.model_id, "m2");
    assert!(!response.fallback_used);
    assert!(response
        .explanation
        .contains("skipped m1: average latency 5000ms above 1000ms"));
    assert_eq!(h.p1.calls(), 0);

    // Models without samples are not filtered
    let fresh = healthy();
    let context = RoutingContext {
        max_latency_ms: Some(1),
        ..RoutingContext::default()
    };
    let response = fresh.router.chat("ping", context).await.unwrap();
    assert_eq!(response.model_id, "m1");
}

#[tokio::test(start_paused = true)]
async fn test_budget_excludes_expensive_models() {
    let h = healthy();

    // Reference workload: m1 costs $0.0015, m2 costs $0.015
    let response = h
        .router
        .route(
            RoutingRequest::new("ping", OperationKind::Chat)
                .with_budget(0.005)
                .with_preferred_provider("p2"),
        )
        .await
        .unwrap();
    assert_eq!(response.model_id, "m1");
    assert!(response.explanation.contains("hint ignored"));

    let err = h
        .router
        .route(RoutingRequest::new("pong", OperationKind::Chat).with_budget(0.001))
        .await
        .unwrap_err();
    let trail = match err {
        RoutingError::NoEligibleProvider { trail } => trail,
        other => panic!("expected NoEligibleProvider, got {other:?}"),
    };
    let skipped = trail.subjects(TrailStep::Skipped);
    assert!(skipped.contains(&"m1"));
    assert!(skipped.contains(&"m2"));
    assert!(skipped.contains(&"legacy"));
}

#[tokio::test(start_paused = true)]
async fn test_capability_requirements_filter_models() {
    let h = healthy();

    let response = h
        .router
        .route(
            RoutingRequest::new("fn main() {}", OperationKind::Code)
                .with_capabilities(&[Capability::Code]),
        )
        .await
        .unwrap();

    assert_eq!(response.model_id, "m2");
    assert!(response.explanation.contains("skipped m1: missing code"));
}

#[tokio::test(start_paused = true)]
async fn test_reject_rule_stops_before_any_call() {
    let h = healthy();
    h.router.set_rules(vec![RoutingRule::new(
        "no-secrets",
        100,
        RuleCondition::InputContains {
            pattern: "password".into(),
            case_sensitive: false,
        },
        RuleAction::Reject {
            reason: "credentials in prompt".into(),
        },
    )]);

    let err = h
        .router
        .chat("my PASSWORD is hunter2", RoutingContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RoutingError::PolicyRejected { ref rule, .. } if rule == "no-secrets"));
    assert_eq!(h.p1.calls() + h.p2.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_route_rule_pins_provider() {
    let h = healthy();
    h.router.set_rules(vec![RoutingRule::new(
        "analysis-to-p2",
        10,
        RuleCondition::Operation {
            operations: vec![OperationKind::Analysis],
        },
        RuleAction::Route {
            provider: "p2".into(),
            model: None,
        },
    )]);

    let analysis = h.router.analysis("quarterly numbers", RoutingContext::default()).await.unwrap();
    let chat = h.router.chat("hello", RoutingContext::default()).await.unwrap();

    assert_eq!(analysis.provider, "p2");
    assert_eq!(chat.provider, "p1");
}

#[tokio::test(start_paused = true)]
async fn test_force_cache_rule_overrides_cost_threshold() {
    let h = healthy();
    h.router.update_settings(RouterSettings {
        cache_cost_threshold: 0.0,
        rules: vec![RoutingRule::new(
            "cache-chat",
            1,
            RuleCondition::Always,
            RuleAction::ForceCache { ttl_secs: Some(5) },
        )],
        ..RouterSettings::default()
    });

    h.router.chat("ping", RoutingContext::default()).await.unwrap();
    assert!(h.router.chat("ping", RoutingContext::default()).await.unwrap().cached);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!h.router.chat("ping", RoutingContext::default()).await.unwrap().cached);
}

#[tokio::test(start_paused = true)]
async fn test_force_cache_rule_with_unbounded_ttl_is_clamped() {
    let h = healthy();
    h.router.set_rules(vec![RoutingRule::new(
        "cache-forever",
        1,
        RuleCondition::Always,
        RuleAction::ForceCache {
            ttl_secs: Some(u64::MAX),
        },
    )]);

    h.router.chat("ping", RoutingContext::default()).await.unwrap();
    let again = h.router.chat("ping", RoutingContext::default()).await.unwrap();

    assert!(again.cached);
    assert_eq!(h.p1.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lowering_cache_limits_evicts_at_once() {
    let h = healthy();
    for input in ["a", "b", "c"] {
        h.router.chat(input, RoutingContext::default()).await.unwrap();
    }
    assert_eq!(h.router.cache().len(), 3);

    let evicted = h.router.set_cache_config(CacheConfig {
        max_entries: 1,
        ..h.router.cache().config()
    });

    assert_eq!(evicted, 2);
    assert_eq!(h.router.cache().len(), 1);
    assert_eq!(h.router.cache().config().max_entries, 1);
    assert!(h.router.chat("c", RoutingContext::default()).await.unwrap().cached);
}

#[tokio::test(start_paused = true)]
async fn test_reset_metrics_keeps_cached_entries() {
    let h = healthy();
    h.router.chat("ping", RoutingContext::default()).await.unwrap();
    h.router.chat("ping", RoutingContext::default()).await.unwrap();
    assert_eq!(h.router.metrics().total_requests, 2);
    assert_eq!(h.router.cache_metrics().cache_hits, 1);

    h.router.reset_metrics();

    assert_eq!(h.router.metrics().total_requests, 0);
    assert_eq!(h.router.cache_metrics().cache_hits, 0);
    assert_eq!(h.router.cache().len(), 1);
    assert!(h.router.chat("ping", RoutingContext::default()).await.unwrap().cached);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_model_falls_back_without_retry() {
    let p1 = ScriptedBackend::new("p1");
    let p2 = ScriptedBackend::new("p2");
    let catalog = Arc::new(ModelCatalog::from_models([
        Model::new("m1", "p1", Pricing::new(0.001, 0.001)).with_rate_limit(1),
        Model::new("m2", "p2", Pricing::new(0.01, 0.01)),
    ]));
    let router = Router::new(catalog, BackendRegistry::new().with(p1.clone()).with(p2.clone()));
    let request = |input: &str| RoutingRequest::new(input, OperationKind::Chat).with_user("u1");

    router.route(request("one")).await.unwrap();
    let limited = router.route(request("two")).await.unwrap();

    assert_eq!(limited.model_id, "m2");
    assert!(limited.fallback_used);
    assert_eq!(limited.retries, 1);
    assert_eq!(p1.calls(), 1);
    // Rate limiting is not a health failure
    assert_eq!(router.health().consecutive_failures("m1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_strategy_can_be_swapped_at_runtime() {
    let h = healthy();
    h.router.set_strategy(LoadBalancingStrategy::RoundRobin);

    let mut models = Vec::new();
    for input in ["a", "b", "c", "d"] {
        let response = h.router.chat(input, RoutingContext::default()).await.unwrap();
        models.push(response.model_id);
    }

    assert_eq!(models, vec!["m1", "m2", "m1", "m2"]);
    assert_eq!(h.router.settings().strategy, LoadBalancingStrategy::RoundRobin);
}

#[test]
fn test_fingerprint_ignores_user_and_capability_order() {
    let base = RoutingRequest::new("ping", OperationKind::Chat)
        .with_capabilities(&[Capability::Code, Capability::Chat]);
    let same = RoutingRequest::new("ping", OperationKind::Chat)
        .with_user("someone")
        .with_session("s1")
        .with_capabilities(&[Capability::Chat, Capability::Code]);
    let other_op = RoutingRequest::new("ping", OperationKind::Analysis)
        .with_capabilities(&[Capability::Chat, Capability::Code]);

    assert_eq!(fingerprint(&base), fingerprint(&same));
    assert_ne!(fingerprint(&base), fingerprint(&other_op));
    assert_eq!(fingerprint(&base).len(), 64);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_up_front() {
    let h = healthy();
    let err = h
        .router
        .route(RoutingRequest::new("", OperationKind::Chat))
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::InvalidRequest(_)));
    assert!(err.trail().is_none());
}
