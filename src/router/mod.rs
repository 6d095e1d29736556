//! Request router
//!
//! [`Router::route`] is the single entry point. Per request it:
//!
//! 1. Applies routing rules (reject, pin provider, patch context, force cache)
//! 2. Looks up the response cache by request fingerprint
//! 3. Filters the catalog down to eligible models, recording every exclusion
//! 4. Picks one model with the configured load-balancing strategy
//! 5. Calls it with retry and exponential backoff
//! 6. Falls back to one alternate model if the primary is exhausted
//! 7. Caches the response when allowed and writes a usage record
//!
//! Every decision lands in a [`DecisionTrail`], returned as the response's
//! explanation or attached to the terminal error.

mod error;
mod limiter;
mod request;
mod response;
mod rules;
mod settings;
mod strategy;

#[cfg(test)]
mod tests;

pub use error::{DecisionTrail, RoutingError, TrailEntry, TrailStep};
pub use limiter::ModelRateLimiter;
pub use request::{OperationKind, RoutingContext, RoutingRequest};
pub use response::{RoutingResponse, TokenBreakdown};
pub use rules::{apply_rules, RoutingRule, RuleAction, RuleCondition, RuleEffects};
pub use settings::{
    CacheTtls, ReferenceWorkload, RetryPolicy, RouterSettings, UnknownCostPolicy,
};
pub use strategy::{
    score, Candidate, InFlightGuard, LoadBalancingStrategy, ScoreBreakdown, ScoreWeights,
    Selection, Selector,
};

use crate::api::{BackendRegistry, Payload, ProviderError, ProviderReply, ProviderRequest};
use crate::cache::{CacheConfig, CacheMetrics, ResponseCache};
use crate::catalog::{Model, ModelCatalog};
use crate::estimator::{estimate_cost, HeuristicEstimator, TokenEstimator};
use crate::health::{Admission, HealthRegistry, HealthSnapshot, HealthStatus};
use crate::metrics::{CallOutcome, MetricsSummary, MetricsTracker};
use crate::usage::{InMemoryLedger, UsageLedger, UsageRecord};
use chrono::Utc;
use response::CachedCompletion;
use sha2::{Digest, Sha256};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Fingerprint of the cache-relevant fields of a request
///
/// Covers the input, the operation and the sorted set of required
/// capabilities. User and session identifiers are deliberately left out.
pub fn fingerprint(request: &RoutingRequest) -> String {
    fn field(hasher: &mut Sha256, bytes: &[u8]) {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }

    let mut hasher = Sha256::new();
    match &request.input {
        Payload::Text(text) => {
            field(&mut hasher, b"text");
            field(&mut hasher, text.as_bytes());
        }
        Payload::Chat(messages) => {
            field(&mut hasher, b"chat");
            for message in messages {
                field(&mut hasher, message.role.as_str().as_bytes());
                field(&mut hasher, message.content.as_bytes());
            }
        }
    }
    field(&mut hasher, request.operation.as_str().as_bytes());

    let mut capabilities = request.context.required_capabilities.clone();
    capabilities.sort();
    capabilities.dedup();
    for capability in capabilities {
        field(&mut hasher, capability.to_string().as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

struct Attempted {
    reply: ProviderReply,
    failures: u32,
}

struct Exhausted {
    error: ProviderError,
    failures: u32,
}

/// Routes requests across the catalog's models
pub struct Router {
    catalog: Arc<ModelCatalog>,
    backends: BackendRegistry,
    health: Arc<HealthRegistry>,
    cache: Arc<ResponseCache>,
    ledger: Arc<dyn UsageLedger>,
    estimator: Arc<dyn TokenEstimator>,
    settings: RwLock<Arc<RouterSettings>>,
    selector: Selector,
    limiter: ModelRateLimiter,
    metrics: MetricsTracker,
}

impl Router {
    /// Router with default settings, a fresh health registry, a default-sized
    /// cache, an in-memory ledger and the heuristic estimator
    pub fn new(catalog: Arc<ModelCatalog>, backends: BackendRegistry) -> Self {
        Self {
            catalog,
            backends,
            health: Arc::new(HealthRegistry::default()),
            cache: Arc::new(ResponseCache::new(CacheConfig::default())),
            ledger: Arc::new(InMemoryLedger::new()),
            estimator: Arc::new(HeuristicEstimator::default()),
            settings: RwLock::new(Arc::new(RouterSettings::default())),
            selector: Selector::new(),
            limiter: ModelRateLimiter::new(),
            metrics: MetricsTracker::new(),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = health;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_settings(self, settings: RouterSettings) -> Self {
        self.update_settings(settings);
        self
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Current settings snapshot
    pub fn settings(&self) -> Arc<RouterSettings> {
        Arc::clone(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace all runtime settings. In-flight requests keep the snapshot they started with.
    pub fn update_settings(&self, settings: RouterSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
        info!("Router settings updated");
    }

    pub fn set_rules(&self, rules: Vec<RoutingRule>) {
        self.modify_settings(|s| s.rules = rules);
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        self.modify_settings(|s| s.strategy = strategy);
        info!(%strategy, "Load balancing strategy changed");
    }

    fn modify_settings(&self, change: impl FnOnce(&mut RouterSettings)) {
        let mut guard = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = RouterSettings::clone(&guard);
        change(&mut next);
        *guard = Arc::new(next);
    }

    /// Replace the cache limits, evicting at once if the store is over the new
    /// bounds. Returns the number of entries evicted.
    pub fn set_cache_config(&self, config: CacheConfig) -> usize {
        self.cache.set_config(config)
    }

    /// Zero router and cache counters. Cached entries and health are untouched.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
        self.cache.reset_metrics();
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn health_snapshot(&self) -> Vec<HealthSnapshot> {
        self.health.snapshot()
    }

    pub async fn chat(
        &self,
        input: impl Into<Payload>,
        context: RoutingContext,
    ) -> Result<RoutingResponse, RoutingError> {
        self.route(RoutingRequest::new(input, OperationKind::Chat).with_context(context))
            .await
    }

    pub async fn analysis(
        &self,
        input: impl Into<Payload>,
        context: RoutingContext,
    ) -> Result<RoutingResponse, RoutingError> {
        self.route(RoutingRequest::new(input, OperationKind::Analysis).with_context(context))
            .await
    }

    pub async fn creative(
        &self,
        input: impl Into<Payload>,
        context: RoutingContext,
    ) -> Result<RoutingResponse, RoutingError> {
        self.route(RoutingRequest::new(input, OperationKind::Creative).with_context(context))
            .await
    }

    pub async fn code(
        &self,
        input: impl Into<Payload>,
        context: RoutingContext,
    ) -> Result<RoutingResponse, RoutingError> {
        self.route(RoutingRequest::new(input, OperationKind::Code).with_context(context))
            .await
    }

    /// Route one request to a model and return its response
    #[instrument(skip(self, request), fields(operation = %request.operation))]
    pub async fn route(&self, request: RoutingRequest) -> Result<RoutingResponse, RoutingError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        let result = self.route_inner(request_id, request, started).await;
        if let Err(e) = &result {
            self.metrics.record_failure(started.elapsed().as_millis() as u64);
            warn!(%request_id, error = %e, "Routing failed");
        }
        result
    }

    async fn route_inner(
        &self,
        request_id: Uuid,
        mut request: RoutingRequest,
        started: Instant,
    ) -> Result<RoutingResponse, RoutingError> {
        request.validate()?;
        let settings = self.settings();
        let mut trail = DecisionTrail::new();

        let effects = apply_rules(&settings.rules, &mut request, &mut trail)?;
        // Modify rules may have changed the budget
        request.validate()?;

        let cache_key = request
            .operation
            .is_cacheable()
            .then(|| fingerprint(&request));

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get::<CachedCompletion>(key) {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_cache_hit(latency_ms);
                trail.push(TrailStep::Cache, hit.model_id.as_str(), "hit");
                debug!(%request_id, model = %hit.model_id, "Served from cache");

                return Ok(RoutingResponse {
                    request_id,
                    content: hit.content,
                    model_id: hit.model_id,
                    provider: hit.provider,
                    cached: true,
                    tokens: TokenBreakdown::default(),
                    cost: 0.0,
                    latency_ms,
                    retries: 0,
                    fallback_used: false,
                    explanation: trail.to_string(),
                });
            }
        }

        let input_tokens = self.estimator.estimate_payload_tokens(&request.input);
        let eligible = self.eligible(&request, &settings, input_tokens, None, &mut trail);
        let candidates = apply_hints(eligible, &request.context, &mut trail);

        let Some((primary, reason)) =
            self.select_admitted(settings.strategy, candidates, &settings, &mut trail)
        else {
            return Err(RoutingError::NoEligibleProvider { trail });
        };
        trail.push(TrailStep::Selected, primary.id.as_str(), reason);

        let provider_request = ProviderRequest {
            payload: request.input.clone(),
            operation: request.operation,
            max_output_tokens: request
                .max_output_tokens
                .unwrap_or(settings.default_max_output_tokens),
        };

        let (model, reply, retries, fallback_used) = match self
            .execute_with_retry(primary, &provider_request, &settings.retry, &mut trail)
            .await
        {
            Ok(attempted) => (primary, attempted.reply, attempted.failures, false),
            Err(exhausted) => {
                let Some(alternate) =
                    self.select_fallback(&request, &settings, primary, input_tokens, &mut trail)
                else {
                    return Err(RoutingError::FallbackExhausted {
                        last_error: exhausted.error,
                        trail,
                    });
                };

                match self
                    .call_once(alternate, &provider_request, settings.retry.call_timeout())
                    .await
                {
                    Ok(reply) => {
                        trail.push(TrailStep::Succeeded, alternate.id.as_str(), "fallback");
                        (alternate, reply, exhausted.failures, true)
                    }
                    Err(error) => {
                        trail.push(TrailStep::Failed, alternate.id.as_str(), error.to_string());
                        return Err(RoutingError::FallbackExhausted {
                            last_error: error,
                            trail,
                        });
                    }
                }
            }
        };

        let tokens = match reply.usage {
            Some(usage) => TokenBreakdown {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.input_tokens.saturating_add(usage.output_tokens),
                estimated: false,
            },
            None => {
                let input = to_u32(input_tokens);
                let output = to_u32(self.estimator.estimate_tokens(&reply.content));
                TokenBreakdown {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input.saturating_add(output),
                    estimated: true,
                }
            }
        };
        let cost = estimate_cost(
            &self.catalog,
            &model.id,
            tokens.input_tokens as usize,
            tokens.output_tokens as usize,
        )
        .unwrap_or(0.0);

        if let Some(key) = &cache_key {
            let shareable = request.context.user_id.is_none();
            let cheap_enough = effects.force_cache || cost < settings.cache_cost_threshold;
            let ttl = effects
                .cache_ttl
                .or_else(|| settings.cache_ttl.ttl_for(request.operation));
            if let Some(ttl) = ttl.filter(|_| shareable && cheap_enough) {
                let entry = CachedCompletion {
                    content: reply.content.clone(),
                    model_id: model.id.clone(),
                    provider: model.provider.clone(),
                };
                match self.cache.set(key, &entry, ttl) {
                    Ok(()) => trail.push(
                        TrailStep::Cache,
                        model.id.as_str(),
                        format!("stored for {}s", ttl.as_secs()),
                    ),
                    Err(e) => warn!(%request_id, error = %e, "Failed to cache response"),
                }
            }
        }

        let record = UsageRecord {
            request_id,
            model_id: model.id.clone(),
            provider: model.provider.clone(),
            operation: request.operation,
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            cost,
            user_id: request.context.user_id.clone(),
            session_id: request.context.session_id.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.ledger.record(record).await {
            warn!(%request_id, error = %e, "Failed to record usage");
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_success(CallOutcome {
            model_id: &model.id,
            provider: &model.provider,
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            cost,
            latency_ms,
            retries,
            fallback_used,
        });

        info!(
            %request_id,
            model = %model.id,
            provider = %model.provider,
            cost,
            latency_ms,
            retries,
            fallback_used,
            "Request routed"
        );

        Ok(RoutingResponse {
            request_id,
            content: reply.content,
            model_id: model.id.clone(),
            provider: model.provider.clone(),
            cached: false,
            tokens,
            cost,
            latency_ms,
            retries,
            fallback_used,
            explanation: trail.to_string(),
        })
    }

    /// Catalog models that may serve `request`, in catalog order
    fn eligible(
        &self,
        request: &RoutingRequest,
        settings: &RouterSettings,
        input_tokens: usize,
        exclude: Option<&str>,
        trail: &mut DecisionTrail,
    ) -> Vec<Candidate<'_>> {
        let ctx = &request.context;
        let workload = settings.reference_workload;
        let mut candidates = Vec::new();

        for model in self.catalog.models() {
            let id = model.id.as_str();
            if exclude == Some(id) {
                continue;
            }
            if model.deprecated {
                trail.push(TrailStep::Skipped, id, "deprecated");
                continue;
            }
            if self.backends.get(&model.provider).is_err() {
                let reason = format!("no backend for provider {}", model.provider);
                trail.push(TrailStep::Skipped, id, reason);
                continue;
            }

            let status = match self.health.admission(id) {
                Admission::Admit(status) => status,
                Admission::Trial => {
                    debug!(model = id, "Admitting model for half-open trial");
                    HealthStatus::Unavailable
                }
                Admission::BreakerOpen { retry_in } => {
                    trail.push(
                        TrailStep::Skipped,
                        id,
                        format!("breaker open, retry in {}s", retry_in.as_secs()),
                    );
                    continue;
                }
                Admission::TrialInFlight => {
                    trail.push(TrailStep::Skipped, id, "half-open trial already in flight");
                    continue;
                }
                Admission::Unavailable => {
                    trail.push(TrailStep::Skipped, id, "unavailable");
                    continue;
                }
            };

            let missing: Vec<String> = ctx
                .required_capabilities
                .iter()
                .filter(|c| !model.supports(**c))
                .map(|c| c.to_string())
                .collect();
            if !missing.is_empty() {
                trail.push(TrailStep::Skipped, id, format!("missing {}", missing.join(", ")));
                continue;
            }

            if input_tokens > model.context_window {
                trail.push(
                    TrailStep::Skipped,
                    id,
                    format!(
                        "input of ~{} tokens exceeds context window {}",
                        input_tokens, model.context_window
                    ),
                );
                continue;
            }

            let reference_cost =
                estimate_cost(&self.catalog, id, workload.input_tokens, workload.output_tokens)
                    .filter(|c| c.is_finite() && *c >= 0.0);
            if let Some(budget) = ctx.budget {
                match reference_cost {
                    Some(cost) if cost > budget => {
                        trail.push(
                            TrailStep::Skipped,
                            id,
                            format!("reference cost ${:.4} exceeds budget ${:.4}", cost, budget),
                        );
                        continue;
                    }
                    None if settings.unknown_cost == UnknownCostPolicy::Reject => {
                        trail.push(TrailStep::Skipped, id, "unknown cost, cannot verify budget");
                        continue;
                    }
                    _ => {}
                }
            }

            let avg_latency_ms = self.health.avg_latency_ms(id);
            if let (Some(max), Some(avg)) = (ctx.max_latency_ms, avg_latency_ms) {
                if avg > max as f64 {
                    trail.push(
                        TrailStep::Skipped,
                        id,
                        format!("average latency {:.0}ms above {}ms", avg, max),
                    );
                    continue;
                }
            }

            candidates.push(Candidate {
                model,
                status,
                avg_latency_ms,
                reference_cost,
            });
        }

        candidates
    }

    async fn execute_with_retry(
        &self,
        model: &Model,
        request: &ProviderRequest,
        retry: &RetryPolicy,
        trail: &mut DecisionTrail,
    ) -> Result<Attempted, Exhausted> {
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.call_once(model, request, retry.call_timeout()).await {
                Ok(reply) => {
                    let detail = format!("attempt {}", attempt);
                    trail.push(TrailStep::Succeeded, model.id.as_str(), detail);
                    return Ok(Attempted {
                        reply,
                        failures: attempt - 1,
                    });
                }
                Err(error) => {
                    trail.push(
                        TrailStep::Failed,
                        model.id.as_str(),
                        format!("attempt {}: {}", attempt, error),
                    );
                    if !error.is_retryable() || attempt >= max_attempts {
                        return Err(Exhausted {
                            error,
                            failures: attempt,
                        });
                    }
                    let delay = retry.backoff(attempt);
                    debug!(
                        model = %model.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One provider call: rate limit, in-flight accounting, timeout, health update
    async fn call_once(
        &self,
        model: &Model,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let backend = match self
            .limiter
            .acquire(model)
            .and_then(|()| self.backends.get(&model.provider))
        {
            Ok(backend) => backend,
            Err(e) => {
                // No call was made, so a claimed half-open trial goes back
                self.health.release_trial(&model.id);
                self.metrics.record_attempt_failure(&model.id, &model.provider);
                return Err(e);
            }
        };
        let _in_flight = self.selector.begin_call(&model.id);

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, backend.invoke(model, request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = self.health.record_outcome(&model.id, result.is_ok(), latency_ms);
        if let Err(e) = &result {
            self.metrics.record_attempt_failure(&model.id, &model.provider);
            warn!(
                model = %model.id,
                provider = %model.provider,
                %status,
                error = %e,
                "Provider call failed"
            );
        }
        result
    }

    /// Run `strategy` over `candidates`, passing over half-open models whose
    /// single trial call another request already holds
    fn select_admitted<'a>(
        &self,
        strategy: LoadBalancingStrategy,
        mut candidates: Vec<Candidate<'a>>,
        settings: &RouterSettings,
        trail: &mut DecisionTrail,
    ) -> Option<(&'a Model, String)> {
        loop {
            let selection = self.selector.select(
                strategy,
                &candidates,
                &settings.weights,
                &settings.model_weights,
            )?;
            let candidate = candidates.remove(selection.index);
            if self.health.claim_trial(&candidate.model.id) {
                return Some((candidate.model, selection.reason));
            }
            trail.push(
                TrailStep::Skipped,
                candidate.model.id.as_str(),
                "half-open trial already in flight",
            );
        }
    }

    /// Providers to search for a fallback model, best first
    fn fallback_order(
        &self,
        request: &RoutingRequest,
        settings: &RouterSettings,
        primary_provider: &str,
    ) -> Vec<String> {
        let hinted = request.context.fallback_provider.iter().cloned();
        let configured = settings.fallback_providers.iter().cloned();
        let remaining = self.catalog.providers().into_iter().map(String::from);

        let mut order: Vec<String> = Vec::new();
        for provider in hinted.chain(configured).chain(remaining) {
            if provider != primary_provider && !order.contains(&provider) {
                order.push(provider);
            }
        }
        order.push(primary_provider.to_string());
        order
    }

    fn select_fallback(
        &self,
        request: &RoutingRequest,
        settings: &RouterSettings,
        failed: &Model,
        input_tokens: usize,
        trail: &mut DecisionTrail,
    ) -> Option<&Model> {
        // Exclusions were already recorded during primary selection
        let mut scratch = DecisionTrail::new();
        let candidates =
            self.eligible(request, settings, input_tokens, Some(&failed.id), &mut scratch);

        for provider in self.fallback_order(request, settings, &failed.provider) {
            let pool: Vec<Candidate<'_>> = candidates
                .iter()
                .filter(|c| c.model.provider == provider)
                .cloned()
                .collect();
            let strategy = LoadBalancingStrategy::CostOptimized;
            if let Some((model, reason)) = self.select_admitted(strategy, pool, settings, trail) {
                trail.push(
                    TrailStep::Fallback,
                    model.id.as_str(),
                    format!("provider {}, {}", provider, reason),
                );
                return Some(model);
            }
        }

        trail.push(TrailStep::Fallback, failed.id.as_str(), "no eligible fallback model");
        None
    }
}

/// Narrow to preferred model/provider when the hint matches an eligible model
fn apply_hints<'a>(
    mut candidates: Vec<Candidate<'a>>,
    ctx: &RoutingContext,
    trail: &mut DecisionTrail,
) -> Vec<Candidate<'a>> {
    if let Some(model_id) = &ctx.preferred_model {
        if candidates.iter().any(|c| &c.model.id == model_id) {
            candidates.retain(|c| &c.model.id == model_id);
        } else {
            trail.push(
                TrailStep::Skipped,
                model_id.as_str(),
                "preferred model not eligible, hint ignored",
            );
        }
    }

    if let Some(provider) = &ctx.preferred_provider {
        if candidates.iter().any(|c| &c.model.provider == provider) {
            candidates.retain(|c| &c.model.provider == provider);
        } else {
            trail.push(
                TrailStep::Skipped,
                provider.as_str(),
                "preferred provider has no eligible model, hint ignored",
            );
        }
    }

    candidates
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
