//! Configuration management for the router
//!
//! Supports configuration via:
//! 1. Config file (~/.config/model-router/config.toml)
//! 2. Environment variables (MODEL_ROUTER_STRATEGY, OPENAI_API_KEY, ANTHROPIC_API_KEY, etc.)
//! 3. CLI arguments (override file/env settings)

use crate::api::{ApiFormat, BackendRegistry, HttpBackend, ProviderEndpoint};
use crate::cache::{CacheConfig, MAX_TTL};
use crate::catalog::{Model, ModelCatalog};
use crate::health::HealthConfig;
use crate::router::{
    CacheTtls, LoadBalancingStrategy, ReferenceWorkload, RetryPolicy, RouterSettings,
    RoutingRule, RuleAction, ScoreWeights, UnknownCostPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Selection, fallback and caching policy
    pub router: RouterSection,

    /// Routing rules, evaluated by descending priority
    pub rules: Vec<RoutingRule>,

    /// Response cache limits and TTLs
    pub cache: CacheSection,

    /// Circuit breaker thresholds
    pub breaker: BreakerSettings,

    /// Per-model retry policy
    pub retry: RetryPolicy,

    /// Health window and background probe
    pub health: HealthSettings,

    /// HTTP provider endpoints
    pub providers: Vec<ProviderSettings>,

    /// Catalog overrides; entries replace built-in models with the same id
    pub models: Vec<Model>,
}

/// Which token estimator the router uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    Heuristic,
    Tiktoken,
}

/// `[router]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// round_robin, weighted, least_connections, response_time, cost_optimized
    pub strategy: LoadBalancingStrategy,

    /// Fallback provider order
    pub fallback_providers: Vec<String>,

    /// Responses cheaper than this (USD) are cached
    pub cache_cost_threshold: f64,

    /// Whether models of unknown cost pass a budget check
    pub unknown_cost: UnknownCostPolicy,

    pub default_max_output_tokens: u32,

    /// Average latency above which a model counts as degraded
    pub degraded_latency_ms: f64,

    /// Start from the built-in model catalog
    pub builtin_catalog: bool,

    pub estimator: EstimatorKind,

    pub reference_workload: ReferenceWorkload,

    /// Cost-optimized score weights
    pub weights: ScoreWeights,

    /// Per-model weights for the weighted strategy
    pub model_weights: HashMap<String, f64>,
}

impl Default for RouterSection {
    fn default() -> Self {
        let settings = RouterSettings::default();
        Self {
            strategy: settings.strategy,
            fallback_providers: vec!["anthropic".to_string(), "openai".to_string()],
            cache_cost_threshold: settings.cache_cost_threshold,
            unknown_cost: settings.unknown_cost,
            default_max_output_tokens: settings.default_max_output_tokens,
            degraded_latency_ms: HealthConfig::default().degraded_latency_ms,
            builtin_catalog: true,
            estimator: EstimatorKind::default(),
            reference_workload: settings.reference_workload,
            weights: settings.weights,
            model_weights: HashMap::new(),
        }
    }
}

/// `[cache]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: usize,

    /// Maximum stored bytes across all entries
    pub max_bytes: usize,

    /// Serialized values larger than this are gzip-compressed
    pub compression_threshold: usize,

    /// How often expired entries are swept
    pub sweep_interval_secs: u64,

    /// TTL per operation kind, in seconds
    pub ttl: CacheTtls,
}

impl Default for CacheSection {
    fn default() -> Self {
        let limits = CacheConfig::default();
        Self {
            max_entries: limits.max_entries,
            max_bytes: limits.max_bytes,
            compression_threshold: limits.compression_threshold,
            sweep_interval_secs: 60,
            ttl: CacheTtls::default(),
        }
    }
}

/// `[breaker]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// Seconds the breaker stays open
    pub cooldown_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

/// `[health]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Latency samples in the moving average
    pub window_size: usize,

    /// Run the background probe
    pub probe_enabled: bool,

    pub probe_interval_secs: u64,

    pub probe_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            window_size: 10,
            probe_enabled: true,
            probe_interval_secs: 60,
            probe_timeout_secs: 10,
        }
    }
}

/// One `[[providers]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider name, matching `provider` on catalog models
    pub name: String,

    pub format: ApiFormat,

    pub base_url: String,

    /// API key (prefer `api_key_env`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable the API key is read from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderSettings {
    pub fn new(name: impl Into<String>, format: ApiFormat, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format,
            base_url: base_url.into(),
            api_key: None,
            api_key_env: None,
            temperature: None,
            enabled: true,
        }
    }

    fn with_key_env(mut self, var: &str) -> Self {
        self.api_key_env = Some(var.to_string());
        self
    }

    /// Enabled, and either keyless or holding a key
    pub fn is_usable(&self) -> bool {
        self.enabled && (self.api_key.is_some() || self.api_key_env.is_none())
    }

    pub fn endpoint(&self) -> ProviderEndpoint {
        ProviderEndpoint {
            name: self.name.clone(),
            format: self.format,
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            temperature: self.temperature,
        }
    }
}

impl Config {
    /// Built-in provider endpoints for the built-in catalog
    pub fn default_providers() -> Vec<ProviderSettings> {
        vec![
            ProviderSettings::new("openai", ApiFormat::OpenAI, "https://api.openai.com/v1")
                .with_key_env("OPENAI_API_KEY"),
            ProviderSettings::new("anthropic", ApiFormat::Anthropic, "https://api.anthropic.com/v1")
                .with_key_env("ANTHROPIC_API_KEY"),
            ProviderSettings::new(
                "google",
                ApiFormat::OpenAI,
                "https://generativelanguage.googleapis.com/v1beta/openai",
            )
            .with_key_env("GEMINI_API_KEY"),
        ]
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("model-router")
            .join("config.toml")
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from specific path. A missing file yields the defaults.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::with_defaults().with_env_overrides());
        }

        let content = std::fs::read_to_string(&path)?;
        Ok(Self::from_toml(&content)?.with_env_overrides())
    }

    /// Parse a config document. Built-in providers are used when none are listed.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        if config.providers.is_empty() {
            config.providers = Self::default_providers();
        }
        Ok(config)
    }

    /// Defaults including the built-in providers
    pub fn with_defaults() -> Self {
        Self {
            providers: Self::default_providers(),
            ..Self::default()
        }
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(strategy) = std::env::var("MODEL_ROUTER_STRATEGY") {
            match strategy.parse() {
                Ok(strategy) => self.router.strategy = strategy,
                Err(e) => warn!(error = %e, "Ignoring MODEL_ROUTER_STRATEGY"),
            }
        }
        if let Ok(providers) = std::env::var("MODEL_ROUTER_FALLBACK_PROVIDERS") {
            self.router.fallback_providers = providers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        for provider in &mut self.providers {
            if let Some(var) = &provider.api_key_env {
                if let Ok(key) = std::env::var(var) {
                    provider.api_key = Some(key);
                }
            }
        }

        self
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to specific path
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.multiplier < 1.0 {
            return invalid(format!(
                "retry.multiplier must be >= 1.0 so delays never shrink, got {}",
                self.retry.multiplier
            ));
        }
        if self.retry.call_timeout_ms == 0 {
            return invalid("retry.call_timeout_ms must be positive".into());
        }
        if self.cache.max_entries == 0 || self.cache.max_bytes == 0 {
            return invalid("cache limits must be positive".into());
        }
        let max_ttl = MAX_TTL.as_secs();
        let ttl = &self.cache.ttl;
        let ttls = [
            ("chat", ttl.chat),
            ("completion", ttl.completion),
            ("analysis", ttl.analysis),
            ("creative", ttl.creative),
            ("code", ttl.code),
            ("reasoning", ttl.reasoning),
        ];
        for (operation, secs) in ttls {
            if secs > max_ttl {
                return invalid(format!(
                    "cache.ttl.{} is {}s, the limit is {}s",
                    operation, secs, max_ttl
                ));
            }
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1".into());
        }
        if self.breaker.cooldown_secs > max_ttl {
            return invalid(format!(
                "breaker.cooldown_secs is {}, the limit is {}",
                self.breaker.cooldown_secs, max_ttl
            ));
        }
        if self.health.window_size == 0 {
            return invalid("health.window_size must be at least 1".into());
        }
        if self.router.cache_cost_threshold < 0.0 {
            return invalid("router.cache_cost_threshold must be non-negative".into());
        }

        let w = &self.router.weights;
        if [w.cost, w.quality, w.speed, w.health, w.latency]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return invalid("router.weights must be non-negative numbers".into());
        }
        if !w.is_ordered() {
            warn!("router.weights do not rank cost > quality > speed > health > latency");
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return invalid(format!("duplicate provider '{}'", provider.name));
            }
            if provider.base_url.trim().is_empty() {
                return invalid(format!("provider '{}' has no base_url", provider.name));
            }
        }

        let mut rule_names = HashSet::new();
        for rule in &self.rules {
            if !rule_names.insert(rule.name.as_str()) {
                return invalid(format!("duplicate rule '{}'", rule.name));
            }
            if let RuleAction::ForceCache {
                ttl_secs: Some(secs),
            } = rule.action
            {
                if secs > max_ttl {
                    return invalid(format!(
                        "rule '{}' caches for {}s, the limit is {}s",
                        rule.name, secs, max_ttl
                    ));
                }
            }
        }

        if !self.providers.iter().any(ProviderSettings::is_usable) {
            return Err(ConfigError::MissingRequired(
                "At least one provider must be usable \
                 (set OPENAI_API_KEY, ANTHROPIC_API_KEY or GEMINI_API_KEY)"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Runtime router settings derived from this config
    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            strategy: self.router.strategy,
            weights: self.router.weights,
            model_weights: self.router.model_weights.clone(),
            fallback_providers: self.router.fallback_providers.clone(),
            cache_cost_threshold: self.router.cache_cost_threshold,
            reference_workload: self.router.reference_workload,
            unknown_cost: self.router.unknown_cost,
            default_max_output_tokens: self.router.default_max_output_tokens,
            retry: self.retry,
            cache_ttl: self.cache.ttl,
            rules: self.rules.clone(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache.max_entries,
            max_bytes: self.cache.max_bytes,
            compression_threshold: self.cache.compression_threshold,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            window_size: self.health.window_size,
            degraded_latency_ms: self.router.degraded_latency_ms,
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
        }
    }

    /// Built-in catalog (if enabled) with `[[models]]` entries applied on top
    pub fn catalog(&self) -> ModelCatalog {
        let mut catalog = if self.router.builtin_catalog {
            ModelCatalog::builtin()
        } else {
            ModelCatalog::new()
        };
        for model in &self.models {
            catalog.upsert(model.clone());
        }
        catalog
    }

    /// HTTP backends for every usable provider
    pub fn backends(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        for provider in &self.providers {
            if provider.is_usable() {
                registry.register(Arc::new(HttpBackend::new(provider.endpoint())));
            } else if provider.enabled {
                warn!(provider = %provider.name, "Provider has no API key, skipping");
            }
        }
        registry
    }

    /// Generate example config content
    pub fn example() -> String {
        let mut example = Config::with_defaults();
        example.rules = vec![RoutingRule::new(
            "block-private-keys",
            100,
            crate::router::RuleCondition::InputContains {
                pattern: "BEGIN PRIVATE KEY".to_string(),
                case_sensitive: true,
            },
            crate::router::RuleAction::Reject {
                reason: "request contains key material".to_string(),
            },
        )];
        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

/// Builder for creating Config programmatically
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::with_defaults(),
        }
    }

    pub fn strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.config.router.strategy = strategy;
        self
    }

    pub fn fallback_providers(mut self, providers: &[&str]) -> Self {
        self.config.router.fallback_providers = providers.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn cache_cost_threshold(mut self, threshold: f64) -> Self {
        self.config.router.cache_cost_threshold = threshold;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn cooldown_secs(mut self, secs: u64) -> Self {
        self.config.breaker.cooldown_secs = secs;
        self
    }

    pub fn max_cache_entries(mut self, entries: usize) -> Self {
        self.config.cache.max_entries = entries;
        self
    }

    pub fn api_key(mut self, provider: &str, key: impl Into<String>) -> Self {
        let key = key.into();
        if let Some(p) = self.config.providers.iter_mut().find(|p| p.name == provider) {
            p.api_key = Some(key);
        }
        self
    }

    pub fn provider(mut self, provider: ProviderSettings) -> Self {
        self.config.providers.retain(|p| p.name != provider.name);
        self.config.providers.push(provider);
        self
    }

    pub fn rule(mut self, rule: RoutingRule) -> Self {
        self.config.rules.push(rule);
        self
    }

    pub fn model(mut self, model: Model) -> Self {
        self.config.models.push(model);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Pricing;
    use crate::router::RuleCondition;

    #[test]
    fn test_default_config() {
        let config = Config::with_defaults();
        assert_eq!(config.router.strategy, LoadBalancingStrategy::CostOptimized);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.providers.len(), 3);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .strategy(LoadBalancingStrategy::RoundRobin)
            .api_key("anthropic", "test-key")
            .max_attempts(5)
            .model(Model::new("local-llama", "anthropic", Pricing::new(0.0, 0.0)))
            .build();

        assert_eq!(config.router.strategy, LoadBalancingStrategy::RoundRobin);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
        assert!(config.catalog().get("local-llama").is_some());
        assert_eq!(config.backends().providers(), vec!["anthropic"]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ConfigBuilder::new()
            .api_key("openai", "k")
            .max_attempts(0)
            .build();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::with_defaults();
        for provider in &mut config.providers {
            provider.api_key = None;
        }
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired(_))));
    }

    #[test]
    fn test_validate_rejects_absurd_ttls() {
        let mut config = ConfigBuilder::new().api_key("openai", "k").build();
        assert!(config.validate().is_ok());

        config.cache.ttl.code = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("code")));
        config.cache.ttl.code = MAX_TTL.as_secs();
        assert!(config.validate().is_ok());

        config.breaker.cooldown_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.breaker.cooldown_secs = 60;

        config.rules.push(RoutingRule::new(
            "pin-forever",
            1,
            RuleCondition::Always,
            RuleAction::ForceCache {
                ttl_secs: Some(u64::MAX),
            },
        ));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("pin-forever")));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [router]
            strategy = "least_connections"

            [retry]
            max_attempts = 2

            [cache.ttl]
            analysis = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.router.strategy, LoadBalancingStrategy::LeastConnections);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_backoff_ms, 1000);
        assert_eq!(config.cache.ttl.analysis, 60);
        assert_eq!(config.cache.ttl.chat, 300);
        assert_eq!(config.providers.len(), 3);

        let settings = config.router_settings();
        assert_eq!(settings.retry.max_attempts, 2);
    }

    #[test]
    fn test_example_config_round_trips() {
        let example = Config::example();
        assert!(example.contains("[router]"));
        assert!(example.contains("[[providers]]"));

        let parsed = Config::from_toml(&example).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.providers.len(), 3);
    }
}
