//! model-router - Route AI requests across providers by cost, quality and health
//!
//! This library sits between an application and several hosted model providers.
//! Each request is matched against routing rules, served from a response cache
//! when possible, and otherwise sent to the best eligible model with retries and
//! cross-provider fallback.
//!
//! ## Key Features
//!
//! - **Routing Rules**: Reject, pin or reshape requests before selection
//! - **Response Caching**: TTL-bound, size-capped cache keyed by request fingerprint
//! - **Circuit Breakers**: Failing models are skipped until their cooldown elapses
//! - **Load Balancing**: Cost-optimized scoring, round-robin, weighted and more
//! - **Usage Accounting**: Per-request token and cost records plus aggregate metrics

pub mod api;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod estimator;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod router;
pub mod usage;

pub use api::{BackendRegistry, HttpBackend, ModelBackend, Payload, ProviderError};
pub use cache::{CacheConfig, CacheMetrics, ResponseCache};
pub use catalog::{Capability, Model, ModelCatalog, Pricing};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use estimator::{HeuristicEstimator, TiktokenEstimator, TokenEstimator};
pub use health::{HealthConfig, HealthRegistry, HealthStatus};
pub use metrics::{MetricsSummary, MetricsTracker};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use router::{
    LoadBalancingStrategy, OperationKind, Router, RouterSettings, RoutingContext, RoutingError,
    RoutingRequest, RoutingResponse, RoutingRule,
};
pub use usage::{InMemoryLedger, UsageLedger, UsageRecord};
