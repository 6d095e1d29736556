//! Service lifecycle: builds the router and owns its background tasks
//!
//! Nothing in the crate is a global. The process entry point constructs one
//! [`Orchestrator`], routes through [`Orchestrator::router`], and calls
//! [`Orchestrator::shutdown`] to cancel and join the cache sweeper and the
//! health probe.

use crate::api::BackendRegistry;
use crate::cache::{spawn_sweeper, ResponseCache};
use crate::catalog::ModelCatalog;
use crate::config::{Config, ConfigError, EstimatorKind};
use crate::estimator::{HeuristicEstimator, TiktokenEstimator, TokenEstimator};
use crate::health::{spawn_probe, HealthRegistry};
use crate::router::Router;
use crate::usage::{InMemoryLedger, UsageLedger};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Background task periods
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `None` disables the expiry sweep
    pub sweep_interval: Option<Duration>,
    /// `None` disables the health probe
    pub probe_interval: Option<Duration>,
    pub probe_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Some(Duration::from_secs(60)),
            probe_interval: Some(Duration::from_secs(60)),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            sweep_interval: secs(config.cache.sweep_interval_secs),
            probe_interval: if config.health.probe_enabled {
                secs(config.health.probe_interval_secs)
            } else {
                None
            },
            probe_timeout: Duration::from_secs(config.health.probe_timeout_secs.max(1)),
        }
    }
}

/// Owns a [`Router`] plus the tasks that keep its cache and health state fresh
pub struct Orchestrator {
    router: Arc<Router>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Build everything from a loaded config and start background tasks
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let estimator: Arc<dyn TokenEstimator> = match config.router.estimator {
            EstimatorKind::Heuristic => Arc::new(HeuristicEstimator::default()),
            EstimatorKind::Tiktoken => Arc::new(
                TiktokenEstimator::new().map_err(|e| ConfigError::Invalid(e.to_string()))?,
            ),
        };

        let router = Router::new(Arc::new(config.catalog()), config.backends())
            .with_health(Arc::new(HealthRegistry::new(config.health_config())))
            .with_cache(Arc::new(ResponseCache::new(config.cache_config())))
            .with_ledger(Arc::new(InMemoryLedger::new()))
            .with_estimator(estimator)
            .with_settings(config.router_settings());

        Ok(Self::start(router, OrchestratorConfig::from_config(config)))
    }

    /// Build a router over the given catalog and backends with default settings
    pub fn with_backends(
        catalog: ModelCatalog,
        backends: BackendRegistry,
        ledger: Arc<dyn UsageLedger>,
        config: OrchestratorConfig,
    ) -> Self {
        let router = Router::new(Arc::new(catalog), backends).with_ledger(ledger);
        Self::start(router, config)
    }

    /// Take ownership of `router` and spawn its background tasks
    pub fn start(router: Router, config: OrchestratorConfig) -> Self {
        let router = Arc::new(router);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        if let Some(period) = config.sweep_interval {
            tasks.push(spawn_sweeper(
                Arc::clone(router.cache()),
                period,
                cancel.child_token(),
            ));
        }

        if let Some(period) = config.probe_interval {
            tasks.push(spawn_probe(
                Arc::clone(router.health()),
                Arc::clone(router.catalog()),
                router.backends().clone(),
                period,
                config.probe_timeout,
                cancel.child_token(),
            ));
        }

        info!(
            models = router.catalog().len(),
            providers = router.backends().providers().len(),
            background_tasks = tasks.len(),
            "Router started"
        );

        Self {
            router,
            cancel,
            tasks,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Cancel background tasks and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ModelBackend, ProviderError, ProviderReply, ProviderRequest};
    use crate::catalog::{Model, Pricing};
    use crate::router::{OperationKind, RoutingRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl ModelBackend for CountingBackend {
        async fn invoke(
            &self,
            model: &Model,
            _request: &ProviderRequest,
        ) -> Result<ProviderReply, ProviderError> {
            Ok(ProviderReply::new("pong", model.id.clone()))
        }

        async fn health_check(&self, _model: &Model) -> Result<(), ProviderError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn provider(&self) -> &str {
            "p1"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_run_until_shutdown() {
        let backend = Arc::new(CountingBackend {
            probes: AtomicUsize::new(0),
        });
        let catalog =
            ModelCatalog::from_models([Model::new("m1", "p1", Pricing::new(0.001, 0.001))]);
        let ledger = Arc::new(InMemoryLedger::new());
        let orchestrator = Orchestrator::with_backends(
            catalog,
            BackendRegistry::new().with(backend.clone()),
            ledger.clone(),
            OrchestratorConfig::default(),
        );

        let response = orchestrator
            .router()
            .route(RoutingRequest::new("ping", OperationKind::Chat))
            .await
            .unwrap();
        assert_eq!(response.model_id, "m1");
        assert_eq!(ledger.len().await, 1);

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(backend.probes.load(Ordering::SeqCst), 2);

        // Chat entries live 300s; the sweeper removes them without any access
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(orchestrator.router().cache().is_empty());

        orchestrator.shutdown().await;
    }
}
