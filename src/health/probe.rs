//! Background health probing, so models recover without waiting for traffic

use super::HealthRegistry;
use crate::api::BackendRegistry;
use crate::catalog::ModelCatalog;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome counts for one probe round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub failed: usize,
    /// Models whose provider has no registered backend
    pub skipped: usize,
}

/// Exercise every non-deprecated catalog model once and record the outcomes
pub async fn probe_once(
    registry: &HealthRegistry,
    catalog: &ModelCatalog,
    backends: &BackendRegistry,
    timeout: Duration,
) -> ProbeReport {
    let mut report = ProbeReport::default();
    let mut checks = Vec::new();

    for model in catalog.models().iter().filter(|m| !m.deprecated) {
        let Ok(backend) = backends.get(&model.provider) else {
            report.skipped += 1;
            continue;
        };
        checks.push(async move {
            let started = Instant::now();
            let result = tokio::time::timeout(timeout, backend.health_check(model)).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            (model.id.as_str(), matches!(result, Ok(Ok(()))), latency_ms)
        });
    }

    for (model_id, success, latency_ms) in join_all(checks).await {
        registry.record_outcome(model_id, success, latency_ms);
        report.probed += 1;
        if !success {
            report.failed += 1;
            debug!(model = model_id, "Health probe failed");
        }
    }

    report
}

/// Spawn the periodic probe. The first round runs one `period` after start.
pub fn spawn_probe(
    registry: Arc<HealthRegistry>,
    catalog: Arc<ModelCatalog>,
    backends: BackendRegistry,
    period: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = probe_once(&registry, &catalog, &backends, timeout).await;
                    info!(
                        probed = report.probed,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Health probe complete"
                    );
                }
            }
        }
    })
}
