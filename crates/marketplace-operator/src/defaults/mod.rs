//! Default sources and the `OperatorHub` controller
//!
//! The operator ships a directory of default `OperatorSource` and
//! `CatalogSource` definitions. The cluster-scoped `OperatorHub` named
//! `cluster` decides which of them are enabled; [`Restorer`] creates the
//! enabled ones, puts drifted ones back and deletes disabled ones it created.

mod hub;
mod loader;
mod restorer;

pub use hub::{HubConfig, OPERATOR_HUB_NAME};
pub use loader::{load_dir, parse_definition, DefaultDefinition};
pub use restorer::{Restorer, MANAGED_ANNOTATION, STATUS_ERROR, STATUS_SUCCESS};

use crate::controller::backoff;
use crate::crd::{OperatorHub, OperatorHubStatus};
use crate::error::{OperatorError, Result};
use crate::kube_client::Kube;
use crate::metrics::ControllerMetrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Context passed to the OperatorHub controller
pub struct Context {
    pub kube: Kube,
    pub restorer: Arc<Restorer>,
    pub metrics: Option<ControllerMetrics>,
    pub error_counts: dashmap::DashMap<String, u32>,
}

impl Context {
    pub fn new(kube: Kube, restorer: Arc<Restorer>) -> Self {
        Self {
            kube,
            restorer,
            metrics: None,
            error_counts: dashmap::DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Apply `hub` to the defaults and record the per-source outcome
pub async fn sync(ctx: &Context, hub: &OperatorHub) -> Result<OperatorHubStatus> {
    if hub.name_any() != OPERATOR_HUB_NAME {
        debug!(name = %hub.name_any(), "ignoring OperatorHub that is not the cluster singleton");
        return Ok(hub.status.clone().unwrap_or_default());
    }

    ctx.restorer.hub().set(&hub.spec);
    let status = OperatorHubStatus {
        sources: ctx.restorer.ensure_all().await,
    };
    if hub.status.as_ref() != Some(&status) {
        let mut updated = hub.clone();
        updated.status = Some(status.clone());
        ctx.kube.update_status(&updated).await?;
        info!(
            disabled = status.sources.iter().filter(|s| s.disabled).count(),
            total = status.sources.len(),
            "OperatorHub status updated"
        );
    }
    Ok(status)
}

#[instrument(skip(hub, ctx), fields(name = %hub.name_any()))]
pub async fn reconcile(hub: Arc<OperatorHub>, ctx: Arc<Context>) -> Result<Action> {
    let start = std::time::Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = sync(&ctx, &hub).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(status) => {
            ctx.error_counts.remove(&hub.name_any());
            // a failed default is retried like a failed reconcile
            match status.sources.iter().find(|s| s.status == STATUS_ERROR) {
                Some(failed) => Err(OperatorError::Internal(format!(
                    "default source {} could not be ensured: {}",
                    failed.name,
                    failed.message.clone().unwrap_or_default()
                ))),
                None => Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))),
            }
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

pub fn error_policy(hub: Arc<OperatorHub>, error: &OperatorError, ctx: Arc<Context>) -> Action {
    backoff(&ctx.error_counts, &hub.name_any(), error)
}
