//! CatalogSourceConfig controller
//!
//! Publishes a user-selected set of packages into a target namespace:
//! `Initial → Configuring → Succeeded`. Packages that cannot be resolved or
//! bundled keep the object in `Configuring` with a message until the
//! datastore catches up.

mod cache;
mod phases;
mod resolver;
mod trigger;

pub use cache::CscCache;
pub use phases::{reconciler_for, PhaseOutcome, PhaseReconciler};
pub use resolver::{resolve, Resolution};
pub use trigger::{trigger_package_updates, UPDATE_MESSAGE};

use crate::clock::Clock;
use crate::config::OperatorConfig;
use crate::controller::backoff;
use crate::crd::{CatalogSourceConfig, PhasedResource};
use crate::datastore::Datastore;
use crate::error::{OperatorError, Result};
use crate::kube_client::Kube;
use crate::metrics::ControllerMetrics;
use crate::phase::{NextPhase, PhaseName, PhaseTransitioner, Transitioner};
use crate::registry::RegistryEnsurer;
use crate::status::SyncCounters;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use phases::{owner_of, Updated};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub const FINALIZER_NAME: &str = "finalizer.catalogsourceconfigs.operators.coreos.com";

const PROGRESS_REQUEUE_SECONDS: u64 = 5;

/// Retry interval while packages are unresolved
const CONFIGURING_REQUEUE_SECONDS: u64 = 60;

const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Context passed to the CatalogSourceConfig controller
pub struct Context {
    pub kube: Kube,
    pub datastore: Arc<Datastore>,
    pub registry: RegistryEnsurer,
    pub transitioner: Arc<dyn Transitioner>,
    pub counters: Arc<SyncCounters>,
    pub cache: CscCache,
    pub config: OperatorConfig,
    pub metrics: Option<ControllerMetrics>,
    pub error_counts: dashmap::DashMap<String, u32>,
}

impl Context {
    pub fn new(
        kube: Kube,
        datastore: Arc<Datastore>,
        clock: Arc<dyn Clock>,
        counters: Arc<SyncCounters>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            registry: RegistryEnsurer::new(kube.clone(), clock.clone(), config.namespace.clone()),
            transitioner: Arc::new(PhaseTransitioner::new(clock)),
            kube,
            datastore,
            counters,
            cache: CscCache::new(),
            config,
            metrics: None,
            error_counts: dashmap::DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

async fn ensure_finalizer(ctx: &Context, csc: CatalogSourceConfig) -> Result<CatalogSourceConfig> {
    if csc.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        return Ok(csc);
    }
    let mut finalizers = csc.finalizers().to_vec();
    finalizers.push(FINALIZER_NAME.to_string());
    ctx.kube.set_finalizers(&csc, &finalizers).await
}

/// Delete children from the target namespace and wherever they were last
/// published, then release the finalizer
async fn finalize(ctx: &Context, csc: CatalogSourceConfig) -> Result<()> {
    let owner = owner_of(&csc);
    info!(name = %owner.name, namespace = %owner.namespace, "cleaning up catalog source config");

    let mut namespaces = vec![csc.spec.target_namespace.clone()];
    if let Some(previous) = ctx.cache.evict(&csc.uid().unwrap_or_default()) {
        namespaces.push(previous.target_namespace);
    }
    if let Some(published) = csc.status.as_ref().and_then(|s| s.last_published.as_ref()) {
        namespaces.push(published.target_namespace.clone());
    }
    namespaces.sort();
    namespaces.dedup();

    let mut errors = Vec::new();
    for namespace in namespaces.iter().filter(|ns| !ns.is_empty()) {
        if let Err(e) = ctx.registry.delete_children(&owner, namespace).await {
            errors.push(e);
        }
    }
    if let Some(e) = OperatorError::aggregate(errors) {
        return Err(e);
    }

    if csc.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        let remaining: Vec<String> = csc
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER_NAME)
            .cloned()
            .collect();
        ctx.kube.set_finalizers(&csc, &remaining).await?;
    }
    Ok(())
}

async fn persist(ctx: &Context, mut csc: CatalogSourceConfig, next: Option<&NextPhase>) -> Result<PhaseName> {
    let before = csc.status.clone();
    let generation = csc.metadata.generation;
    let status = csc.status.get_or_insert_with(Default::default);
    let transitioned = next.is_some_and(|next| {
        ctx.transitioner
            .transition(&mut status.current_phase.phase, next)
    });
    status.observed_generation = generation;
    let phase = status.current_phase.phase.name;

    if csc.status != before {
        ctx.kube.update_status(&csc).await?;
        if transitioned {
            ctx.counters.record(phase == PhaseName::Failed);
            debug!(name = %csc.name_any(), phase = %phase, "phase persisted");
        }
    }
    Ok(phase)
}

/// Whether the spec moved on from what was published or last reconciled
///
/// The generation check covers objects that failed before anything was
/// published; those have no snapshot to compare against.
fn updated(ctx: &Context, csc: &CatalogSourceConfig) -> Option<Updated> {
    if csc.phase_name() == PhaseName::Initial {
        return None;
    }
    if let Some(previous) = ctx.cache.changed(csc) {
        return Some(Updated {
            previous: Some(previous),
        });
    }
    let observed = csc.status.as_ref().and_then(|s| s.observed_generation);
    observed
        .is_some_and(|observed| Some(observed) != csc.metadata.generation)
        .then(|| Updated {
            previous: ctx.cache.published(csc),
        })
}

/// Run one reconciliation of `csc` and return the phase it ends in
pub async fn sync(ctx: &Context, csc: CatalogSourceConfig) -> Result<PhaseName> {
    if csc.metadata.deletion_timestamp.is_some() {
        let phase = csc.phase_name();
        finalize(ctx, csc).await?;
        return Ok(phase);
    }

    let csc = ensure_finalizer(ctx, csc).await?;
    let outcome = match updated(ctx, &csc) {
        Some(updated) => updated.reconcile(ctx, csc).await,
        None => reconciler_for(csc.phase_name()).reconcile(ctx, csc).await,
    };

    let phase = persist(ctx, outcome.csc, outcome.next.as_ref()).await?;
    match outcome.error {
        Some(error) => Err(error),
        None => Ok(phase),
    }
}

fn action_for(phase: PhaseName) -> Action {
    match phase {
        PhaseName::Succeeded => Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)),
        PhaseName::Failed => Action::await_change(),
        PhaseName::Configuring => Action::requeue(Duration::from_secs(CONFIGURING_REQUEUE_SECONDS)),
        _ => Action::requeue(Duration::from_secs(PROGRESS_REQUEUE_SECONDS)),
    }
}

#[instrument(skip(csc, ctx), fields(name = %csc.name_any(), namespace = csc.namespace()))]
pub async fn reconcile(csc: Arc<CatalogSourceConfig>, ctx: Arc<Context>) -> Result<Action> {
    let start = std::time::Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = format!("{}/{}", csc.namespace().unwrap_or_default(), csc.name_any());
    let result = sync(&ctx, (*csc).clone()).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(phase) => {
            ctx.error_counts.remove(&key);
            Ok(action_for(phase))
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

pub fn error_policy(csc: Arc<CatalogSourceConfig>, error: &OperatorError, ctx: Arc<Context>) -> Action {
    let key = format!("{}/{}", csc.namespace().unwrap_or_default(), csc.name_any());
    backoff(&ctx.error_counts, &key, error)
}
