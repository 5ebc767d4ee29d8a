//! OperatorSource controller
//!
//! Drives an `OperatorSource` through
//! `Initial → Validating → Downloading → Configuring → Succeeded`, with
//! `Purging` (requested by the update poller) looping back to `Initial` and
//! `Failed` holding until the spec is edited. Deletion is gated by a
//! finalizer so the datastore row and registry children are removed first.

mod phases;

pub use phases::{reconciler_for, PhaseOutcome, PhaseReconciler, EMPTY_MANIFEST_LIST};

use crate::appregistry::ClientFactory;
use crate::clock::Clock;
use crate::config::OperatorConfig;
use crate::controller::backoff;
use crate::crd::{OperatorSource, PhasedResource};
use crate::datastore::Datastore;
use crate::error::Result;
use crate::kube_client::Kube;
use crate::metrics::ControllerMetrics;
use crate::ownership::{Owner, OwnerKind};
use crate::phase::{NextPhase, PhaseName, PhaseTransitioner, Transitioner};
use crate::registry::RegistryEnsurer;
use crate::status::SyncCounters;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use phases::Updated;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Finalizer blocking deletion until children are cleaned up
pub const FINALIZER_NAME: &str = "finalizer.operatorsources.operators.coreos.com";

/// Requeue interval while a source is moving between phases
const PROGRESS_REQUEUE_SECONDS: u64 = 5;

/// Requeue interval for succeeded sources, to re-probe their children
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Context passed to the OperatorSource controller
pub struct Context {
    pub kube: Kube,
    pub datastore: Arc<Datastore>,
    pub factory: Arc<dyn ClientFactory>,
    pub registry: RegistryEnsurer,
    pub transitioner: Arc<dyn Transitioner>,
    pub counters: Arc<SyncCounters>,
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-source error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

impl Context {
    pub fn new(
        kube: Kube,
        datastore: Arc<Datastore>,
        factory: Arc<dyn ClientFactory>,
        clock: Arc<dyn Clock>,
        counters: Arc<SyncCounters>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            registry: RegistryEnsurer::new(kube.clone(), clock.clone(), config.namespace.clone()),
            transitioner: Arc::new(PhaseTransitioner::new(clock)),
            kube,
            datastore,
            factory,
            counters,
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

fn spec_changed(source: &OperatorSource) -> bool {
    source.phase_name() != PhaseName::Initial
        && source.status.as_ref().and_then(|s| s.observed_generation) != source.metadata.generation
}

async fn ensure_finalizer(ctx: &Context, source: OperatorSource) -> Result<OperatorSource> {
    if source.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        return Ok(source);
    }
    let mut finalizers = source.finalizers().to_vec();
    finalizers.push(FINALIZER_NAME.to_string());
    ctx.kube.set_finalizers(&source, &finalizers).await
}

/// Remove the datastore row and every child, then release the finalizer
async fn finalize(ctx: &Context, source: OperatorSource) -> Result<()> {
    let owner = Owner::new(
        OwnerKind::OperatorSource,
        source.name_any(),
        source.namespace().unwrap_or_default(),
    );
    info!(name = %owner.name, namespace = %owner.namespace, "cleaning up operator source");

    ctx.datastore
        .remove_operator_source(&source.uid().unwrap_or_default());
    ctx.registry.delete_children(&owner, &owner.namespace).await?;

    if source.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        let remaining: Vec<String> = source
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER_NAME)
            .cloned()
            .collect();
        ctx.kube.set_finalizers(&source, &remaining).await?;
    }
    Ok(())
}

/// Write the proposed phase and any status edits
async fn persist(ctx: &Context, mut source: OperatorSource, next: Option<&NextPhase>) -> Result<PhaseName> {
    let before = source.status.clone();
    let generation = source.metadata.generation;
    let status = source.status.get_or_insert_with(Default::default);
    let transitioned = next.is_some_and(|next| {
        ctx.transitioner
            .transition(&mut status.current_phase.phase, next)
    });
    status.observed_generation = generation;
    let phase = status.current_phase.phase.name;

    if source.status != before {
        ctx.kube.update_status(&source).await?;
        if transitioned {
            ctx.counters.record(phase == PhaseName::Failed);
            debug!(name = %source.name_any(), phase = %phase, "phase persisted");
        }
    }
    Ok(phase)
}

/// Run one reconciliation of `source` and return the phase it ends in
pub async fn sync(ctx: &Context, source: OperatorSource) -> Result<PhaseName> {
    if source.metadata.deletion_timestamp.is_some() {
        let phase = source.phase_name();
        finalize(ctx, source).await?;
        return Ok(phase);
    }

    let source = ensure_finalizer(ctx, source).await?;
    let outcome = if spec_changed(&source) {
        Updated.reconcile(ctx, source).await
    } else {
        reconciler_for(source.phase_name())
            .reconcile(ctx, source)
            .await
    };

    let phase = persist(ctx, outcome.source, outcome.next.as_ref()).await?;
    match outcome.error {
        Some(error) => Err(error),
        None => Ok(phase),
    }
}

fn action_for(phase: PhaseName) -> Action {
    match phase {
        PhaseName::Succeeded => Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)),
        PhaseName::Failed => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(PROGRESS_REQUEUE_SECONDS)),
    }
}

/// Main reconciliation function
#[instrument(skip(source, ctx), fields(name = %source.name_any(), namespace = source.namespace()))]
pub async fn reconcile(source: Arc<OperatorSource>, ctx: Arc<Context>) -> Result<Action> {
    let start = std::time::Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = format!("{}/{}", source.namespace().unwrap_or_default(), source.name_any());
    let result = sync(&ctx, (*source).clone()).await;

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

/// Error policy with per-source exponential backoff
pub fn error_policy(
    source: Arc<OperatorSource>,
    error: &crate::error::OperatorError,
    ctx: Arc<Context>,
) -> Action {
    let key = format!("{}/{}", source.namespace().unwrap_or_default(), source.name_any());
    backoff(&ctx.error_counts, &key, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CatalogSource;
    use crate::error::OperatorError;
    use crate::testing::{fixtures, FakeClientFactory, Harness};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{Secret, Service};
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    const NS: &str = fixtures::NAMESPACE;

    async fn create_source(h: &Harness, name: &str) -> OperatorSource {
        h.kube()
            .create(&fixtures::operator_source(name, NS))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_reaches_succeeded() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(h.sync_source(&ctx, "e2e").await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                PhaseName::Validating,
                PhaseName::Downloading,
                PhaseName::Configuring,
                PhaseName::Succeeded,
                PhaseName::Succeeded,
            ]
        );

        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        let status = source.status.unwrap();
        assert_eq!(status.packages, "marketplace_e2e/etcd");
        assert_eq!(status.observed_generation, source.metadata.generation);
        assert!(source.metadata.finalizers.unwrap().contains(&FINALIZER_NAME.to_string()));

        let selector = "opsrc-owner-name=e2e,opsrc-owner-namespace=openshift-marketplace";
        assert_eq!(h.kube().list::<Deployment>(Some(NS), Some(selector)).await.unwrap().len(), 1);
        assert_eq!(h.kube().list::<Service>(Some(NS), Some(selector)).await.unwrap().len(), 1);
        let catalogs = h.kube().list::<CatalogSource>(Some(NS), Some(selector)).await.unwrap();
        assert_eq!(catalogs.len(), 1);
        assert_eq!(catalogs[0].spec.source_type, "grpc");
        assert!(catalogs[0].spec.address.as_deref().unwrap().ends_with(":50051"));
        assert_eq!(catalogs[0].spec.display_name.as_deref(), Some("E2E Operators"));
    }

    #[tokio::test]
    async fn test_empty_manifest_list_fails() {
        let h = Harness::new(FakeClientFactory::default());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;

        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Failed);
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        let message = source.status.unwrap().current_phase.phase.message;
        assert!(message.contains(EMPTY_MANIFEST_LIST));
        assert_eq!(h.fake.count("Deployment"), 0);

        // stays failed
        assert_eq!(h.sync_source(&ctx, "e2e").await.unwrap(), PhaseName::Failed);
    }

    #[tokio::test]
    async fn test_source_outside_operator_namespace_fails() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        h.kube()
            .create(&fixtures::operator_source("elsewhere", "default"))
            .await
            .unwrap();

        for _ in 0..2 {
            ctx_step(&h, &ctx, "default", "elsewhere").await;
        }
        let source: OperatorSource = h.kube().get_required(Some("default"), "elsewhere").await.unwrap();
        let phase = source.status.unwrap().current_phase.phase;
        assert_eq!(phase.name, PhaseName::Failed);
        assert!(phase.message.contains("operator's namespace"));
    }

    async fn ctx_step(h: &Harness, ctx: &Context, ns: &str, name: &str) -> PhaseName {
        let live: OperatorSource = h.kube().get_required(Some(ns), name).await.unwrap();
        sync(ctx, live).await.unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_retried() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        h.sync_source(&ctx, "e2e").await.unwrap();
        h.sync_source(&ctx, "e2e").await.unwrap();

        h.factory.registry.set_unreachable(true);
        let err = h.sync_source(&ctx, "e2e").await.unwrap_err();
        assert!(err.is_retryable());
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        let phase = source.status.unwrap().current_phase.phase;
        assert_eq!(phase.name, PhaseName::Downloading);
        assert!(phase.message.contains("connection refused"));

        h.factory.registry.set_unreachable(false);
        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);
    }

    #[tokio::test]
    async fn test_unreadable_repository_does_not_block_the_rest() {
        let h = Harness::new(fixtures::etcd_registry());
        h.factory.registry.publish(
            fixtures::REGISTRY_NAMESPACE,
            "broken",
            "1.0.0",
            "sha-broken-1",
            fixtures::etcd_blob(),
        );
        h.factory.registry.fail_metadata(fixtures::REGISTRY_NAMESPACE, "broken");
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;

        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        assert_eq!(source.status.unwrap().packages, "marketplace_e2e/etcd");
    }

    #[tokio::test]
    async fn test_all_repositories_unreadable_is_retried() {
        let h = Harness::new(fixtures::etcd_registry());
        h.factory.registry.fail_metadata(fixtures::REGISTRY_NAMESPACE, "etcd");
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        h.sync_source(&ctx, "e2e").await.unwrap();
        h.sync_source(&ctx, "e2e").await.unwrap();

        let err = h.sync_source(&ctx, "e2e").await.unwrap_err();
        assert!(err.is_retryable());
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        assert_eq!(source.phase_name(), PhaseName::Downloading);
    }

    #[tokio::test]
    async fn test_foreign_deployment_fails_and_returns_error() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        h.kube()
            .create(&Deployment {
                metadata: ObjectMeta {
                    name: Some("e2e".into()),
                    namespace: Some(NS.into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        create_source(&h, "e2e").await;
        for _ in 0..3 {
            h.sync_source(&ctx, "e2e").await.unwrap();
        }

        let err = h.sync_source(&ctx, "e2e").await.unwrap_err();
        assert!(matches!(err, OperatorError::OwnershipConflict(_)));
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        let phase = source.status.unwrap().current_phase.phase;
        assert_eq!(phase.name, PhaseName::Failed);
        assert!(phase.message.contains(&err.to_string()));
        assert_eq!(h.fake.count("CatalogSource"), 0);
    }

    #[tokio::test]
    async fn test_finalizer_added_to_outdated_copy() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        let outdated = create_source(&h, "e2e").await;

        let mut live: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        live.metadata.labels = Some(BTreeMap::from([("team".to_string(), "storage".to_string())]));
        h.kube().update(&live).await.unwrap();

        assert_eq!(sync(&ctx, outdated).await.unwrap(), PhaseName::Validating);
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        assert!(source.finalizers().contains(&FINALIZER_NAME.to_string()));
        assert_eq!(source.labels().get("team").map(String::as_str), Some("storage"));
    }

    #[tokio::test]
    async fn test_spec_change_revalidates() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);

        let mut source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        source.spec.endpoint = "https://quay.io/cnr2".into();
        h.kube().update(&source).await.unwrap();

        assert_eq!(h.sync_source(&ctx, "e2e").await.unwrap(), PhaseName::Validating);
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        let status = source.status.unwrap();
        assert!(status.packages.is_empty());
        assert_eq!(status.current_phase.phase.message, "Spec has changed, scheduling for validation");
        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);
    }

    #[tokio::test]
    async fn test_purge_starts_over() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);

        let mut source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        ctx.transitioner.transition(
            &mut source.status.as_mut().unwrap().current_phase.phase,
            &NextPhase::new(PhaseName::Purging),
        );
        h.kube().update_status(&source).await.unwrap();

        assert_eq!(h.sync_source(&ctx, "e2e").await.unwrap(), PhaseName::Initial);
        assert_eq!(h.fake.count("CatalogSource"), 0);
        let uid = source.uid().unwrap();
        assert!(!ctx.datastore.contains(&uid));

        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);
        assert_eq!(h.fake.count("CatalogSource"), 1);
        assert!(ctx.datastore.contains(&uid));
    }

    #[tokio::test]
    async fn test_deleted_child_is_restored() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);

        h.kube().delete::<Deployment>(Some(NS), "e2e").await.unwrap();
        assert_eq!(h.sync_source(&ctx, "e2e").await.unwrap(), PhaseName::Configuring);
        let source: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        assert!(source
            .status
            .unwrap()
            .current_phase
            .phase
            .message
            .contains("Deployment"));

        assert_eq!(h.sync_source(&ctx, "e2e").await.unwrap(), PhaseName::Succeeded);
        assert_eq!(h.fake.count("Deployment"), 1);
    }

    #[tokio::test]
    async fn test_restart_redownloads() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);

        let fresh = Context::new(
            h.kube(),
            Arc::new(Datastore::new()),
            h.factory.clone(),
            h.clock.clone(),
            h.counters.clone(),
            h.config.clone(),
        );
        assert_eq!(h.sync_source(&fresh, "e2e").await.unwrap(), PhaseName::Downloading);
        assert_eq!(h.settle_source(&fresh, "e2e").await, PhaseName::Succeeded);
    }

    #[tokio::test]
    async fn test_token_secret_creates_rbac() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        h.kube()
            .create(&Secret {
                metadata: ObjectMeta {
                    name: Some("quay".into()),
                    namespace: Some(NS.into()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(
                    "token".to_string(),
                    ByteString(b"basic abc".to_vec()),
                )])),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut source = fixtures::operator_source("private", NS);
        source.spec.authorization_token = Some(crate::crd::AuthorizationToken {
            secret_name: "quay".into(),
            secret_namespace: None,
        });
        h.kube().create(&source).await.unwrap();

        assert_eq!(h.settle_source(&ctx, "private").await, PhaseName::Succeeded);
        assert_eq!(h.factory.requests()[0].token.as_deref(), Some("basic abc"));
        assert_eq!(h.fake.count("ServiceAccount"), 1);
        assert_eq!(h.fake.count("Role"), 1);
        assert_eq!(h.fake.count("RoleBinding"), 1);
    }

    #[tokio::test]
    async fn test_deletion_cleans_up() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        assert_eq!(h.settle_source(&ctx, "e2e").await, PhaseName::Succeeded);
        let uid = h
            .kube()
            .get_required::<OperatorSource>(Some(NS), "e2e")
            .await
            .unwrap()
            .uid()
            .unwrap();

        assert!(h.kube().delete::<OperatorSource>(Some(NS), "e2e").await.unwrap());
        let terminating: OperatorSource = h.kube().get_required(Some(NS), "e2e").await.unwrap();
        sync(&ctx, terminating).await.unwrap();

        assert!(h.kube().get::<OperatorSource>(Some(NS), "e2e").await.unwrap().is_none());
        assert!(!ctx.datastore.contains(&uid));
        for kind in ["Deployment", "Service", "CatalogSource"] {
            assert_eq!(h.fake.count(kind), 0, "{kind} left behind");
        }
    }

    #[tokio::test]
    async fn test_transitions_are_counted() {
        let h = Harness::new(fixtures::etcd_registry());
        let ctx = h.operator_source_context();
        create_source(&h, "e2e").await;
        h.settle_source(&ctx, "e2e").await;
        let counts = ctx.counters.snapshot();
        assert_eq!(counts.syncs, 4);
        assert_eq!(counts.failed, 0);
    }

    #[test]
    fn test_action_for_phase() {
        assert_eq!(action_for(PhaseName::Failed), Action::await_change());
        assert_eq!(
            action_for(PhaseName::Succeeded),
            Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))
        );
    }
}
