//! Wiring of the controllers and background loops
//!
//! [`run`] builds the shared state (datastore, OperatorHub view, sync
//! counters), restores the defaults once, starts the update poller and the
//! ClusterOperator reporter, and runs the three controllers until a shutdown
//! signal arrives. On the way out the ClusterOperator is told the operator
//! exited.

use crate::appregistry::ClientFactory;
use crate::catalogsourceconfig;
use crate::clock::{Clock, SystemClock};
use crate::config::OperatorConfig;
use crate::crd::{CatalogSourceConfig, OperatorHub, OperatorSource};
use crate::datastore::Datastore;
use crate::defaults::{self, load_dir, HubConfig, Restorer, OPERATOR_HUB_NAME};
use crate::error::{OperatorError, Result};
use crate::kube_client::Kube;
use crate::metrics::ControllerMetrics;
use crate::operatorsource;
use crate::ownership::OwnerKind;
use crate::poller::UpdatePoller;
use crate::status::{ReporterConfig, StatusReporter, SyncCounters};
use crate::watch::{watch_children, watch_defaults};
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Base requeue delay after a failed reconciliation
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Upper bound of the backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Requeue action for the `key`th consecutive failure
///
/// Uses the error's own delay when it has one, otherwise doubles from 30s up
/// to 600s.
pub(crate) fn backoff(error_counts: &DashMap<String, u32>, key: &str, error: &OperatorError) -> Action {
    let retries = {
        let mut entry = error_counts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    });

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

fn log_outcome<K, E>(result: std::result::Result<(ObjectRef<K>, Action), E>) -> std::future::Ready<()>
where
    K: Resource,
    E: std::fmt::Display,
{
    match result {
        Ok((obj, action)) => {
            debug!(
                name = obj.name,
                namespace = obj.namespace,
                ?action,
                "Reconciliation completed"
            );
        }
        Err(e) => {
            error!(error = %e, "Reconciliation failed");
        }
    }
    std::future::ready(())
}

/// Apply the current OperatorHub, if any, and restore every default
///
/// Without an OperatorHub object this is the only time defaults are restored.
async fn restore_defaults(kube: &Kube, restorer: &Restorer) -> bool {
    let installed = match kube.get::<OperatorHub>(None, OPERATOR_HUB_NAME).await {
        Ok(Some(hub)) => {
            restorer.hub().set(&hub.spec);
            true
        }
        Ok(None) => true,
        Err(e) if e.is_not_found() => {
            info!("OperatorHub API not installed, defaults are only restored at startup");
            false
        }
        Err(e) => {
            warn!(error = %e, "failed to read OperatorHub, restoring every default");
            true
        }
    };
    let statuses = restorer.ensure_all().await;
    info!(count = statuses.len(), "default sources restored");
    installed
}

/// Run the operator until a termination signal arrives
pub async fn run(client: Client, config: OperatorConfig, factory: Arc<dyn ClientFactory>) -> Result<()> {
    let kube = Kube::from_client(client.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let datastore = Arc::new(Datastore::new());
    let reporter_config = ReporterConfig::from_operator(&config);
    let counters = Arc::new(SyncCounters::new(reporter_config.sync_limit));

    let defaults = load_dir(&config.defaults_dir, &config.namespace)?;
    let restorer = Arc::new(Restorer::new(kube.clone(), Arc::new(HubConfig::new()), defaults));
    let hub_installed = restore_defaults(&kube, &restorer).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = UpdatePoller::new(
        kube.clone(),
        datastore.clone(),
        factory.clone(),
        clock.clone(),
        config.poll_interval,
    );
    let poller_task = tokio::spawn({
        let stop = stop_rx.clone();
        async move { poller.run(stop).await }
    });
    let reporter = Arc::new(StatusReporter::new(
        kube.clone(),
        clock.clone(),
        counters.clone(),
        reporter_config,
    ));
    let reporter_task = tokio::spawn({
        let reporter = reporter.clone();
        let stop = stop_rx;
        async move { reporter.run(stop).await }
    });

    let source_ctx = Arc::new(
        operatorsource::Context::new(
            kube.clone(),
            datastore.clone(),
            factory,
            clock.clone(),
            counters.clone(),
            config.clone(),
        )
        .with_metrics(ControllerMetrics::new("operatorsource")),
    );
    let csc_ctx = Arc::new(
        catalogsourceconfig::Context::new(
            kube.clone(),
            datastore,
            clock,
            counters,
            config.clone(),
        )
        .with_metrics(ControllerMetrics::new("catalogsourceconfig")),
    );

    info!(namespace = %config.namespace, "Starting marketplace controllers");

    // sources outside the operator namespace are watched so they can be failed
    let sources = watch_children(
        Controller::new(Api::<OperatorSource>::all(client.clone()), Config::default()),
        &client,
        OwnerKind::OperatorSource,
    )
    .shutdown_on_signal()
    .run(operatorsource::reconcile, operatorsource::error_policy, source_ctx)
    .for_each(log_outcome);

    let configs = watch_children(
        Controller::new(
            Api::<CatalogSourceConfig>::namespaced(client.clone(), &config.namespace),
            Config::default(),
        ),
        &client,
        OwnerKind::CatalogSourceConfig,
    )
    .shutdown_on_signal()
    .run(catalogsourceconfig::reconcile, catalogsourceconfig::error_policy, csc_ctx)
    .for_each(log_outcome);

    if hub_installed {
        let hub_ctx = Arc::new(
            defaults::Context::new(kube.clone(), restorer.clone())
                .with_metrics(ControllerMetrics::new("operatorhub")),
        );
        let hubs = watch_defaults(
            Controller::new(Api::<OperatorHub>::all(client.clone()), Config::default()),
            &client,
            restorer,
        )
        .shutdown_on_signal()
        .run(defaults::reconcile, defaults::error_policy, hub_ctx)
        .for_each(log_outcome);
        tokio::join!(sources, configs, hubs);
    } else {
        tokio::join!(sources, configs);
    }

    info!("Controllers stopped, shutting down background loops");
    // receivers may already be gone if a loop panicked
    let _ = stop_tx.send(true);
    for (name, task) in [("poller", poller_task), ("status reporter", reporter_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "background task failed");
        }
    }
    reporter.report_exit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CatalogSource, CatalogSourceSpec, OperatorHubSpec};
    use crate::defaults::DefaultDefinition;
    use crate::testing::{fixtures, FakeKube};
    use std::collections::BTreeMap;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let counts = DashMap::new();
        let error = OperatorError::Internal("boom".into());
        for seconds in [30, 60, 120, 240, 480, 600, 600] {
            assert_eq!(
                backoff(&counts, "ns/name", &error),
                Action::requeue(Duration::from_secs(seconds))
            );
        }
    }

    #[test]
    fn test_retryable_errors_use_their_own_delay() {
        let counts = DashMap::new();
        let error = OperatorError::AppRegistry("connection refused".into());
        for _ in 0..3 {
            assert_eq!(
                backoff(&counts, "ns/name", &error),
                Action::requeue(Duration::from_secs(30))
            );
        }
    }

    #[test]
    fn test_backoff_is_per_key() {
        let counts = DashMap::new();
        let error = OperatorError::Internal("boom".into());
        backoff(&counts, "a", &error);
        backoff(&counts, "a", &error);
        assert_eq!(
            backoff(&counts, "b", &error),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(counts.get("a").map(|c| *c), Some(2));
    }

    fn catalog_restorer(fake: &FakeKube) -> Restorer {
        let mut catalog = CatalogSource::new(
            "community-operators",
            CatalogSourceSpec {
                source_type: "grpc".into(),
                ..Default::default()
            },
        );
        catalog.metadata.namespace = Some(fixtures::NAMESPACE.into());
        Restorer::new(
            fake.kube(),
            Arc::new(HubConfig::new()),
            BTreeMap::from([(
                "community-operators".to_string(),
                DefaultDefinition::CatalogSource(catalog),
            )]),
        )
    }

    #[tokio::test]
    async fn test_startup_restore_honours_existing_hub() {
        let fake = FakeKube::new();
        fake.kube()
            .create(&OperatorHub::new(
                OPERATOR_HUB_NAME,
                OperatorHubSpec {
                    disable_all_default_sources: true,
                    sources: vec![],
                },
            ))
            .await
            .unwrap();
        let restorer = catalog_restorer(&fake);

        assert!(restore_defaults(&fake.kube(), &restorer).await);
        assert_eq!(fake.count("CatalogSource"), 0);
    }

    #[tokio::test]
    async fn test_startup_restore_without_hub_api() {
        let fake = FakeKube::new();
        fake.make_unavailable("OperatorHub");
        let restorer = catalog_restorer(&fake);

        assert!(!restore_defaults(&fake.kube(), &restorer).await);
        assert_eq!(fake.count("CatalogSource"), 1);
    }
}
