//! Periodic check of the remote registries for changed repositories
//!
//! A changed source is moved to `Purging` so its controller downloads it
//! again, and every published CatalogSourceConfig using one of the affected
//! packages is rescheduled.

use crate::appregistry::{resolve_token, retrieve_metadata, ClientFactory, RegistryOptions};
use crate::catalogsourceconfig::trigger_package_updates;
use crate::clock::Clock;
use crate::crd::{OperatorSource, PhasedResource};
use crate::datastore::{Datastore, OperatorSourceKey, SourceUpdate};
use crate::error::{OperatorError, Result};
use crate::kube_client::Kube;
use crate::metrics::record_poll;
use crate::phase::{NextPhase, PhaseName, PhaseTransitioner, Transitioner};
use futures::future::join_all;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const PURGE_MESSAGE: &str = "Remote registry has update(s), purging";

/// What one poll round found
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PollReport {
    /// Sources whose registry was contacted
    pub polled: usize,
    /// `namespace/name` of sources sent to `Purging`
    pub updated: Vec<String>,
    /// Sources whose poll failed
    pub failed: usize,
}

pub struct UpdatePoller {
    kube: Kube,
    datastore: Arc<Datastore>,
    factory: Arc<dyn ClientFactory>,
    transitioner: Arc<dyn Transitioner>,
    interval: Duration,
}

impl UpdatePoller {
    pub fn new(
        kube: Kube,
        datastore: Arc<Datastore>,
        factory: Arc<dyn ClientFactory>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            kube,
            datastore,
            factory,
            transitioner: Arc::new(PhaseTransitioner::new(clock)),
            interval,
        }
    }

    /// Poll every stored source once, concurrently
    pub async fn poll_once(&self) -> PollReport {
        let keys = self.datastore.get_all_operator_sources();
        let results = join_all(keys.iter().map(|key| self.poll_source(key))).await;

        let mut report = PollReport::default();
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(None) => {}
                Ok(Some(polled)) => {
                    report.polled += 1;
                    if polled.is_some() {
                        report.updated.push(format!("{}/{}", key.namespace, key.name));
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(name = %key.name, namespace = %key.namespace, error = %e, "update poll failed");
                }
            }
        }
        debug!(polled = report.polled, updated = report.updated.len(), failed = report.failed, "poll round finished");
        report
    }

    /// `None` when the source was skipped, otherwise the update found if any
    async fn poll_source(&self, key: &OperatorSourceKey) -> Result<Option<Option<SourceUpdate>>> {
        let Some(mut source) = self
            .kube
            .get::<OperatorSource>(Some(&key.namespace), &key.name)
            .await?
        else {
            return Ok(None);
        };
        // a source still downloading or configuring is fetched fresh anyway
        if source.uid().as_deref() != Some(key.uid.as_str()) || source.phase_name() != PhaseName::Succeeded {
            return Ok(None);
        }

        let token = resolve_token(&self.kube, &source).await?;
        let client = self
            .factory
            .new_client(&RegistryOptions::for_source(&source, token))?;
        let (metadata, errors) = retrieve_metadata(client.as_ref(), &source.spec.registry_namespace).await?;
        // a partial listing would read as removed packages
        if let Some(error) = OperatorError::aggregate(errors) {
            return Err(error);
        }

        let update = match self.datastore.diff(&key.uid, &metadata) {
            Some(update) if !update.diff.is_empty() => update,
            _ => {
                record_poll(&key.name, false);
                return Ok(Some(None));
            }
        };
        record_poll(&key.name, true);
        info!(
            name = %key.name,
            added = ?update.diff.added,
            removed = ?update.diff.removed,
            changed = ?update.diff.changed,
            "remote registry has updates"
        );

        let status = source.status.get_or_insert_with(Default::default);
        let next = NextPhase::with_message(PhaseName::Purging, PURGE_MESSAGE);
        if self.transitioner.transition(&mut status.current_phase.phase, &next) {
            self.kube.update_status(&source).await?;
        }

        let triggered = trigger_package_updates(
            &self.kube,
            self.transitioner.as_ref(),
            &key.namespace,
            &update.package_ids,
        )
        .await?;
        if !triggered.is_empty() {
            info!(name = %key.name, configs = ?triggered, "catalog source configs rescheduled");
        }
        Ok(Some(Some(update)))
    }

    /// Poll on every tick until `stop` flips to `true`
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; sources were just downloaded
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("update poller stopped");
    }
}
