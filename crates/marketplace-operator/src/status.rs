//! ClusterOperator status reporting
//!
//! Reconcilers record every phase transition they persist in [`SyncCounters`].
//! The [`StatusReporter`] turns the ratio of failed transitions into
//! Available/Progressing/Degraded conditions and writes them to the
//! `ClusterOperator` on a fixed interval.

use crate::clock::Clock;
use crate::config::OperatorConfig;
use crate::crd::{
    ClusterOperator, ClusterOperatorCondition, ClusterOperatorSpec, ClusterOperatorStatus,
    OperandVersion, RelatedObject, GROUP,
};
use crate::error::Result;
use crate::kube_client::Kube;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";
pub const CONDITION_UPGRADEABLE: &str = "Upgradeable";

const EXITED_MESSAGE: &str = "The operator has exited";

/// Thresholds and identity used when reporting
#[derive(Debug, Clone, PartialEq)]
pub struct ReporterConfig {
    /// Name of the ClusterOperator
    pub name: String,
    /// Operator namespace, listed as a related object
    pub namespace: String,
    pub interval: Duration,
    /// Syncs required before the operator may be reported available
    pub min_syncs: u64,
    /// Counters are halved once this many syncs are recorded
    pub sync_limit: u64,
    /// Failed/total ratio at or above which the operator is degraded
    pub degraded_ratio: f64,
    pub release_version: String,
}

impl ReporterConfig {
    pub fn from_operator(config: &OperatorConfig) -> Self {
        Self {
            name: config.cluster_operator_name.clone(),
            namespace: config.namespace.clone(),
            interval: config.status_interval,
            min_syncs: 3,
            sync_limit: 10_000,
            degraded_ratio: 0.3,
            release_version: config.release_version.clone(),
        }
    }
}

/// Sync and failure totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub syncs: u64,
    pub failed: u64,
}

/// Rolling counters of persisted phase transitions
#[derive(Debug)]
pub struct SyncCounters {
    counts: Mutex<Counts>,
    limit: u64,
}

impl SyncCounters {
    pub fn new(limit: u64) -> Self {
        Self {
            counts: Mutex::new(Counts::default()),
            limit: limit.max(2),
        }
    }

    /// Record one sync; `failed` when it ended in the `Failed` phase
    pub fn record(&self, failed: bool) {
        let mut counts = self.counts.lock();
        // halving keeps the failure ratio while bounding the totals
        if counts.syncs >= self.limit {
            counts.syncs /= 2;
            counts.failed /= 2;
        }
        counts.syncs += 1;
        if failed {
            counts.failed += 1;
        }
    }

    pub fn snapshot(&self) -> Counts {
        *self.counts.lock()
    }
}

fn condition(kind: &str, status: bool, reason: &str, message: String) -> ClusterOperatorCondition {
    ClusterOperatorCondition {
        condition_type: kind.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        last_transition_time: None,
        reason: Some(reason.to_string()),
        message: Some(message),
    }
}

/// Conditions for the given counters; transition times are left unset
pub fn compute_conditions(counts: Counts, config: &ReporterConfig) -> Vec<ClusterOperatorCondition> {
    let upgradeable = condition(
        CONDITION_UPGRADEABLE,
        true,
        "AsExpected",
        "The operator is upgradeable".to_string(),
    );

    if counts.syncs < config.min_syncs {
        return vec![
            condition(
                CONDITION_PROGRESSING,
                true,
                "Syncing",
                format!("Progressing towards release version {}", config.release_version),
            ),
            condition(
                CONDITION_AVAILABLE,
                false,
                "Syncing",
                "The operator has not finished its initial syncs".to_string(),
            ),
            condition(CONDITION_DEGRADED, false, "Syncing", "No failures recorded".to_string()),
            upgradeable,
        ];
    }

    let ratio = counts.failed as f64 / counts.syncs as f64;
    if ratio < config.degraded_ratio {
        vec![
            condition(
                CONDITION_PROGRESSING,
                false,
                "Synced",
                format!("Successfully progressed to release version {}", config.release_version),
            ),
            condition(
                CONDITION_AVAILABLE,
                true,
                "Synced",
                format!(
                    "Successfully synced {} of {} transitions",
                    counts.syncs - counts.failed,
                    counts.syncs
                ),
            ),
            condition(CONDITION_DEGRADED, false, "Synced", "Failure ratio is acceptable".to_string()),
            upgradeable,
        ]
    } else {
        vec![
            condition(
                CONDITION_PROGRESSING,
                false,
                "Failing",
                "The operator is not progressing".to_string(),
            ),
            condition(
                CONDITION_AVAILABLE,
                false,
                "Failing",
                "Too many transitions are failing".to_string(),
            ),
            condition(
                CONDITION_DEGRADED,
                true,
                "Failing",
                format!("{} of {} transitions failed", counts.failed, counts.syncs),
            ),
            upgradeable,
        ]
    }
}

/// Conditions written when the process shuts down
pub fn exit_conditions() -> Vec<ClusterOperatorCondition> {
    vec![
        condition(CONDITION_PROGRESSING, false, "OperatorExited", EXITED_MESSAGE.to_string()),
        condition(CONDITION_AVAILABLE, false, "OperatorExited", EXITED_MESSAGE.to_string()),
        condition(CONDITION_DEGRADED, false, "OperatorExited", EXITED_MESSAGE.to_string()),
        condition(CONDITION_UPGRADEABLE, true, "OperatorExited", EXITED_MESSAGE.to_string()),
    ]
}

/// Stamp transition times, keeping the previous time when the status is unchanged
fn merge_conditions(
    previous: &[ClusterOperatorCondition],
    next: Vec<ClusterOperatorCondition>,
    now: DateTime<Utc>,
) -> Vec<ClusterOperatorCondition> {
    next.into_iter()
        .map(|mut c| {
            let old = previous.iter().find(|p| p.condition_type == c.condition_type);
            c.last_transition_time = match old {
                Some(p) if p.status == c.status => p.last_transition_time.or(Some(now)),
                _ => Some(now),
            };
            c
        })
        .collect()
}

fn is_available(conditions: &[ClusterOperatorCondition]) -> bool {
    conditions
        .iter()
        .any(|c| c.condition_type == CONDITION_AVAILABLE && c.status == "True")
}

/// Writes sync counters to the ClusterOperator
pub struct StatusReporter {
    kube: Kube,
    clock: Arc<dyn Clock>,
    counters: Arc<SyncCounters>,
    config: ReporterConfig,
    disabled: AtomicBool,
}

impl StatusReporter {
    pub fn new(kube: Kube, clock: Arc<dyn Clock>, counters: Arc<SyncCounters>, config: ReporterConfig) -> Self {
        Self {
            kube,
            clock,
            counters,
            config,
            disabled: AtomicBool::new(false),
        }
    }

    /// Whether reporting was turned off because the ClusterOperator API is missing
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    fn related_objects(&self) -> Vec<RelatedObject> {
        let ns = &self.config.namespace;
        vec![
            RelatedObject {
                group: String::new(),
                resource: "namespaces".to_string(),
                namespace: None,
                name: ns.clone(),
            },
            RelatedObject {
                group: GROUP.to_string(),
                resource: "operatorsources".to_string(),
                namespace: Some(ns.clone()),
                name: String::new(),
            },
            RelatedObject {
                group: GROUP.to_string(),
                resource: "catalogsourceconfigs".to_string(),
                namespace: Some(ns.clone()),
                name: String::new(),
            },
        ]
    }

    /// Write conditions computed from the current counters
    pub async fn report(&self) -> Result<()> {
        let conditions = compute_conditions(self.counters.snapshot(), &self.config);
        self.write(conditions).await
    }

    /// Write the terminal "operator exited" conditions
    pub async fn report_exit(&self) -> Result<()> {
        info!(name = %self.config.name, "reporting operator exit");
        self.write(exit_conditions()).await
    }

    async fn write(&self, conditions: Vec<ClusterOperatorCondition>) -> Result<()> {
        if self.is_disabled() {
            return Ok(());
        }

        let existing = match self.kube.get::<ClusterOperator>(None, &self.config.name).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "ClusterOperator API not available, status reporting disabled");
                self.disabled.store(true, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let current = match existing {
            Some(current) => current,
            None => {
                info!(name = %self.config.name, "creating ClusterOperator");
                self.kube
                    .create(&ClusterOperator::new(&self.config.name, ClusterOperatorSpec {}))
                    .await?
            }
        };

        let previous = current.status.clone().unwrap_or_default();
        let conditions = merge_conditions(&previous.conditions, conditions, self.clock.now());
        let versions = if is_available(&conditions) {
            vec![OperandVersion {
                name: "operator".to_string(),
                version: self.config.release_version.clone(),
            }]
        } else {
            previous.versions.clone()
        };
        let status = ClusterOperatorStatus {
            conditions,
            versions,
            related_objects: self.related_objects(),
        };

        if current.status.as_ref() == Some(&status) {
            debug!("ClusterOperator status unchanged");
            return Ok(());
        }
        self.kube
            .update_status(&ClusterOperator {
                status: Some(status),
                ..current
            })
            .await?;
        Ok(())
    }

    /// Report on every tick until `stop` flips to `true`
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report().await {
                        warn!(error = %e, "failed to report ClusterOperator status");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("status reporter stopped");
    }
}
