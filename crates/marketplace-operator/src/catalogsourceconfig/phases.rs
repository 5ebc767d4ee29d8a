//! Phase reconcilers for `CatalogSourceConfig`

use super::resolver::{resolve, Resolution};
use super::Context;
use crate::crd::{
    CatalogSourceConfig, CatalogSourceConfigSnapshot, CatalogSourceConfigStatus, DATASTORE_LABEL,
    MARKETPLACE_LABEL, OLM_VISIBILITY_LABEL,
};
use crate::error::OperatorError;
use crate::ownership::{Owner, OwnerKind};
use crate::phase::{NextPhase, PhaseName};
use crate::registry::{build_catalog_source, CatalogSourceParams, RegistryRequest, RegistrySource};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{info, warn};
use validator::Validate;

/// What a phase reconciler decided
#[derive(Debug)]
pub struct PhaseOutcome {
    pub csc: CatalogSourceConfig,
    pub next: Option<NextPhase>,
    pub error: Option<OperatorError>,
}

impl PhaseOutcome {
    pub fn next(csc: CatalogSourceConfig, next: NextPhase) -> Self {
        Self {
            csc,
            next: Some(next),
            error: None,
        }
    }

    pub fn unchanged(csc: CatalogSourceConfig) -> Self {
        Self {
            csc,
            next: None,
            error: None,
        }
    }

    /// Keeps `current` for retryable errors, fails otherwise; the error is
    /// re-raised either way
    pub fn from_error(csc: CatalogSourceConfig, current: PhaseName, error: OperatorError) -> Self {
        let next = if error.is_retryable() {
            NextPhase::with_message(current, error.to_string())
        } else {
            NextPhase::failed(&error)
        };
        Self {
            csc,
            next: Some(next),
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait PhaseReconciler: Send + Sync {
    async fn reconcile(&self, ctx: &Context, csc: CatalogSourceConfig) -> PhaseOutcome;
}

/// Reconciler responsible for `phase`
///
/// `Validating`, `Downloading` and `Purging` only exist for OperatorSources; a
/// CatalogSourceConfig found in one of them is configured again.
pub fn reconciler_for(phase: PhaseName) -> &'static dyn PhaseReconciler {
    match phase {
        PhaseName::Initial => &Initial,
        PhaseName::Succeeded => &Succeeded,
        PhaseName::Failed => &Failed,
        PhaseName::Configuring
        | PhaseName::Validating
        | PhaseName::Downloading
        | PhaseName::Purging => &Configuring,
    }
}

pub(super) fn owner_of(csc: &CatalogSourceConfig) -> Owner {
    Owner::new(
        OwnerKind::CatalogSourceConfig,
        csc.name_any(),
        csc.namespace().unwrap_or_default(),
    )
}

fn reset_status(csc: &mut CatalogSourceConfig, keep_published: bool) {
    let previous = csc.status.take().unwrap_or_default();
    csc.status = Some(CatalogSourceConfigStatus {
        current_phase: previous.current_phase,
        last_published: previous.last_published.filter(|_| keep_published),
        ..Default::default()
    });
}

fn registry_sources(resolution: &Resolution) -> Vec<RegistrySource> {
    resolution
        .sources
        .iter()
        .map(|key| RegistrySource {
            endpoint: key.spec.endpoint.clone(),
            registry_namespace: key.spec.registry_namespace.clone(),
            secret: key.spec.token_secret(&key.namespace),
        })
        .collect()
}

/// Labels put on the published CatalogSource
fn catalog_labels(csc: &CatalogSourceConfig) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(MARKETPLACE_LABEL.to_string(), "true".to_string())]);
    if csc.labels().get(DATASTORE_LABEL).map(String::as_str) == Some("true") {
        labels.insert(OLM_VISIBILITY_LABEL.to_string(), "hidden".to_string());
    }
    labels
}

/// Sorted validation messages, `None` for a valid spec
fn invalid_spec(csc: &CatalogSourceConfig) -> Option<String> {
    let errors = csc.spec.validate().err()?;
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(_, errs)| {
            errs.iter()
                .map(|e| e.message.clone().unwrap_or_else(|| e.code.clone()).to_string())
        })
        .collect();
    messages.sort();
    Some(messages.join("; "))
}

/// Validate the spec
pub struct Initial;

#[async_trait]
impl PhaseReconciler for Initial {
    async fn reconcile(&self, _ctx: &Context, csc: CatalogSourceConfig) -> PhaseOutcome {
        if let Some(message) = invalid_spec(&csc) {
            return PhaseOutcome::next(csc, NextPhase::with_message(PhaseName::Failed, message));
        }
        PhaseOutcome::next(csc, NextPhase::new(PhaseName::Configuring))
    }
}

/// Resolve, bundle-check and publish the requested packages
pub struct Configuring;

#[async_trait]
impl PhaseReconciler for Configuring {
    async fn reconcile(&self, ctx: &Context, mut csc: CatalogSourceConfig) -> PhaseOutcome {
        let phase = PhaseName::Configuring;
        let owner = owner_of(&csc);
        let packages = csc.spec.package_list();

        let resolution = match resolve(&ctx.datastore, &owner.namespace, &csc.spec.source, &packages) {
            Ok(resolution) => resolution,
            Err(message) => {
                info!(name = %owner.name, reason = %message, "packages not resolvable yet");
                return PhaseOutcome::next(csc, NextPhase::with_message(phase, message));
            }
        };

        // the registry serves the union; colliding CRDs must be caught here
        if let Err(e) = ctx.datastore.read_bundle(&resolution.source_uids(), &packages) {
            warn!(name = %owner.name, error = %e, "requested packages cannot be bundled");
            return PhaseOutcome::next(
                csc,
                NextPhase::with_message(phase, format!("Unable to bundle the requested package(s): {}", e)),
            );
        }

        let sources = registry_sources(&resolution);
        let requires_pull_secret = sources.iter().any(|s| s.secret.is_some());
        let target_namespace = csc.spec.target_namespace.clone();
        let request = RegistryRequest {
            owner: owner.clone(),
            image: ctx.config.registry_image.clone(),
            target_namespace: target_namespace.clone(),
            packages: packages.clone(),
            sources,
            requires_pull_secret,
        };
        let address = match ctx.registry.ensure(&request).await {
            Ok(address) => address,
            Err(e) => return PhaseOutcome::from_error(csc, phase, e),
        };

        let catalog = build_catalog_source(
            &owner,
            CatalogSourceParams {
                name: owner.name.clone(),
                namespace: target_namespace,
                address,
                display_name: csc.spec.display_name.clone(),
                publisher: csc.spec.publisher.clone(),
                extra_labels: catalog_labels(&csc),
                poll_interval: None,
            },
        );
        if let Err(e) = ctx.registry.ensure_catalog_source(&owner, catalog).await {
            return PhaseOutcome::from_error(csc, phase, e);
        }

        let snapshot = csc.spec.snapshot();
        ctx.cache.set(&csc.uid().unwrap_or_default(), snapshot.clone());
        let status = csc.status.get_or_insert_with(Default::default);
        status.packages = packages.join(",");
        status.last_published = Some(snapshot);
        info!(name = %owner.name, packages = %status.packages, "catalog published");
        PhaseOutcome::next(csc, NextPhase::new(PhaseName::Succeeded))
    }
}

/// Watch for lost children
pub struct Succeeded;

#[async_trait]
impl PhaseReconciler for Succeeded {
    async fn reconcile(&self, ctx: &Context, mut csc: CatalogSourceConfig) -> PhaseOutcome {
        let owner = owner_of(&csc);
        let packages = csc.spec.package_list();
        let with_rbac = resolve(&ctx.datastore, &owner.namespace, &csc.spec.source, &packages)
            .map(|r| registry_sources(&r).iter().any(|s| s.secret.is_some()))
            .unwrap_or(false);

        let missing = match ctx
            .registry
            .probe_children(&owner, &csc.spec.target_namespace, with_rbac)
            .await
        {
            Ok(missing) => missing,
            Err(e) => return PhaseOutcome::from_error(csc, PhaseName::Succeeded, e),
        };
        if missing.is_empty() {
            return PhaseOutcome::unchanged(csc);
        }

        let kinds: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
        info!(name = %owner.name, missing = ?kinds, "child resources missing");
        reset_status(&mut csc, true);
        PhaseOutcome::next(
            csc,
            NextPhase::with_message(
                PhaseName::Configuring,
                format!("Child resource(s) missing: {}", kinds.join(", ")),
            ),
        )
    }
}

/// Terminal until the spec changes
pub struct Failed;

#[async_trait]
impl PhaseReconciler for Failed {
    async fn reconcile(&self, _ctx: &Context, csc: CatalogSourceConfig) -> PhaseOutcome {
        PhaseOutcome::unchanged(csc)
    }
}

/// Spec edited since it was last published or last reconciled
pub struct Updated {
    /// What was last published, `None` if nothing ever was
    pub previous: Option<CatalogSourceConfigSnapshot>,
}

#[async_trait]
impl PhaseReconciler for Updated {
    async fn reconcile(&self, ctx: &Context, mut csc: CatalogSourceConfig) -> PhaseOutcome {
        let owner = owner_of(&csc);
        let moved_from = self
            .previous
            .as_ref()
            .map(|p| p.target_namespace.as_str())
            .filter(|ns| !ns.is_empty() && *ns != csc.spec.target_namespace);
        if let Some(from) = moved_from {
            info!(
                name = %owner.name,
                from = %from,
                to = %csc.spec.target_namespace,
                "target namespace changed"
            );
            if let Err(e) = ctx.registry.delete_children(&owner, from).await {
                let current = csc.status.as_ref().map(|s| s.current_phase.phase.name).unwrap_or_default();
                return PhaseOutcome::from_error(csc, current, e);
            }
        }

        ctx.cache.evict(&csc.uid().unwrap_or_default());
        reset_status(&mut csc, false);
        if let Some(message) = invalid_spec(&csc) {
            return PhaseOutcome::next(csc, NextPhase::with_message(PhaseName::Failed, message));
        }
        PhaseOutcome::next(
            csc,
            NextPhase::with_message(
                PhaseName::Configuring,
                "Spec has changed, scheduling for reconfiguration",
            ),
        )
    }
}
