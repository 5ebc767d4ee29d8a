//! Phase reconcilers for `OperatorSource`
//!
//! Each phase has its own reconciler; [`reconciler_for`] is the static
//! phase-to-reconciler table. Reconcilers never write status themselves. They
//! edit the object they are handed and propose a [`NextPhase`]; the
//! dispatcher persists both.

use super::Context;
use crate::appregistry::{resolve_token, retrieve_manifests, retrieve_metadata, RegistryOptions};
use crate::crd::{CatalogSource, OperatorSource, OperatorSourceStatus, MARKETPLACE_LABEL};
use crate::error::OperatorError;
use crate::ownership::{Owner, OwnerKind};
use crate::phase::{NextPhase, PhaseName};
use crate::registry::{build_catalog_source, CatalogSourceParams, RegistryRequest, RegistrySource};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use validator::Validate;

/// Message used when the registry namespace holds nothing
pub const EMPTY_MANIFEST_LIST: &str = "operator source endpoint returned an empty manifest list";

/// What a phase reconciler decided
#[derive(Debug)]
pub struct PhaseOutcome {
    /// The object, possibly with status edits
    pub source: OperatorSource,
    /// Phase to persist, `None` to leave the phase alone
    pub next: Option<NextPhase>,
    /// Error to hand back to the controller runtime for a retry
    pub error: Option<OperatorError>,
}

impl PhaseOutcome {
    pub fn next(source: OperatorSource, next: NextPhase) -> Self {
        Self {
            source,
            next: Some(next),
            error: None,
        }
    }

    pub fn unchanged(source: OperatorSource) -> Self {
        Self {
            source,
            next: None,
            error: None,
        }
    }

    /// Retryable errors keep the current phase; anything else fails the
    /// object until its spec changes. Both are re-raised after the phase is
    /// persisted.
    pub fn from_error(source: OperatorSource, current: PhaseName, error: OperatorError) -> Self {
        let next = if error.is_retryable() {
            NextPhase::with_message(current, error.to_string())
        } else {
            NextPhase::failed(&error)
        };
        Self {
            source,
            next: Some(next),
            error: Some(error),
        }
    }
}

/// Reconciler for a single phase
#[async_trait]
pub trait PhaseReconciler: Send + Sync {
    async fn reconcile(&self, ctx: &Context, source: OperatorSource) -> PhaseOutcome;
}

/// Reconciler responsible for `phase`
pub fn reconciler_for(phase: PhaseName) -> &'static dyn PhaseReconciler {
    match phase {
        PhaseName::Initial => &Initial,
        PhaseName::Validating => &Validating,
        PhaseName::Downloading => &Downloading,
        PhaseName::Configuring => &Configuring,
        PhaseName::Succeeded => &Succeeded,
        PhaseName::Purging => &Purging,
        PhaseName::Failed => &Failed,
    }
}

fn owner_of(source: &OperatorSource) -> Owner {
    Owner::new(
        OwnerKind::OperatorSource,
        source.name_any(),
        source.namespace().unwrap_or_default(),
    )
}

/// Drop everything but the current phase from the status
fn reset_status(source: &mut OperatorSource) {
    let current_phase = source
        .status
        .as_ref()
        .map(|s| s.current_phase.clone())
        .unwrap_or_default();
    source.status = Some(OperatorSourceStatus {
        current_phase,
        ..Default::default()
    });
}

fn set_packages(source: &mut OperatorSource, packages: &[String]) {
    source.status.get_or_insert_with(Default::default).packages = packages.join(",");
}

/// Admit the source into the datastore
pub struct Initial;

#[async_trait]
impl PhaseReconciler for Initial {
    async fn reconcile(&self, ctx: &Context, source: OperatorSource) -> PhaseOutcome {
        ctx.datastore.add_operator_source(&source);
        PhaseOutcome::next(source, NextPhase::new(PhaseName::Validating))
    }
}

/// Check the spec and the namespace
pub struct Validating;

fn validation_message(source: &OperatorSource) -> Option<String> {
    let errors = source.spec.validate().err()?;
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

#[async_trait]
impl PhaseReconciler for Validating {
    async fn reconcile(&self, ctx: &Context, source: OperatorSource) -> PhaseOutcome {
        if let Some(message) = validation_message(&source) {
            warn!(name = %source.name_any(), errors = %message, "operator source spec is invalid");
            return PhaseOutcome::next(source, NextPhase::with_message(PhaseName::Failed, message));
        }

        let namespace = source.namespace().unwrap_or_default();
        if namespace != ctx.config.namespace {
            let message = format!(
                "Will only reconcile resources in the operator's namespace {}",
                ctx.config.namespace
            );
            return PhaseOutcome::next(source, NextPhase::with_message(PhaseName::Failed, message));
        }

        PhaseOutcome::next(source, NextPhase::new(PhaseName::Downloading))
    }
}

/// Fetch the manifests served by the registry namespace into the datastore
pub struct Downloading;

#[async_trait]
impl PhaseReconciler for Downloading {
    async fn reconcile(&self, ctx: &Context, mut source: OperatorSource) -> PhaseOutcome {
        let phase = PhaseName::Downloading;
        let token = match resolve_token(&ctx.kube, &source).await {
            Ok(token) => token,
            Err(e) => return PhaseOutcome::from_error(source, phase, e),
        };
        let client = match ctx.factory.new_client(&RegistryOptions::for_source(&source, token)) {
            Ok(client) => client,
            Err(e) => return PhaseOutcome::from_error(source, phase, e),
        };

        let (metadata, mut errors) =
            match retrieve_metadata(client.as_ref(), &source.spec.registry_namespace).await {
                Ok(listed) => listed,
                Err(e) => return PhaseOutcome::from_error(source, phase, e),
            };
        if metadata.is_empty() {
            if let Some(error) = OperatorError::aggregate(errors) {
                return PhaseOutcome::from_error(source, phase, error);
            }
            return PhaseOutcome::next(
                source,
                NextPhase::with_message(PhaseName::Failed, EMPTY_MANIFEST_LIST),
            );
        }

        let (manifests, failed) = retrieve_manifests(client.as_ref(), metadata).await;
        errors.extend(failed);
        let written = ctx.datastore.write(&source, manifests);
        if let Some(faults) = written.faults {
            warn!(name = %source.name_any(), error = %faults, "some manifests could not be stored");
            errors.push(faults);
        }
        if written.count == 0 {
            let error = OperatorError::aggregate(errors).unwrap_or_else(|| {
                OperatorError::InvalidSpec("no operator manifests could be stored".to_string())
            });
            return PhaseOutcome::from_error(source, phase, error);
        }

        let uid = source.uid().unwrap_or_default();
        let packages = ctx.datastore.get_package_ids_by_operator_source(&uid);
        info!(name = %source.name_any(), count = packages.len(), skipped = errors.len(), "downloaded operator manifests");
        set_packages(&mut source, &packages);
        PhaseOutcome::next(source, NextPhase::new(PhaseName::Configuring))
    }
}

/// Ensure the registry stack and the CatalogSource
pub struct Configuring;

#[async_trait]
impl PhaseReconciler for Configuring {
    async fn reconcile(&self, ctx: &Context, mut source: OperatorSource) -> PhaseOutcome {
        let phase = PhaseName::Configuring;
        let uid = source.uid().unwrap_or_default();
        let packages = ctx.datastore.get_package_ids_by_operator_source(&uid);
        if packages.is_empty() {
            return PhaseOutcome::next(
                source,
                NextPhase::with_message(
                    PhaseName::Downloading,
                    "No packages stored for this source, scheduling for download",
                ),
            );
        }

        let owner = owner_of(&source);
        let namespace = owner.namespace.clone();
        let secret = source.spec.token_secret(&namespace);
        let request = RegistryRequest {
            owner: owner.clone(),
            image: ctx.config.registry_image.clone(),
            target_namespace: namespace.clone(),
            packages: packages.clone(),
            sources: vec![RegistrySource {
                endpoint: source.spec.endpoint.clone(),
                registry_namespace: source.spec.registry_namespace.clone(),
                secret: secret.clone(),
            }],
            requires_pull_secret: secret.is_some(),
        };

        let address = match ctx.registry.ensure(&request).await {
            Ok(address) => address,
            Err(e) => return PhaseOutcome::from_error(source, phase, e),
        };

        let catalog = build_catalog_source(
            &owner,
            CatalogSourceParams {
                name: owner.name.clone(),
                namespace,
                address,
                display_name: source.spec.display_name.clone(),
                publisher: source.spec.publisher.clone(),
                extra_labels: BTreeMap::from([(MARKETPLACE_LABEL.to_string(), "true".to_string())]),
                poll_interval: ctx.config.catalog_poll_interval.clone(),
            },
        );
        if let Err(e) = ctx.registry.ensure_catalog_source(&owner, catalog).await {
            return PhaseOutcome::from_error(source, phase, e);
        }

        set_packages(&mut source, &packages);
        PhaseOutcome::next(source, NextPhase::new(PhaseName::Succeeded))
    }
}

/// Watch for lost children and a lost datastore row
pub struct Succeeded;

#[async_trait]
impl PhaseReconciler for Succeeded {
    async fn reconcile(&self, ctx: &Context, mut source: OperatorSource) -> PhaseOutcome {
        let uid = source.uid().unwrap_or_default();
        if !ctx.datastore.contains(&uid) {
            // the datastore does not survive restarts
            ctx.datastore.add_operator_source(&source);
            return PhaseOutcome::next(
                source,
                NextPhase::with_message(
                    PhaseName::Downloading,
                    "Operator source is not in the datastore, scheduling for download",
                ),
            );
        }

        let owner = owner_of(&source);
        let with_rbac = source.spec.token_secret(&owner.namespace).is_some();
        let missing = match ctx
            .registry
            .probe_children(&owner, &owner.namespace, with_rbac)
            .await
        {
            Ok(missing) => missing,
            Err(e) => return PhaseOutcome::from_error(source, PhaseName::Succeeded, e),
        };
        if missing.is_empty() {
            return PhaseOutcome::unchanged(source);
        }

        let kinds: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
        info!(name = %source.name_any(), missing = ?kinds, "child resources missing");
        reset_status(&mut source);
        PhaseOutcome::next(
            source,
            NextPhase::with_message(
                PhaseName::Configuring,
                format!("Child resource(s) missing: {}", kinds.join(", ")),
            ),
        )
    }
}

/// Drop cached manifests and the CatalogSource, then start over
pub struct Purging;

#[async_trait]
impl PhaseReconciler for Purging {
    async fn reconcile(&self, ctx: &Context, mut source: OperatorSource) -> PhaseOutcome {
        let uid = source.uid().unwrap_or_default();
        ctx.datastore.remove_operator_source(&uid);

        let namespace = source.namespace();
        match ctx
            .kube
            .delete::<CatalogSource>(namespace.as_deref(), &source.name_any())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return PhaseOutcome::from_error(source, PhaseName::Purging, e),
        }

        debug!(name = %source.name_any(), "purged operator source");
        reset_status(&mut source);
        PhaseOutcome::next(source, NextPhase::new(PhaseName::Initial))
    }
}

/// Terminal until the spec changes
pub struct Failed;

#[async_trait]
impl PhaseReconciler for Failed {
    async fn reconcile(&self, _ctx: &Context, source: OperatorSource) -> PhaseOutcome {
        PhaseOutcome::unchanged(source)
    }
}

/// Spec edited after the source was admitted
pub struct Updated;

#[async_trait]
impl PhaseReconciler for Updated {
    async fn reconcile(&self, ctx: &Context, mut source: OperatorSource) -> PhaseOutcome {
        let uid = source.uid().unwrap_or_default();
        ctx.datastore.remove_operator_source(&uid);
        ctx.datastore.add_operator_source(&source);
        info!(name = %source.name_any(), "operator source spec changed");
        reset_status(&mut source);
        PhaseOutcome::next(
            source,
            NextPhase::with_message(PhaseName::Validating, "Spec has changed, scheduling for validation"),
        )
    }
}
