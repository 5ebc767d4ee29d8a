//! Requeue of published CatalogSourceConfigs whose packages changed upstream

use crate::crd::{CatalogSourceConfig, PhasedResource};
use crate::error::{OperatorError, Result};
use crate::kube_client::Kube;
use crate::phase::{NextPhase, PhaseName, Transitioner};
use kube::ResourceExt;
use tracing::{info, warn};

pub const UPDATE_MESSAGE: &str = "Package(s) have update(s), scheduling for reconciliation";

/// Move every `Succeeded` CatalogSourceConfig in `namespace` that publishes one
/// of `package_ids` back to `Configuring`. Returns the names moved.
pub async fn trigger_package_updates(
    kube: &Kube,
    transitioner: &dyn Transitioner,
    namespace: &str,
    package_ids: &[String],
) -> Result<Vec<String>> {
    if package_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut triggered = Vec::new();
    let mut errors = Vec::new();
    for mut csc in kube.list::<CatalogSourceConfig>(Some(namespace), None).await? {
        if csc.phase_name() != PhaseName::Succeeded {
            continue;
        }
        if !csc.spec.package_list().iter().any(|p| package_ids.contains(p)) {
            continue;
        }

        let name = csc.name_any();
        let status = csc.status.get_or_insert_with(Default::default);
        let next = NextPhase::with_message(PhaseName::Configuring, UPDATE_MESSAGE);
        if !transitioner.transition(&mut status.current_phase.phase, &next) {
            continue;
        }
        match kube.update_status(&csc).await {
            Ok(_) => {
                info!(name = %name, "package update scheduled");
                triggered.push(name);
            }
            Err(e) => {
                warn!(name = %name, error = %e, "failed to schedule package update");
                errors.push(e);
            }
        }
    }

    match OperatorError::aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(triggered),
    }
}
