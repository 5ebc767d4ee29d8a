//! Keeps the default sources in line with the `OperatorHub` configuration

use super::hub::HubConfig;
use super::loader::DefaultDefinition;
use crate::crd::HubSourceStatus;
use crate::error::{OperatorError, Result};
use crate::kube_client::{Kube, KubeResource};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marks objects created by the restorer; only these are ever deleted
pub const MANAGED_ANNOTATION: &str = "openshift-marketplace-managed";

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_ERROR: &str = "Error";

fn is_managed(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(MANAGED_ANNOTATION))
        .is_some_and(|v| v == "true")
}

fn mark_managed(meta: &mut ObjectMeta) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(MANAGED_ANNOTATION.to_string(), "true".to_string());
}

pub struct Restorer {
    kube: Kube,
    hub: Arc<HubConfig>,
    defaults: BTreeMap<String, DefaultDefinition>,
}

impl Restorer {
    pub fn new(kube: Kube, hub: Arc<HubConfig>, defaults: BTreeMap<String, DefaultDefinition>) -> Self {
        Self { kube, hub, defaults }
    }

    pub fn hub(&self) -> &HubConfig {
        &self.hub
    }

    pub fn is_default(&self, name: &str) -> bool {
        self.defaults.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.defaults.keys()
    }

    /// Create, update or delete the default `name` as the hub dictates
    pub async fn ensure(&self, name: &str) -> Result<()> {
        let definition = self
            .defaults
            .get(name)
            .ok_or_else(|| OperatorError::not_found("default source", None, name))?;
        let disabled = self.hub.disabled(name);
        match (definition, disabled) {
            (DefaultDefinition::OperatorSource(source), false) => {
                self.ensure_present(source.clone(), |a, b| a.spec == b.spec).await
            }
            (DefaultDefinition::CatalogSource(catalog), false) => {
                self.ensure_present(catalog.clone(), |a, b| a.spec == b.spec).await
            }
            (DefaultDefinition::OperatorSource(source), true) => self.ensure_absent(source).await,
            (DefaultDefinition::CatalogSource(catalog), true) => self.ensure_absent(catalog).await,
        }
    }

    /// Ensure every default and report the outcome per source
    pub async fn ensure_all(&self) -> Vec<HubSourceStatus> {
        let mut statuses = Vec::with_capacity(self.defaults.len());
        for name in self.defaults.keys() {
            let result = self.ensure(name).await;
            if let Err(ref e) = result {
                warn!(name = %name, error = %e, "failed to restore default source");
            }
            statuses.push(HubSourceStatus {
                name: name.clone(),
                disabled: self.hub.disabled(name),
                status: if result.is_ok() { STATUS_SUCCESS } else { STATUS_ERROR }.to_string(),
                message: result.err().map(|e| e.to_string()),
            });
        }
        statuses
    }

    async fn ensure_present<K>(&self, mut desired: K, same_spec: fn(&K, &K) -> bool) -> Result<()>
    where
        K: KubeResource,
    {
        mark_managed(desired.meta_mut());
        let namespace = desired.namespace();
        let name = desired.name_any();

        let Some(existing) = self.kube.get::<K>(namespace.as_deref(), &name).await? else {
            self.kube.create(&desired).await?;
            info!(name = %name, kind = %K::kind(&()), "default source created");
            return Ok(());
        };
        if same_spec(&existing, &desired) && is_managed(existing.meta()) {
            debug!(name = %name, "default source up to date");
            return Ok(());
        }

        let meta = desired.meta_mut();
        meta.resource_version = existing.meta().resource_version.clone();
        meta.uid = existing.meta().uid.clone();
        meta.finalizers = existing.meta().finalizers.clone();
        self.kube.update(&desired).await?;
        info!(name = %name, kind = %K::kind(&()), "default source restored");
        Ok(())
    }

    async fn ensure_absent<K: KubeResource>(&self, desired: &K) -> Result<()> {
        let namespace = desired.namespace();
        let name = desired.name_any();
        let Some(existing) = self.kube.get::<K>(namespace.as_deref(), &name).await? else {
            return Ok(());
        };
        if !is_managed(existing.meta()) {
            debug!(name = %name, "disabled default is not managed, leaving it");
            return Ok(());
        }
        match self.kube.delete::<K>(namespace.as_deref(), &name).await {
            Ok(_) => {
                info!(name = %name, kind = %K::kind(&()), "default source disabled");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
