//! Registry ensurer
//!
//! Creates or refreshes the stack serving a set of packages over gRPC: an
//! optional ServiceAccount/Role/RoleBinding for pulling from private
//! registries, a Deployment running `appregistry-server`, and a Service in
//! front of it. Callers then point a CatalogSource at the returned address.
//!
//! Every child is labelled for its owner and the ensurer never mutates a
//! child labelled for somebody else.

pub mod builders;

pub use builders::{build_catalog_source, CatalogSourceParams, RegistryBuilder};

use crate::clock::Clock;
use crate::crd::CatalogSource;
use crate::error::{OperatorError, Result};
use crate::kube_client::{Kube, KubeResource};
use crate::ownership::Owner;
use crate::proxy;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

/// gRPC port served by the registry
pub const REGISTRY_PORT: i32 = 50051;

/// Name of the registry port
pub const REGISTRY_PORT_NAME: &str = "grpc";

/// Remote registry namespace served by a registry pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySource {
    pub endpoint: String,
    pub registry_namespace: String,
    /// `(namespace, name)` of the token secret
    pub secret: Option<(String, String)>,
}

/// Everything needed to ensure one registry stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRequest {
    pub owner: Owner,
    pub image: String,
    pub target_namespace: String,
    pub packages: Vec<String>,
    pub sources: Vec<RegistrySource>,
    pub requires_pull_secret: bool,
}

/// Child kinds of a registry stack, for probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    CatalogSource,
    Deployment,
    Service,
    ServiceAccount,
    Role,
    RoleBinding,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::CatalogSource => "CatalogSource",
            ChildKind::Deployment => "Deployment",
            ChildKind::Service => "Service",
            ChildKind::ServiceAccount => "ServiceAccount",
            ChildKind::Role => "Role",
            ChildKind::RoleBinding => "RoleBinding",
        }
    }
}

/// Creates, updates, probes and deletes registry stacks
#[derive(Clone)]
pub struct RegistryEnsurer {
    kube: Kube,
    clock: Arc<dyn Clock>,
    operator_namespace: String,
}

impl RegistryEnsurer {
    pub fn new(kube: Kube, clock: Arc<dyn Clock>, operator_namespace: impl Into<String>) -> Self {
        Self {
            kube,
            clock,
            operator_namespace: operator_namespace.into(),
        }
    }

    /// Ensure the stack exists and return the registry address `<clusterIP>:50051`
    pub async fn ensure(&self, request: &RegistryRequest) -> Result<String> {
        let builder = RegistryBuilder::new(request);
        let owner = &request.owner;

        if request.requires_pull_secret {
            self.ensure_object(owner, builder.build_service_account()).await?;
            self.ensure_object(owner, builder.build_role()).await?;
            self.ensure_object(owner, builder.build_role_binding()).await?;
        }

        let mut proxy = proxy::resolve(&self.kube, &self.operator_namespace).await?;
        // the CA config map only exists next to the operator
        if request.target_namespace != self.operator_namespace {
            proxy.trusted_ca = None;
        }
        let update_hash = self.clock.now().to_rfc3339();
        self.ensure_object(owner, builder.build_deployment(&proxy, &update_hash))
            .await?;

        let service = self.recreate_service(owner, builder.build_service()).await?;
        let cluster_ip = service
            .spec
            .and_then(|s| s.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None")
            .ok_or_else(|| {
                OperatorError::Internal(format!(
                    "service {}/{} has no cluster IP",
                    request.target_namespace, owner.name
                ))
            })?;

        let address = format!("{}:{}", cluster_ip, REGISTRY_PORT);
        info!(owner = %owner.name, namespace = %request.target_namespace, address = %address, "registry ensured");
        Ok(address)
    }

    /// Create or update the CatalogSource for `owner`
    pub async fn ensure_catalog_source(&self, owner: &Owner, catalog: CatalogSource) -> Result<CatalogSource> {
        self.ensure_object(owner, catalog).await
    }

    /// Create `desired`, or replace the existing object if `owner` owns it
    async fn ensure_object<K: KubeResource>(&self, owner: &Owner, mut desired: K) -> Result<K> {
        let name = desired.name_any();
        let namespace = desired.namespace();
        let kind = K::kind(&()).to_string();

        match self.kube.get::<K>(namespace.as_deref(), &name).await? {
            None => {
                debug!(kind = %kind, name = %name, "creating child");
                self.kube.create(&desired).await
            }
            Some(existing) => {
                owner.ensure_owned(&kind, existing.meta())?;
                desired.meta_mut().resource_version = existing.resource_version();
                debug!(kind = %kind, name = %name, "updating child");
                self.kube.update(&desired).await
            }
        }
    }

    /// Delete and recreate the service so it gets a fresh cluster IP
    async fn recreate_service(&self, owner: &Owner, desired: Service) -> Result<Service> {
        let name = desired.name_any();
        let namespace = desired.namespace();
        if let Some(existing) = self.kube.get::<Service>(namespace.as_deref(), &name).await? {
            owner.ensure_owned("Service", &existing.metadata)?;
            self.kube.delete::<Service>(namespace.as_deref(), &name).await?;
        }
        self.kube.create(&desired).await
    }

    /// Kinds of the expected children that are missing
    ///
    /// RBAC children are only expected when `with_rbac` is set.
    pub async fn probe_children(
        &self,
        owner: &Owner,
        namespace: &str,
        with_rbac: bool,
    ) -> Result<Vec<ChildKind>> {
        let selector = owner.selector();
        let ns = Some(namespace);
        let mut missing = Vec::new();

        if self.kube.list::<CatalogSource>(ns, Some(&selector)).await?.is_empty() {
            missing.push(ChildKind::CatalogSource);
        }
        if self.kube.list::<Deployment>(ns, Some(&selector)).await?.is_empty() {
            missing.push(ChildKind::Deployment);
        }
        if self.kube.list::<Service>(ns, Some(&selector)).await?.is_empty() {
            missing.push(ChildKind::Service);
        }
        if with_rbac {
            if self.kube.list::<ServiceAccount>(ns, Some(&selector)).await?.is_empty() {
                missing.push(ChildKind::ServiceAccount);
            }
            if self.kube.list::<Role>(ns, Some(&selector)).await?.is_empty() {
                missing.push(ChildKind::Role);
            }
            if self.kube.list::<RoleBinding>(ns, Some(&selector)).await?.is_empty() {
                missing.push(ChildKind::RoleBinding);
            }
        }
        Ok(missing)
    }

    /// Delete every child labelled for `owner` in `namespace`
    ///
    /// All kinds are attempted; failures are returned together.
    pub async fn delete_children(&self, owner: &Owner, namespace: &str) -> Result<()> {
        let mut errors = Vec::new();
        let results = [
            self.delete_labelled::<CatalogSource>(owner, namespace).await,
            self.delete_labelled::<Deployment>(owner, namespace).await,
            self.delete_labelled::<Service>(owner, namespace).await,
            self.delete_labelled::<RoleBinding>(owner, namespace).await,
            self.delete_labelled::<Role>(owner, namespace).await,
            self.delete_labelled::<ServiceAccount>(owner, namespace).await,
        ];
        for result in results {
            if let Err(e) = result {
                errors.push(e);
            }
        }
        match OperatorError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn delete_labelled<K: KubeResource>(&self, owner: &Owner, namespace: &str) -> Result<()> {
        let selector = owner.selector();
        let mut errors = Vec::new();
        for object in self.kube.list::<K>(Some(namespace), Some(&selector)).await? {
            let name = object.name_any();
            match self.kube.delete::<K>(Some(namespace), &name).await {
                Ok(_) => debug!(kind = %K::kind(&()), name = %name, "deleted child"),
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(e),
            }
        }
        match OperatorError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
