//! # Marketplace Operator
//!
//! Kubernetes operator that makes curated operator catalogs available on a
//! cluster. It downloads operator manifests from remote app-registries, keeps
//! them in memory and serves them to OLM through per-source registry pods and
//! `CatalogSource` objects.
//!
//! ## Custom Resources
//!
//! ### OperatorSource
//!
//! Points at an app-registry namespace. Every package found there is
//! downloaded and published in the operator's namespace:
//!
//! ```yaml
//! apiVersion: operators.coreos.com/v1
//! kind: OperatorSource
//! metadata:
//!   name: community-operators
//!   namespace: openshift-marketplace
//! spec:
//!   type: appregistry
//!   endpoint: https://quay.io/cnr
//!   registryNamespace: community-operators
//!   displayName: Community Operators
//!   publisher: Red Hat
//! ```
//!
//! An OperatorSource moves through
//! `Initial → Validating → Downloading → Configuring → Succeeded`. The update
//! poller sends it to `Purging` when the remote registry changes, after which
//! it is downloaded again.
//!
//! ### CatalogSourceConfig
//!
//! Publishes a chosen set of packages into another namespace:
//!
//! ```yaml
//! apiVersion: operators.coreos.com/v2
//! kind: CatalogSourceConfig
//! metadata:
//!   name: my-operators
//!   namespace: openshift-marketplace
//! spec:
//!   targetNamespace: my-namespace
//!   packages: community-operators/etcd,community-operators/prometheus
//! ```
//!
//! ## Architecture
//!
//! - Phase reconcilers are plain structs behind the [`operatorsource::PhaseReconciler`]
//!   and [`catalogsourceconfig::PhaseReconciler`] traits, selected per phase
//!   from a static table.
//! - The [`datastore`] holds the downloaded manifests of every source; it is
//!   rebuilt from the registries after a restart.
//! - The [`registry`] ensurer builds the registry Deployment, Service and
//!   RBAC for an owner. Children are linked to their owner by labels, and
//!   [`watch`] maps child deletions back to the owner.
//! - [`defaults`] restores the shipped default sources according to the
//!   cluster's `OperatorHub`.
//! - [`status`] reports operator health on the `ClusterOperator`.
//!
//! ## Metrics
//!
//! - `marketplace_operator_reconciliations_total` - reconciliation attempts per controller
//! - `marketplace_operator_reconciliation_errors_total` - reconciliation errors per controller
//! - `marketplace_operator_reconciliation_duration_seconds` - reconciliation latency
//! - `marketplace_app_registry_requests_total` - app-registry requests per source and status code
//! - `marketplace_app_registry_request_duration_seconds` - app-registry latency per source
//! - `marketplace_update_polls_total` - update polls per source

pub mod appregistry;
pub mod catalogsourceconfig;
pub mod clock;
pub mod config;
pub mod controller;
pub mod crd;
pub mod datastore;
pub mod defaults;
pub mod error;
pub mod kube_client;
pub mod manifest;
pub mod metrics;
pub mod operatorsource;
pub mod ownership;
pub mod phase;
pub mod poller;
pub mod proxy;
pub mod registry;
pub mod status;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::appregistry::{ClientFactory, HttpClientFactory, RegistryClient};
    pub use crate::config::OperatorConfig;
    pub use crate::controller::run;
    pub use crate::crd::{
        CatalogSource, CatalogSourceConfig, CatalogSourceConfigSpec, CatalogSourceConfigStatus,
        ClusterOperator, OperatorHub, OperatorSource, OperatorSourceSpec, OperatorSourceStatus,
    };
    pub use crate::datastore::Datastore;
    pub use crate::error::{OperatorError, Result};
    pub use crate::phase::{Phase, PhaseName};
}
