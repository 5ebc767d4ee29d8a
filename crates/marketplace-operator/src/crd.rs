//! Custom Resource Definitions for the marketplace operator
//!
//! The operator owns two resource kinds, `OperatorSource` and
//! `CatalogSourceConfig`. It also reads and writes a handful of resources
//! that belong to OLM and to the OpenShift config API; those are declared here
//! with just the fields the operator touches.

use crate::phase::{ObjectPhase, PhaseName};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group shared by every resource the operator owns
pub const GROUP: &str = "operators.coreos.com";

/// The only `OperatorSource.spec.type` currently understood
pub const APP_REGISTRY_TYPE: &str = "appregistry";

/// Label marking a `CatalogSourceConfig` that only acts as a data store
pub const DATASTORE_LABEL: &str = "opsrc-datastore";

/// Label hiding a `CatalogSource` from the OLM console
pub const OLM_VISIBILITY_LABEL: &str = "olm-visibility";

/// Label marking a `CatalogSource` created for an `OperatorSource`
pub const MARKETPLACE_LABEL: &str = "openshift-marketplace";

/// Regex for validating app-registry namespaces
static REGISTRY_NAMESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap());

/// Validate an endpoint URL
fn validate_endpoint(value: &str) -> Result<(), ValidationError> {
    match reqwest::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
        _ => Err(ValidationError::new("invalid_endpoint")
            .with_message(format!("endpoint '{}' is not a valid URL", value).into())),
    }
}

/// Validate an app-registry namespace
fn validate_registry_namespace(value: &str) -> Result<(), ValidationError> {
    if REGISTRY_NAMESPACE_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_registry_namespace")
            .with_message(format!("registryNamespace '{}' is not valid", value).into()))
    }
}

// ============================================================================
// OperatorSource
// ============================================================================

/// OperatorSource custom resource definition
///
/// Describes a remote app-registry namespace whose operator manifests should be
/// made available on the cluster.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operators.coreos.com",
    version = "v1",
    kind = "OperatorSource",
    plural = "operatorsources",
    shortname = "opsrc",
    namespaced,
    status = "OperatorSourceStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".spec.endpoint"}"#,
    printcolumn = r#"{"name":"Registry", "type":"string", "jsonPath":".spec.registryNamespace"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.currentPhase.phase.name"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.currentPhase.phase.message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSourceSpec {
    /// Registry kind; only `appregistry` is supported
    #[serde(rename = "type", default)]
    #[validate(length(min = 1, message = "type must be specified"))]
    pub source_type: String,

    /// Base URL of the app-registry
    #[serde(default)]
    #[validate(length(min = 1, message = "endpoint must be specified"))]
    #[validate(custom(function = "validate_endpoint"))]
    pub endpoint: String,

    /// App-registry namespace (tenant) holding the manifests
    #[serde(default)]
    #[validate(length(min = 1, message = "registryNamespace must be specified"))]
    #[validate(custom(function = "validate_registry_namespace"))]
    pub registry_namespace: String,

    /// Secret holding the token used to authenticate against the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_token: Option<AuthorizationToken>,

    /// Display name of the published catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Publisher of the published catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

/// Reference to a secret holding an app-registry token
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationToken {
    /// Name of the secret
    #[serde(default)]
    pub secret_name: String,

    /// Namespace of the secret; defaults to the OperatorSource namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_namespace: Option<String>,
}

impl OperatorSourceSpec {
    /// The authorization token secret as `(namespace, name)`, if configured
    pub fn token_secret(&self, default_namespace: &str) -> Option<(String, String)> {
        self.authorization_token
            .as_ref()
            .filter(|t| !t.secret_name.is_empty())
            .map(|t| {
                (
                    t.secret_namespace
                        .clone()
                        .filter(|ns| !ns.is_empty())
                        .unwrap_or_else(|| default_namespace.to_string()),
                    t.secret_name.clone(),
                )
            })
    }
}

/// Status of an OperatorSource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSourceStatus {
    /// Current reconciliation phase
    #[serde(default)]
    pub current_phase: ObjectPhase,

    /// Comma separated list of package IDs served by this source
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub packages: String,

    /// Generation of the spec the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

// ============================================================================
// CatalogSourceConfig
// ============================================================================

/// CatalogSourceConfig custom resource definition
///
/// Selects a set of packages and publishes them as an OLM `CatalogSource` in
/// the target namespace.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operators.coreos.com",
    version = "v2",
    kind = "CatalogSourceConfig",
    plural = "catalogsourceconfigs",
    shortname = "csc",
    namespaced,
    status = "CatalogSourceConfigStatus",
    printcolumn = r#"{"name":"Target Namespace", "type":"string", "jsonPath":".spec.targetNamespace"}"#,
    printcolumn = r#"{"name":"Packages", "type":"string", "jsonPath":".spec.packages"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.currentPhase.phase.name"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.currentPhase.phase.message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceConfigSpec {
    /// Name of the OperatorSource to resolve packages against
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    /// Namespace the CatalogSource is published into
    #[serde(default)]
    #[validate(length(min = 1, message = "targetNamespace must be specified"))]
    pub target_namespace: String,

    /// Comma separated list of package IDs
    #[serde(default)]
    #[validate(length(min = 1, message = "packages must be specified"))]
    pub packages: String,

    /// Display name of the published catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Publisher of the published catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

impl CatalogSourceConfigSpec {
    /// Requested package IDs, trimmed, de-duplicated and sorted
    pub fn package_list(&self) -> Vec<String> {
        let mut packages: Vec<String> = self
            .packages
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        packages.sort();
        packages.dedup();
        packages
    }

    /// Snapshot of the fields whose change forces a re-publish
    pub fn snapshot(&self) -> CatalogSourceConfigSnapshot {
        CatalogSourceConfigSnapshot {
            target_namespace: self.target_namespace.clone(),
            packages: self.package_list(),
        }
    }
}

/// Fields of a CatalogSourceConfig spec that were last published
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceConfigSnapshot {
    /// Target namespace the children were created in
    pub target_namespace: String,

    /// Sorted package IDs
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Status of a CatalogSourceConfig
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceConfigStatus {
    /// Current reconciliation phase
    #[serde(default)]
    pub current_phase: ObjectPhase,

    /// Comma separated list of package IDs that were published
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub packages: String,

    /// Spec fields the published children were built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_published: Option<CatalogSourceConfigSnapshot>,

    /// Generation of the spec the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Read access to the persisted phase of either owned kind
pub trait PhasedResource {
    /// Name of the current phase, `Initial` when there is no status yet
    fn phase_name(&self) -> PhaseName;
}

impl PhasedResource for OperatorSource {
    fn phase_name(&self) -> PhaseName {
        self.status
            .as_ref()
            .map(|s| s.current_phase.phase.name)
            .unwrap_or_default()
    }
}

impl PhasedResource for CatalogSourceConfig {
    fn phase_name(&self) -> PhaseName {
        self.status
            .as_ref()
            .map(|s| s.current_phase.phase.name)
            .unwrap_or_default()
    }
}

// ============================================================================
// OLM CatalogSource (consumed)
// ============================================================================

/// OLM CatalogSource, the consumption point for operator manifests
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "CatalogSource",
    plural = "catalogsources",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceSpec {
    /// Kind of registry backing the catalog (`grpc`, `configmap`, ...)
    pub source_type: String,

    /// `host:port` of a gRPC registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// ConfigMap holding manifests for `configmap` catalogs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,

    /// Registry image for `grpc` catalogs served by OLM itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

/// How OLM refreshes a catalog
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_poll: Option<RegistryPoll>,
}

/// Polling configuration for a catalog registry
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPoll {
    /// Poll interval as a Go duration string, e.g. `15m`
    pub interval: String,
}

// ============================================================================
// OpenShift config API (consumed)
// ============================================================================

/// Cluster-wide configuration of the default sources
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "OperatorHub",
    plural = "operatorhubs",
    status = "OperatorHubStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorHubSpec {
    /// Disable every default source unless individually re-enabled
    #[serde(default)]
    pub disable_all_default_sources: bool,

    /// Per-source overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<HubSource>,
}

/// Override for a single default source
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSource {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Status of the OperatorHub
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorHubStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<HubSourceStatus>,
}

/// Outcome of applying the OperatorHub configuration to one default source
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSourceStatus {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    /// `Success` or `Error`
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Cluster proxy configuration
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Proxy",
    plural = "proxies",
    status = "ProxyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_ca: Option<ConfigMapNameReference>,
}

/// Reference to a cluster-scoped config map by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ConfigMapNameReference {
    pub name: String,
}

/// Effective proxy settings as observed by the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

/// Operator health record read by the cluster version operator
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterOperator",
    plural = "clusteroperators",
    status = "ClusterOperatorStatus"
)]
pub struct ClusterOperatorSpec {}

/// Reported state of a cluster operator
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterOperatorCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<OperandVersion>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_objects: Vec<RelatedObject>,
}

/// One condition of a cluster operator (`Available`, `Degraded`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Version of an operand managed by a cluster operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct OperandVersion {
    pub name: String,
    pub version: String,
}

/// Object the cluster operator is responsible for
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct RelatedObject {
    pub group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}
