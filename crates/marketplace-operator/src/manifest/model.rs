//! Manifest data model
//!
//! CRDs and CSVs are kept as opaque JSON documents so they round-trip to OLM
//! untouched; only the handful of fields needed for indexing are read out of
//! them.

use super::ManifestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique identity of a `CustomResourceDefinition` within a manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrdKey {
    pub kind: String,
    pub name: String,
    pub version: String,
}

impl fmt::Display for CrdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (kind={}, version={})", self.name, self.kind, self.version)
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// A CustomResourceDefinition document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomResourceDefinition(pub Value);

impl CustomResourceDefinition {
    /// Derive the key from `metadata.name`, `spec.names.kind` and the served version
    pub fn key(&self) -> Result<CrdKey, ManifestError> {
        let name = str_at(&self.0, "/metadata/name")
            .ok_or_else(|| ManifestError::missing("CustomResourceDefinition", "metadata.name"))?;
        let kind = str_at(&self.0, "/spec/names/kind")
            .ok_or_else(|| ManifestError::missing(name, "spec.names.kind"))?;
        let version = str_at(&self.0, "/spec/version")
            .or_else(|| str_at(&self.0, "/spec/versions/0/name"))
            .ok_or_else(|| ManifestError::missing(name, "spec.version"))?;

        Ok(CrdKey {
            kind: kind.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

/// A ClusterServiceVersion document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterServiceVersion(pub Value);

impl ClusterServiceVersion {
    pub fn name(&self) -> Result<&str, ManifestError> {
        str_at(&self.0, "/metadata/name")
            .ok_or_else(|| ManifestError::missing("ClusterServiceVersion", "metadata.name"))
    }

    /// Name of the CSV this one replaces, empty at the end of a chain
    pub fn replaces(&self) -> &str {
        str_at(&self.0, "/spec/replaces").unwrap_or_default()
    }

    /// CRDs owned by this CSV
    pub fn owned_crds(&self) -> Result<Vec<CrdKey>, ManifestError> {
        self.crd_refs("owned")
    }

    /// CRDs this CSV depends on but does not own
    pub fn required_crds(&self) -> Result<Vec<CrdKey>, ManifestError> {
        self.crd_refs("required")
    }

    fn crd_refs(&self, section: &str) -> Result<Vec<CrdKey>, ManifestError> {
        let pointer = format!("/spec/customresourcedefinitions/{}", section);
        let Some(entries) = self.0.pointer(&pointer) else {
            return Ok(Vec::new());
        };
        let entries = entries.as_array().ok_or_else(|| {
            ManifestError::yaml(
                "clusterServiceVersions",
                format!("{} is not a list in CSV {}", pointer, self.name().unwrap_or("<unnamed>")),
            )
        })?;

        entries
            .iter()
            .map(|entry| {
                let csv = self.name().unwrap_or("<unnamed>");
                let field = |f: &str| {
                    str_at(entry, &format!("/{}", f))
                        .map(str::to_string)
                        .ok_or_else(|| ManifestError::missing(csv, &format!("{}[].{}", section, f)))
                };
                Ok(CrdKey {
                    kind: field("kind")?,
                    name: field("name")?,
                    version: field("version")?,
                })
            })
            .collect()
    }
}

/// A named stream of a package pointing at its newest CSV
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageChannel {
    pub name: String,
    #[serde(rename = "currentCSV")]
    pub current_csv: String,
}

/// OLM package manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub package_name: String,
    #[serde(default)]
    pub channels: Vec<PackageChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<String>,
}

/// Manifest with every section parsed into lists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredOperatorManifestData {
    #[serde(default)]
    pub custom_resource_definitions: Vec<CustomResourceDefinition>,
    #[serde(default)]
    pub cluster_service_versions: Vec<ClusterServiceVersion>,
    #[serde(default)]
    pub packages: Vec<PackageManifest>,
}

/// Manifest whose sections are embedded YAML strings, as stored in the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOperatorManifestData {
    #[serde(default)]
    pub custom_resource_definitions: String,
    #[serde(default)]
    pub cluster_service_versions: String,
    #[serde(default)]
    pub packages: String,
}

/// Document downloaded from an app-registry repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorManifest {
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub data: RawOperatorManifestData,
}

/// Everything needed to publish one package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleOperatorManifest {
    pub package: PackageManifest,
    pub custom_resource_definitions: Vec<CustomResourceDefinition>,
    pub cluster_service_versions: Vec<ClusterServiceVersion>,
}

/// Location and digest of a repository release in an app-registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryMetadata {
    pub namespace: String,
    pub repository: String,
    pub release: String,
    pub digest: String,
}

impl RegistryMetadata {
    /// `namespace/repository`
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }
}

/// A downloaded manifest blob together with where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorMetadata {
    pub registry_metadata: RegistryMetadata,
    pub blob: Vec<u8>,
}
