//! Conversion between raw and structured manifests

use super::model::{
    ClusterServiceVersion, CrdKey, CustomResourceDefinition, OperatorManifest, PackageManifest,
    RawOperatorManifestData, StructuredOperatorManifestData,
};
use super::ManifestError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

const CRDS: &str = "customResourceDefinitions";
const CSVS: &str = "clusterServiceVersions";
const PACKAGES: &str = "packages";

fn parse_list<T: DeserializeOwned>(section: &str, yaml: &str) -> Result<Vec<T>, ManifestError> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Option<Vec<T>> =
        serde_yaml::from_str(yaml).map_err(|e| ManifestError::yaml(section, e))?;
    Ok(parsed.unwrap_or_default())
}

fn to_yaml<T: Serialize>(section: &str, items: &[T]) -> Result<String, ManifestError> {
    if items.is_empty() {
        return Ok(String::new());
    }
    serde_yaml::to_string(items).map_err(|e| ManifestError::yaml(section, e))
}

/// Parse a manifest document as downloaded from a registry
pub fn parse_document(yaml: &str) -> Result<OperatorManifest, ManifestError> {
    serde_yaml::from_str(yaml).map_err(|e| ManifestError::yaml("manifest", e))
}

/// Parse the embedded sections of a raw manifest
///
/// CRDs that appear more than once with identical bodies are collapsed; a key
/// reused with a different body is rejected.
pub fn unmarshal(raw: &RawOperatorManifestData) -> Result<StructuredOperatorManifestData, ManifestError> {
    let crds: Vec<CustomResourceDefinition> = parse_list(CRDS, &raw.custom_resource_definitions)?;
    let csvs: Vec<ClusterServiceVersion> = parse_list(CSVS, &raw.cluster_service_versions)?;
    let packages: Vec<PackageManifest> = parse_list(PACKAGES, &raw.packages)?;

    let mut seen: BTreeMap<CrdKey, usize> = BTreeMap::new();
    let mut unique_crds = Vec::with_capacity(crds.len());
    for crd in crds {
        let key = crd.key()?;
        match seen.get(&key) {
            Some(&idx) if unique_crds[idx] == crd => continue,
            Some(_) => return Err(ManifestError::ConflictingCrd { key }),
            None => {
                seen.insert(key, unique_crds.len());
                unique_crds.push(crd);
            }
        }
    }

    let mut csv_names = HashSet::new();
    let mut unique_csvs = Vec::with_capacity(csvs.len());
    for csv in csvs {
        let name = csv.name()?.to_string();
        if csv_names.insert(name.clone()) {
            unique_csvs.push(csv);
        } else if !unique_csvs.iter().any(|c| *c == csv) {
            return Err(ManifestError::ConflictingCsv { name });
        }
    }

    for package in &packages {
        if package.package_name.is_empty() {
            return Err(ManifestError::missing("package", "packageName"));
        }
    }

    Ok(StructuredOperatorManifestData {
        custom_resource_definitions: unique_crds,
        cluster_service_versions: unique_csvs,
        packages,
    })
}

/// Serialize a structured manifest back into embedded YAML sections
///
/// CRDs are ordered by key and CSVs by name; package and channel order is kept.
pub fn marshal(structured: &StructuredOperatorManifestData) -> Result<RawOperatorManifestData, ManifestError> {
    let mut crds = structured
        .custom_resource_definitions
        .iter()
        .map(|crd| -> Result<_, ManifestError> { Ok((crd.key()?, crd)) })
        .collect::<Result<Vec<_>, ManifestError>>()?;
    crds.sort_by(|a, b| a.0.cmp(&b.0));
    let crds: Vec<&CustomResourceDefinition> = crds.into_iter().map(|(_, crd)| crd).collect();

    let mut csvs = structured
        .cluster_service_versions
        .iter()
        .map(|csv| -> Result<_, ManifestError> { Ok((csv.name()?, csv)) })
        .collect::<Result<Vec<_>, ManifestError>>()?;
    csvs.sort_by(|a, b| a.0.cmp(b.0));
    let csvs: Vec<&ClusterServiceVersion> = csvs.into_iter().map(|(_, csv)| csv).collect();

    Ok(RawOperatorManifestData {
        custom_resource_definitions: to_yaml(CRDS, &crds)?,
        cluster_service_versions: to_yaml(CSVS, &csvs)?,
        packages: to_yaml(PACKAGES, &structured.packages)?,
    })
}
