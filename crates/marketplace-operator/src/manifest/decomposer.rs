//! Splits a multi-package manifest into one manifest per package

use super::model::{
    ClusterServiceVersion, CrdKey, CustomResourceDefinition, PackageManifest,
    SingleOperatorManifest, StructuredOperatorManifestData,
};
use super::walker::{walk, ManifestDiscovery};
use super::ManifestError;
use std::collections::BTreeMap;

#[derive(Default)]
struct Pending {
    csvs: BTreeMap<String, ClusterServiceVersion>,
    crds: BTreeMap<CrdKey, CustomResourceDefinition>,
}

/// Discovery sink accumulating per-package CSVs and CRDs
#[derive(Default)]
struct Decomposer {
    pending: BTreeMap<String, Pending>,
    manifests: Vec<SingleOperatorManifest>,
}

impl ManifestDiscovery for Decomposer {
    fn new_csv(&mut self, package: &PackageManifest, csv: &ClusterServiceVersion) -> Result<(), ManifestError> {
        let entry = self.pending.entry(package.package_name.clone()).or_default();
        entry
            .csvs
            .entry(csv.name()?.to_string())
            .or_insert_with(|| csv.clone());
        Ok(())
    }

    fn new_crd(&mut self, package: &PackageManifest, crd: &CustomResourceDefinition) -> Result<(), ManifestError> {
        let entry = self.pending.entry(package.package_name.clone()).or_default();
        // first seen wins; older CSVs further down the chain may shadow a key
        entry.crds.entry(crd.key()?).or_insert_with(|| crd.clone());
        Ok(())
    }

    fn new_package(&mut self, package: &PackageManifest) -> Result<(), ManifestError> {
        let pending = self.pending.remove(&package.package_name).unwrap_or_default();
        self.manifests.push(SingleOperatorManifest {
            package: package.clone(),
            custom_resource_definitions: pending.crds.into_values().collect(),
            cluster_service_versions: pending.csvs.into_values().collect(),
        });
        Ok(())
    }
}

/// Decompose `manifest` into one [`SingleOperatorManifest`] per package
pub fn decompose(manifest: &StructuredOperatorManifestData) -> Result<Vec<SingleOperatorManifest>, ManifestError> {
    let mut decomposer = Decomposer::default();
    walk(manifest, &mut decomposer)?;
    Ok(decomposer.manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_single_package() {
        let manifests = decompose(&fixtures::etcd_structured_manifest()).unwrap();
        assert_eq!(manifests.len(), 1);

        let etcd = &manifests[0];
        assert_eq!(etcd.package.package_name, "etcd");
        assert_eq!(etcd.cluster_service_versions.len(), 2);
        assert_eq!(etcd.custom_resource_definitions.len(), 1);
    }

    #[test]
    fn test_multiple_packages_are_separated() {
        let manifest = fixtures::merge(&[
            fixtures::etcd_structured_manifest(),
            fixtures::simple_structured_manifest("redis", "redis-operator.v1.0.0", "RedisCluster"),
        ]);
        let manifests = decompose(&manifest).unwrap();
        assert_eq!(manifests.len(), 2);

        let redis = manifests
            .iter()
            .find(|m| m.package.package_name == "redis")
            .unwrap();
        assert_eq!(redis.cluster_service_versions.len(), 1);
        assert_eq!(redis.custom_resource_definitions[0].key().unwrap().kind, "RedisCluster");
    }

    #[test]
    fn test_unreferenced_csvs_are_dropped() {
        let mut manifest = fixtures::etcd_structured_manifest();
        manifest
            .cluster_service_versions
            .push(fixtures::csv("orphan.v1.0.0", "", &[]));
        let manifests = decompose(&manifest).unwrap();
        assert!(manifests[0]
            .cluster_service_versions
            .iter()
            .all(|c| c.name().unwrap() != "orphan.v1.0.0"));
    }
}
