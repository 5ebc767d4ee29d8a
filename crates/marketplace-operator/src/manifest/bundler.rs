//! Merges single-package manifests into one publishable bundle

use super::model::{
    ClusterServiceVersion, CrdKey, CustomResourceDefinition, PackageManifest,
    SingleOperatorManifest, StructuredOperatorManifestData,
};
use super::ManifestError;
use std::collections::BTreeMap;

/// Bundle `manifests` into a single structured manifest
///
/// Fails when a package appears twice or when two packages carry a CRD or CSV
/// of the same identity with different content. Output is sorted by package
/// name, CRD key and CSV name.
pub fn bundle(manifests: &[SingleOperatorManifest]) -> Result<StructuredOperatorManifestData, ManifestError> {
    let mut packages: BTreeMap<&str, &PackageManifest> = BTreeMap::new();
    let mut crds: BTreeMap<CrdKey, &CustomResourceDefinition> = BTreeMap::new();
    let mut csvs: BTreeMap<&str, &ClusterServiceVersion> = BTreeMap::new();

    for manifest in manifests {
        let name = manifest.package.package_name.as_str();
        if packages.insert(name, &manifest.package).is_some() {
            return Err(ManifestError::DuplicatePackage(name.to_string()));
        }

        for crd in &manifest.custom_resource_definitions {
            let key = crd.key()?;
            match crds.get(&key) {
                Some(existing) if *existing != crd => {
                    return Err(ManifestError::ConflictingCrd { key })
                }
                Some(_) => {}
                None => {
                    crds.insert(key, crd);
                }
            }
        }

        for csv in &manifest.cluster_service_versions {
            let csv_name = csv.name()?;
            match csvs.get(csv_name) {
                Some(existing) if *existing != csv => {
                    return Err(ManifestError::ConflictingCsv {
                        name: csv_name.to_string(),
                    })
                }
                Some(_) => {}
                None => {
                    csvs.insert(csv_name, csv);
                }
            }
        }
    }

    Ok(StructuredOperatorManifestData {
        custom_resource_definitions: crds.into_values().cloned().collect(),
        cluster_service_versions: csvs.into_values().cloned().collect(),
        packages: packages.into_values().cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::decompose;
    use crate::testing::fixtures;

    fn inputs() -> Vec<SingleOperatorManifest> {
        let manifest = fixtures::merge(&[
            fixtures::etcd_structured_manifest(),
            fixtures::simple_structured_manifest("redis", "redis-operator.v1.0.0", "RedisCluster"),
        ]);
        decompose(&manifest).unwrap()
    }

    #[test]
    fn test_bundle_then_decompose_yields_inputs() {
        let mut original = inputs();
        let bundled = bundle(&original).unwrap();
        assert_eq!(bundled.packages.len(), 2);

        let mut again = decompose(&bundled).unwrap();
        original.sort_by(|a, b| a.package.package_name.cmp(&b.package.package_name));
        again.sort_by(|a, b| a.package.package_name.cmp(&b.package.package_name));
        assert_eq!(again, original);
    }

    #[test]
    fn test_every_owned_crd_is_bundled() {
        let bundled = bundle(&inputs()).unwrap();
        let keys: Vec<CrdKey> = bundled
            .custom_resource_definitions
            .iter()
            .map(|c| c.key().unwrap())
            .collect();
        for csv in &bundled.cluster_service_versions {
            for owned in csv.owned_crds().unwrap() {
                assert!(keys.contains(&owned), "{owned} missing from bundle");
            }
        }
    }

    #[test]
    fn test_duplicate_package() {
        let manifests = inputs();
        let twice = vec![manifests[0].clone(), manifests[0].clone()];
        assert!(matches!(bundle(&twice), Err(ManifestError::DuplicatePackage(_))));
    }

    #[test]
    fn test_divergent_crd_across_packages() {
        let mut manifests = inputs();
        let mut shared = manifests[0].custom_resource_definitions[0].clone();
        manifests[1].custom_resource_definitions.push(shared.clone());
        assert!(bundle(&manifests).is_ok());

        shared.0["spec"]["scope"] = "Cluster".into();
        manifests[1].custom_resource_definitions.pop();
        manifests[1].custom_resource_definitions.push(shared);
        assert!(matches!(bundle(&manifests), Err(ManifestError::ConflictingCrd { .. })));
    }
}
