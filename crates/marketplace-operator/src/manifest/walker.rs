//! Traversal of a structured manifest along each channel's `replaces` chain

use super::model::{
    ClusterServiceVersion, CrdKey, CustomResourceDefinition, PackageManifest,
    StructuredOperatorManifestData,
};
use super::ManifestError;
use std::collections::{HashMap, HashSet};

/// Receives the objects reachable from each package
pub trait ManifestDiscovery {
    /// Called for every CSV on a channel's chain
    fn new_csv(&mut self, package: &PackageManifest, csv: &ClusterServiceVersion) -> Result<(), ManifestError>;

    /// Called for every CRD owned by a CSV, right after that CSV
    fn new_crd(&mut self, package: &PackageManifest, crd: &CustomResourceDefinition) -> Result<(), ManifestError>;

    /// Called once per package after all of its channels were walked
    fn new_package(&mut self, package: &PackageManifest) -> Result<(), ManifestError>;
}

/// Walk every package of `manifest`, feeding `discovery`
///
/// Required CRDs are not followed; they belong to whichever package owns them.
pub fn walk(
    manifest: &StructuredOperatorManifestData,
    discovery: &mut dyn ManifestDiscovery,
) -> Result<(), ManifestError> {
    let csvs: HashMap<&str, &ClusterServiceVersion> = manifest
        .cluster_service_versions
        .iter()
        .map(|csv| -> Result<_, ManifestError> { Ok((csv.name()?, csv)) })
        .collect::<Result<_, ManifestError>>()?;
    let crds: HashMap<CrdKey, &CustomResourceDefinition> = manifest
        .custom_resource_definitions
        .iter()
        .map(|crd| -> Result<_, ManifestError> { Ok((crd.key()?, crd)) })
        .collect::<Result<_, ManifestError>>()?;

    for package in &manifest.packages {
        let mut visited: HashSet<&str> = HashSet::new();

        for channel in &package.channels {
            let mut next = channel.current_csv.as_str();

            // `visited` also terminates cyclic chains
            while !next.is_empty() && visited.insert(next) {
                let csv = csvs.get(next).copied().ok_or_else(|| ManifestError::UnresolvedCsv {
                    package: package.package_name.clone(),
                    csv: next.to_string(),
                })?;
                discovery.new_csv(package, csv)?;

                for key in csv.owned_crds()? {
                    let crd = crds.get(&key).copied().ok_or_else(|| ManifestError::UnresolvedCrd {
                        csv: next.to_string(),
                        key: key.clone(),
                    })?;
                    discovery.new_crd(package, crd)?;
                }

                next = csv.replaces();
            }
        }

        discovery.new_package(package)?;
    }

    Ok(())
}
