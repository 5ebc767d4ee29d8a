//! Digest comparison between stored and freshly listed repositories

use crate::manifest::RegistryMetadata;
use std::collections::BTreeMap;

/// Repositories that differ between two listings of a registry namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl RepositoryDiff {
    /// Compare stored `repository -> metadata` against a fresh listing
    pub fn compute(stored: &BTreeMap<String, RegistryMetadata>, fresh: &[RegistryMetadata]) -> Self {
        let fresh: BTreeMap<&str, &RegistryMetadata> =
            fresh.iter().map(|md| (md.repository.as_str(), md)).collect();

        let mut diff = RepositoryDiff::default();
        for (repository, md) in &fresh {
            match stored.get(*repository) {
                None => diff.added.push(repository.to_string()),
                Some(old) if old.digest != md.digest => diff.changed.push(repository.to_string()),
                Some(_) => {}
            }
        }
        diff.removed = stored
            .keys()
            .filter(|repository| !fresh.contains_key(repository.as_str()))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Every repository that differs, sorted
    pub fn repositories(&self) -> Vec<&str> {
        let mut all: Vec<&str> = self
            .added
            .iter()
            .chain(&self.removed)
            .chain(&self.changed)
            .map(String::as_str)
            .collect();
        all.sort_unstable();
        all
    }
}
