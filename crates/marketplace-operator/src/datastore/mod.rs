//! In-memory store of downloaded operator manifests
//!
//! One row per `OperatorSource`, keyed by UID. A row holds the per-package
//! manifests decomposed from everything the source's registry namespace serves
//! and the registry metadata (digests) they were downloaded at, which the
//! update poller diffs against.
//!
//! All rows sit behind a single `RwLock`. Blobs are decoded and decomposed
//! before the lock is taken so writers hold it only to swap row contents.

mod diff;

pub use diff::RepositoryDiff;

use crate::crd::{OperatorSource, OperatorSourceSpec};
use crate::error::{OperatorError, Result};
use crate::manifest::{
    bundle, decode_blob, decompose, unmarshal, OperatorMetadata, RegistryMetadata,
    SingleOperatorManifest, StructuredOperatorManifestData,
};
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Identity of an operator source as stored in the datastore
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSourceKey {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub spec: OperatorSourceSpec,
}

impl OperatorSourceKey {
    pub fn from_source(source: &OperatorSource) -> Self {
        Self {
            uid: source.uid().unwrap_or_default(),
            name: source.name_any(),
            namespace: source.namespace().unwrap_or_default(),
            spec: source.spec.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Row {
    key: OperatorSourceKey,
    manifests: BTreeMap<String, SingleOperatorManifest>,
    repositories: BTreeMap<String, RegistryMetadata>,
    packages_by_repository: BTreeMap<String, Vec<String>>,
}

impl Row {
    fn new(key: OperatorSourceKey) -> Self {
        Self {
            key,
            manifests: BTreeMap::new(),
            repositories: BTreeMap::new(),
            packages_by_repository: BTreeMap::new(),
        }
    }
}

/// Result of writing downloaded manifests for a source
#[derive(Debug)]
pub struct WriteOutcome {
    /// Number of package manifests stored
    pub count: usize,
    /// Blobs that could not be decoded or decomposed
    pub faults: Option<OperatorError>,
}

/// Packages whose registry content changed for one source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUpdate {
    pub key: OperatorSourceKey,
    pub diff: RepositoryDiff,
    /// Package IDs affected by the change, sorted
    pub package_ids: Vec<String>,
}

/// Process-wide manifest store
#[derive(Debug, Default)]
pub struct Datastore {
    rows: RwLock<HashMap<String, Row>>,
}

/// Package IDs produced by one repository
///
/// A repository serving a single package is addressed by `namespace/repository`;
/// repositories bundling several packages fall back to `namespace/packageName`.
fn package_ids(md: &RegistryMetadata, manifests: &[SingleOperatorManifest]) -> Vec<String> {
    match manifests {
        [_] => vec![md.id()],
        many => many
            .iter()
            .map(|m| format!("{}/{}", md.namespace, m.package.package_name))
            .collect(),
    }
}

fn decompose_blob(md: &OperatorMetadata) -> Result<Vec<SingleOperatorManifest>> {
    let document = decode_blob(&md.blob)?;
    let structured = unmarshal(&document.data)?;
    Ok(decompose(&structured)?)
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a source with an empty row. Existing rows are left alone.
    pub fn add_operator_source(&self, source: &OperatorSource) {
        let key = OperatorSourceKey::from_source(source);
        let mut rows = self.rows.write();
        rows.entry(key.uid.clone()).or_insert_with(|| Row::new(key));
    }

    /// Replace a source's manifests with the decomposition of `metadata`
    ///
    /// Blobs that fail to decode are skipped and reported in
    /// [`WriteOutcome::faults`]; the rest are stored.
    pub fn write(&self, source: &OperatorSource, metadata: Vec<OperatorMetadata>) -> WriteOutcome {
        let key = OperatorSourceKey::from_source(source);

        let mut manifests = BTreeMap::new();
        let mut repositories = BTreeMap::new();
        let mut packages_by_repository = BTreeMap::new();
        let mut served_by: HashMap<String, String> = HashMap::new();
        let mut faults = Vec::new();

        for md in metadata {
            let registry = md.registry_metadata.clone();
            match decompose_blob(&md) {
                Ok(decomposed) => {
                    let ids = package_ids(&registry, &decomposed);
                    let mut stored = Vec::with_capacity(ids.len());
                    for (id, manifest) in ids.into_iter().zip(decomposed) {
                        // first repository in listing order keeps the ID
                        if let Some(existing) = served_by.get(&id) {
                            warn!(package = %id, repository = %registry.id(), existing = %existing, "duplicate package ID, skipping");
                            faults.push(OperatorError::DuplicatePackage {
                                package: id,
                                repository: registry.id(),
                                existing: existing.clone(),
                            });
                            continue;
                        }
                        served_by.insert(id.clone(), registry.id());
                        manifests.insert(id.clone(), manifest);
                        stored.push(id);
                    }
                    packages_by_repository.insert(registry.repository.clone(), stored);
                }
                Err(e) => {
                    warn!(repository = %registry.id(), error = %e, "skipping faulty manifest");
                    faults.push(OperatorError::FaultyManifest {
                        repository: registry.id(),
                        source: Box::new(e),
                    });
                }
            }
            // Faulty repositories are still tracked so they do not look new on every poll
            repositories.insert(registry.repository.clone(), registry);
        }

        let count = manifests.len();
        {
            let mut rows = self.rows.write();
            let row = rows.entry(key.uid.clone()).or_insert_with(|| Row::new(key.clone()));
            row.key = key;
            row.manifests = manifests;
            row.repositories = repositories;
            row.packages_by_repository = packages_by_repository;
        }
        debug!(source = %source.name_any(), count, "wrote manifests");

        WriteOutcome {
            count,
            faults: OperatorError::aggregate(faults),
        }
    }

    /// Manifest of a single package from the first of `sources` (UIDs) serving it
    pub fn read(&self, sources: &[String], package_id: &str) -> Result<SingleOperatorManifest> {
        let rows = self.rows.read();
        sources
            .iter()
            .filter_map(|uid| rows.get(uid))
            .find_map(|row| row.manifests.get(package_id))
            .cloned()
            .ok_or_else(|| OperatorError::ManifestNotFound(package_id.to_string()))
    }

    /// Bundle of the given packages as served by `sources`
    pub fn read_bundle(&self, sources: &[String], package_ids: &[String]) -> Result<StructuredOperatorManifestData> {
        let manifests = package_ids
            .iter()
            .map(|id| self.read(sources, id))
            .collect::<Result<Vec<_>>>()?;
        Ok(bundle(&manifests)?)
    }

    /// Sorted package IDs stored for a source
    pub fn get_package_ids_by_operator_source(&self, uid: &str) -> Vec<String> {
        let rows = self.rows.read();
        rows.get(uid)
            .map(|row| row.manifests.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys of every stored source
    pub fn get_all_operator_sources(&self) -> Vec<OperatorSourceKey> {
        let rows = self.rows.read();
        let mut keys: Vec<OperatorSourceKey> = rows.values().map(|row| row.key.clone()).collect();
        keys.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        keys
    }

    /// Key of a stored source by namespace and name
    pub fn get_operator_source(&self, namespace: &str, name: &str) -> Option<OperatorSourceKey> {
        let rows = self.rows.read();
        rows.values()
            .find(|row| row.key.namespace == namespace && row.key.name == name)
            .map(|row| row.key.clone())
    }

    /// Whether a source has a row
    pub fn contains(&self, uid: &str) -> bool {
        self.rows.read().contains_key(uid)
    }

    /// Whether any repository was added, removed or changed digest
    pub fn operator_source_has_update(&self, uid: &str, fresh: &[RegistryMetadata]) -> bool {
        self.diff(uid, fresh).is_some_and(|u| !u.diff.is_empty())
    }

    /// Compute what changed for a source; `None` if the source is unknown
    pub fn diff(&self, uid: &str, fresh: &[RegistryMetadata]) -> Option<SourceUpdate> {
        let rows = self.rows.read();
        let row = rows.get(uid)?;
        let diff = RepositoryDiff::compute(&row.repositories, fresh);

        let namespace = &row.key.spec.registry_namespace;
        let package_ids: BTreeSet<String> = diff
            .repositories()
            .into_iter()
            .flat_map(|repository| {
                row.packages_by_repository
                    .get(repository)
                    .cloned()
                    .unwrap_or_else(|| vec![format!("{}/{}", namespace, repository)])
            })
            .collect();

        Some(SourceUpdate {
            key: row.key.clone(),
            diff,
            package_ids: package_ids.into_iter().collect(),
        })
    }

    /// Sources whose stored packages include every one of `package_ids`
    pub fn sources_serving(&self, package_ids: &[String]) -> Vec<OperatorSourceKey> {
        let rows = self.rows.read();
        let mut keys: Vec<OperatorSourceKey> = rows
            .values()
            .filter(|row| package_ids.iter().all(|id| row.manifests.contains_key(id)))
            .map(|row| row.key.clone())
            .collect();
        keys.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        keys
    }

    /// Drop a source and everything stored for it
    pub fn remove_operator_source(&self, uid: &str) -> bool {
        self.rows.write().remove(uid).is_some()
    }
}
