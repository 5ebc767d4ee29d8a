//! Last published spec of every CatalogSourceConfig, keyed by UID

use crate::crd::{CatalogSourceConfig, CatalogSourceConfigSnapshot};
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct CscCache {
    entries: RwLock<HashMap<String, CatalogSourceConfigSnapshot>>,
}

impl CscCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &str) -> Option<CatalogSourceConfigSnapshot> {
        self.entries.read().get(uid).cloned()
    }

    pub fn set(&self, uid: &str, snapshot: CatalogSourceConfigSnapshot) {
        self.entries.write().insert(uid.to_string(), snapshot);
    }

    pub fn evict(&self, uid: &str) -> Option<CatalogSourceConfigSnapshot> {
        self.entries.write().remove(uid)
    }

    /// What `csc` was last published with
    ///
    /// Falls back to `status.lastPublished` when the process has restarted
    /// since, and re-seeds the cache from it.
    pub fn published(&self, csc: &CatalogSourceConfig) -> Option<CatalogSourceConfigSnapshot> {
        let uid = csc.uid().unwrap_or_default();
        if let Some(snapshot) = self.get(&uid) {
            return Some(snapshot);
        }
        let snapshot = csc.status.as_ref()?.last_published.clone()?;
        self.set(&uid, snapshot.clone());
        Some(snapshot)
    }

    /// The previous snapshot when the spec no longer matches it
    pub fn changed(&self, csc: &CatalogSourceConfig) -> Option<CatalogSourceConfigSnapshot> {
        self.published(csc)
            .filter(|previous| *previous != csc.spec.snapshot())
    }
}
