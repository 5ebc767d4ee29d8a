//! Owner-label contract between custom resources and their children
//!
//! Children never carry owner references across namespaces, so each child is
//! tied to its owner by exactly two labels: `<prefix>-owner-name` and
//! `<prefix>-owner-namespace`, where the prefix depends on the owner kind.

use crate::error::{OperatorError, Result};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Kind of a resource that owns children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    OperatorSource,
    CatalogSourceConfig,
}

impl OwnerKind {
    pub const ALL: [OwnerKind; 2] = [OwnerKind::OperatorSource, OwnerKind::CatalogSourceConfig];

    pub fn name_label(&self) -> &'static str {
        match self {
            OwnerKind::OperatorSource => "opsrc-owner-name",
            OwnerKind::CatalogSourceConfig => "csc-owner-name",
        }
    }

    pub fn namespace_label(&self) -> &'static str {
        match self {
            OwnerKind::OperatorSource => "opsrc-owner-namespace",
            OwnerKind::CatalogSourceConfig => "csc-owner-namespace",
        }
    }
}

/// Identity of an owning custom resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub kind: OwnerKind,
    pub name: String,
    pub namespace: String,
}

impl Owner {
    pub fn new(kind: OwnerKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// The two owner labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.kind.name_label().to_string(), self.name.clone()),
            (self.kind.namespace_label().to_string(), self.namespace.clone()),
        ])
    }

    /// Label selector matching every child of this owner
    pub fn selector(&self) -> String {
        format!(
            "{}={},{}={}",
            self.kind.name_label(),
            self.name,
            self.kind.namespace_label(),
            self.namespace
        )
    }

    /// Recover the owner of a child from its labels
    pub fn from_labels(kind: OwnerKind, labels: &BTreeMap<String, String>) -> Option<Self> {
        let name = labels.get(kind.name_label()).filter(|v| !v.is_empty())?;
        let namespace = labels.get(kind.namespace_label()).filter(|v| !v.is_empty())?;
        Some(Self::new(kind, name.clone(), namespace.clone()))
    }

    /// Whether `meta` is labelled as a child of this owner
    pub fn is_owner_of(&self, meta: &ObjectMeta) -> bool {
        meta.labels
            .as_ref()
            .and_then(|labels| Owner::from_labels(self.kind, labels))
            .is_some_and(|owner| owner == *self)
    }

    /// Merge the owner labels into `meta`
    pub fn apply(&self, meta: &mut ObjectMeta) {
        meta.labels.get_or_insert_with(BTreeMap::new).extend(self.labels());
    }

    /// Refuse to touch an existing child that belongs to someone else
    pub fn ensure_owned(&self, kind: &str, meta: &ObjectMeta) -> Result<()> {
        if self.is_owner_of(meta) {
            return Ok(());
        }
        Err(OperatorError::OwnershipConflict(format!(
            "{} {}/{} exists but is not owned by {}/{}",
            kind,
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default(),
            self.namespace,
            self.name
        )))
    }
}
