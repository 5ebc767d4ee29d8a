//! Operator manifest handling
//!
//! An app-registry repository holds a single YAML document whose `data`
//! section embeds three YAML lists as strings: CRDs, CSVs and packages. This
//! module turns that document into structured form ([`parser`]), splits it
//! into one manifest per package by following each channel's `replaces` chain
//! ([`walker`], [`decomposer`]) and merges a selection of packages back into a
//! single bundle for publication ([`bundler`]).

pub mod blob;
pub mod bundler;
pub mod decomposer;
pub mod model;
pub mod parser;
pub mod walker;

pub use blob::decode_blob;
pub use bundler::bundle;
pub use decomposer::decompose;
pub use model::{
    ClusterServiceVersion, CrdKey, CustomResourceDefinition, OperatorManifest, OperatorMetadata,
    PackageChannel, PackageManifest, RawOperatorManifestData, RegistryMetadata,
    SingleOperatorManifest, StructuredOperatorManifestData,
};
pub use parser::{marshal, unmarshal};
pub use walker::{walk, ManifestDiscovery};

use thiserror::Error;

/// Errors raised while parsing, walking or bundling manifests
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManifestError {
    #[error("error parsing {section}: {message}")]
    InvalidYaml { section: String, message: String },

    #[error("{object} is missing required field {field}")]
    MissingField { object: String, field: String },

    #[error("CRD {key} is defined more than once with different content")]
    ConflictingCrd { key: CrdKey },

    #[error("CSV {name} is defined more than once with different content")]
    ConflictingCsv { name: String },

    #[error("package {0} is specified more than once")]
    DuplicatePackage(String),

    #[error("package {package} refers to CSV {csv} which is not present in the manifest")]
    UnresolvedCsv { package: String, csv: String },

    #[error("CSV {csv} owns CRD {key} which is not present in the manifest")]
    UnresolvedCrd { csv: String, key: CrdKey },

    #[error("invalid manifest blob: {0}")]
    InvalidBlob(String),
}

impl ManifestError {
    pub(crate) fn yaml(section: &str, err: impl std::fmt::Display) -> Self {
        ManifestError::InvalidYaml {
            section: section.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn missing(object: impl Into<String>, field: &str) -> Self {
        ManifestError::MissingField {
            object: object.into(),
            field: field.to_string(),
        }
    }
}
