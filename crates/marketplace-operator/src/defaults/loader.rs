//! Loading of the default source definitions shipped with the operator

use crate::crd::{CatalogSource, OperatorSource};
use crate::error::{OperatorError, Result};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// A default source restored by the operator
#[derive(Debug, Clone)]
pub enum DefaultDefinition {
    OperatorSource(OperatorSource),
    CatalogSource(CatalogSource),
}

impl DefaultDefinition {
    pub fn name(&self) -> String {
        match self {
            DefaultDefinition::OperatorSource(source) => source.name_any(),
            DefaultDefinition::CatalogSource(catalog) => catalog.name_any(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DefaultDefinition::OperatorSource(_) => "OperatorSource",
            DefaultDefinition::CatalogSource(_) => "CatalogSource",
        }
    }

    /// Place the definition in `namespace` unless it names one itself
    fn with_default_namespace(mut self, namespace: &str) -> Self {
        let meta = match &mut self {
            DefaultDefinition::OperatorSource(source) => &mut source.metadata,
            DefaultDefinition::CatalogSource(catalog) => &mut catalog.metadata,
        };
        if meta.namespace.as_deref().map_or(true, str::is_empty) {
            meta.namespace = Some(namespace.to_string());
        }
        self
    }
}

/// Parse a single YAML document holding an OperatorSource or a CatalogSource
pub fn parse_definition(yaml: &str) -> Result<DefaultDefinition> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .unwrap_or_default()
        .to_string();
    let definition = match kind.as_str() {
        "OperatorSource" => DefaultDefinition::OperatorSource(serde_yaml::from_value(value)?),
        "CatalogSource" => DefaultDefinition::CatalogSource(serde_yaml::from_value(value)?),
        other => {
            return Err(OperatorError::InvalidSpec(format!(
                "unsupported default kind '{}'",
                other
            )))
        }
    };
    if definition.name().is_empty() {
        return Err(OperatorError::InvalidSpec(format!(
            "default {} has no name",
            definition.kind()
        )));
    }
    Ok(definition)
}

/// Load every `*.yaml`/`*.yml` file in `dir`, keyed by object name
///
/// A missing directory yields no defaults. Unparseable files are skipped with
/// a warning. When two files define the same name the later path wins.
pub fn load_dir(dir: &Path, namespace: &str) -> Result<BTreeMap<String, DefaultDefinition>> {
    let mut definitions = BTreeMap::new();
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "defaults directory not found, no defaults loaded");
        return Ok(definitions);
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        match parse_definition(&content) {
            Ok(definition) => {
                let definition = definition.with_default_namespace(namespace);
                debug!(path = %path.display(), name = %definition.name(), kind = definition.kind(), "loaded default");
                definitions.insert(definition.name(), definition);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping default definition"),
        }
    }

    info!(count = definitions.len(), "defaults loaded");
    Ok(definitions)
}
