//! Process-wide view of the `OperatorHub` configuration

use crate::crd::OperatorHubSpec;
use parking_lot::RwLock;

/// Name of the only `OperatorHub` object the operator honours
pub const OPERATOR_HUB_NAME: &str = "cluster";

/// Thread-safe holder of the current `OperatorHub` spec
///
/// Before any spec is set every default is enabled.
#[derive(Debug, Default)]
pub struct HubConfig {
    spec: RwLock<OperatorHubSpec>,
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, spec: &OperatorHubSpec) {
        *self.spec.write() = spec.clone();
    }

    pub fn get(&self) -> OperatorHubSpec {
        self.spec.read().clone()
    }

    /// Whether the default `name` is disabled
    ///
    /// A per-source entry overrides `disableAllDefaultSources` in either
    /// direction.
    pub fn disabled(&self, name: &str) -> bool {
        let spec = self.spec.read();
        spec.sources
            .iter()
            .rev()
            .find(|s| s.name == name)
            .map_or(spec.disable_all_default_sources, |s| s.disabled)
    }
}
