//! Operator configuration
//!
//! The binary fills [`OperatorConfig`] from command-line flags and the
//! environment; library code only ever sees this struct.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying the release version reported on the ClusterOperator
pub const RELEASE_VERSION_ENV: &str = "RELEASE_VERSION";

/// Version reported when no release version is set
pub const INDEPENDENT_VERSION: &str = "independent";

/// Image of the registry server used when none is configured
pub const DEFAULT_REGISTRY_IMAGE: &str = "quay.io/openshift/origin-operator-registry:latest";

/// Runtime configuration shared by every controller
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace the operator runs in and watches
    pub namespace: String,
    /// Image running `appregistry-server`
    pub registry_image: String,
    /// Directory holding the default OperatorSource/CatalogSource definitions
    pub defaults_dir: PathBuf,
    /// How often remote registries are polled for updates
    pub poll_interval: Duration,
    /// How often the ClusterOperator status is written
    pub status_interval: Duration,
    /// Name of the ClusterOperator object reported to
    pub cluster_operator_name: String,
    /// Version reported once the operator is available
    pub release_version: String,
    /// `updateStrategy.registryPoll.interval` of CatalogSources created for
    /// OperatorSources, e.g. `15m`
    pub catalog_poll_interval: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "openshift-marketplace".to_string(),
            registry_image: DEFAULT_REGISTRY_IMAGE.to_string(),
            defaults_dir: PathBuf::from("/defaults"),
            poll_interval: Duration::from_secs(900),
            status_interval: Duration::from_secs(20),
            cluster_operator_name: "marketplace".to_string(),
            release_version: INDEPENDENT_VERSION.to_string(),
            catalog_poll_interval: None,
        }
    }
}

/// Release version from `lookup(RELEASE_VERSION)`, falling back to `independent`
pub fn release_version(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup(RELEASE_VERSION_ENV)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| INDEPENDENT_VERSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.namespace, "openshift-marketplace");
        assert_eq!(config.poll_interval, Duration::from_secs(900));
        assert_eq!(config.cluster_operator_name, "marketplace");
        assert!(config.catalog_poll_interval.is_none());
    }

    #[test]
    fn test_release_version_fallback() {
        assert_eq!(release_version(|_| None), "independent");
        assert_eq!(release_version(|_| Some("  ".into())), "independent");
        assert_eq!(release_version(|_| Some("4.2.0".into())), "4.2.0");
    }
}
