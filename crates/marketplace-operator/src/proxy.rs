//! Cluster proxy settings injected into registry pods

use crate::crd::Proxy;
use crate::error::Result;
use crate::kube_client::Kube;
use k8s_openapi::api::core::v1::{ConfigMap, EnvVar};
use tracing::debug;

/// Name of the cluster-wide Proxy object
pub const CLUSTER_PROXY_NAME: &str = "cluster";

/// ConfigMap the cluster network operator fills with the trusted CA bundle
pub const TRUSTED_CA_CONFIGMAP: &str = "marketplace-trusted-ca";

/// Key of the CA bundle inside [`TRUSTED_CA_CONFIGMAP`]
pub const TRUSTED_CA_KEY: &str = "ca-bundle.crt";

/// Where the bundle is mounted in registry pods
pub const TRUSTED_CA_MOUNT_PATH: &str = "/etc/pki/ca-trust/extracted/pem/";

/// File name the bundle is projected to
pub const TRUSTED_CA_FILE: &str = "tls-ca-bundle.pem";

const PROXY_VARS: [&str; 3] = ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"];

/// Proxy environment and trusted CA for registry pods
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxySettings {
    pub env: Vec<EnvVar>,
    /// Name of the trusted-CA config map, when one exists in the operator namespace
    pub trusted_ca: Option<String>,
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Proxy variables from the operator's own environment
pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Vec<EnvVar> {
    PROXY_VARS
        .iter()
        .filter_map(|name| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .map(|value| env_var(name, &value))
        })
        .collect()
}

fn from_status(proxy: &Proxy) -> Vec<EnvVar> {
    let Some(status) = &proxy.status else {
        return Vec::new();
    };
    [
        ("HTTP_PROXY", &status.http_proxy),
        ("HTTPS_PROXY", &status.https_proxy),
        ("NO_PROXY", &status.no_proxy),
    ]
    .into_iter()
    .filter_map(|(name, value)| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| env_var(name, v))
    })
    .collect()
}

/// Resolve the proxy settings for registry pods in `operator_namespace`
///
/// The cluster Proxy object wins; when the Proxy API is absent the operator's
/// own environment is passed through.
pub async fn resolve(kube: &Kube, operator_namespace: &str) -> Result<ProxySettings> {
    let env = match kube.get::<Proxy>(None, CLUSTER_PROXY_NAME).await {
        Ok(Some(proxy)) => from_status(&proxy),
        Ok(None) => Vec::new(),
        Err(e) if e.is_not_found() => {
            debug!("proxy API not available, using process environment");
            from_env(|name| std::env::var(name).ok())
        }
        Err(e) => return Err(e),
    };

    let trusted_ca = kube
        .get::<ConfigMap>(Some(operator_namespace), TRUSTED_CA_CONFIGMAP)
        .await?
        .filter(|cm| {
            cm.data
                .as_ref()
                .is_some_and(|data| data.contains_key(TRUSTED_CA_KEY))
        })
        .map(|_| TRUSTED_CA_CONFIGMAP.to_string());

    Ok(ProxySettings { env, trusted_ca })
}
