//! App-registry client
//!
//! Talks the CNR flavoured app-registry HTTP protocol: list the repositories
//! of a namespace, resolve a release to a blob digest, download the blob.
//! Reconcilers only see the [`RegistryClient`] trait, created through a
//! [`ClientFactory`] so tests can substitute canned registries.

use crate::crd::{OperatorSource, APP_REGISTRY_TYPE};
use crate::error::{OperatorError, Result};
use crate::kube_client::Kube;
use crate::manifest::{OperatorMetadata, RegistryMetadata};
use crate::metrics::record_registry_request;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Secret key holding the registry token
pub const TOKEN_SECRET_KEY: &str = "token";

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A repository as listed by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    /// Repository name, without the namespace prefix
    pub repository: String,
    /// Release served by default
    pub default_release: String,
}

/// Release metadata of a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub digest: String,
}

/// Operations against one app-registry endpoint
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_packages(&self, namespace: &str) -> Result<Vec<PackageDescriptor>>;

    async fn get_package_metadata(
        &self,
        namespace: &str,
        repository: &str,
        release: &str,
    ) -> Result<PackageMetadata>;

    async fn download_manifest(&self, namespace: &str, repository: &str, digest: &str)
        -> Result<Vec<u8>>;
}

/// Parameters for building a registry client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    /// `spec.type` of the source
    pub source_type: String,
    pub endpoint: String,
    /// Bearer token sent in the `Authorization` header
    pub token: Option<String>,
    /// Name of the source, used to label metrics
    pub source_name: String,
}

impl RegistryOptions {
    pub fn for_source(source: &OperatorSource, token: Option<String>) -> Self {
        Self {
            source_type: source.spec.source_type.clone(),
            endpoint: source.spec.endpoint.clone(),
            token,
            source_name: source.name_any(),
        }
    }
}

/// Builds registry clients for a source type
pub trait ClientFactory: Send + Sync {
    fn new_client(&self, options: &RegistryOptions) -> Result<Arc<dyn RegistryClient>>;
}

/// Factory producing [`HttpRegistryClient`]s
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    timeout: Duration,
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HttpClientFactory {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientFactory for HttpClientFactory {
    fn new_client(&self, options: &RegistryOptions) -> Result<Arc<dyn RegistryClient>> {
        if options.source_type != APP_REGISTRY_TYPE {
            return Err(OperatorError::InvalidSpec(format!(
                "operator source type '{}' is not supported",
                options.source_type
            )));
        }
        Ok(Arc::new(HttpRegistryClient::new(options, self.timeout)?))
    }
}

#[derive(Deserialize)]
struct ListedPackage {
    name: String,
    #[serde(default)]
    default: String,
}

#[derive(Deserialize)]
struct ReleaseContent {
    digest: String,
}

#[derive(Deserialize)]
struct Release {
    content: ReleaseContent,
}

/// reqwest based [`RegistryClient`]
pub struct HttpRegistryClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    source_name: String,
}

impl HttpRegistryClient {
    pub fn new(options: &RegistryOptions, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OperatorError::AppRegistry(e.to_string()))?;

        Ok(Self {
            http,
            base: options.endpoint.trim_end_matches('/').to_string(),
            token: options.token.clone(),
            source_name: options.source_name.clone(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.http.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        let start = Instant::now();
        let response = request.send().await;
        let code = response.as_ref().map(|r| r.status().as_u16()).unwrap_or(0);
        record_registry_request(&self.source_name, code, start.elapsed());

        let response = response.map_err(|e| OperatorError::AppRegistry(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(OperatorError::AppRegistry(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        debug!(url = %url, code, "app-registry request");
        Ok(response)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_packages(&self, namespace: &str) -> Result<Vec<PackageDescriptor>> {
        let listed: Vec<ListedPackage> = self
            .get("/api/v1/packages", &[("namespace", namespace)])
            .await?
            .json()
            .await
            .map_err(|e| OperatorError::AppRegistry(e.to_string()))?;

        Ok(listed
            .into_iter()
            .map(|p| PackageDescriptor {
                repository: p
                    .name
                    .split_once('/')
                    .map(|(_, repo)| repo.to_string())
                    .unwrap_or(p.name),
                default_release: p.default,
            })
            .collect())
    }

    async fn get_package_metadata(
        &self,
        namespace: &str,
        repository: &str,
        release: &str,
    ) -> Result<PackageMetadata> {
        let path = format!("/api/v1/packages/{}/{}/{}/helm", namespace, repository, release);
        let release: Release = self
            .get(&path, &[])
            .await?
            .json()
            .await
            .map_err(|e| OperatorError::AppRegistry(e.to_string()))?;
        Ok(PackageMetadata {
            digest: release.content.digest,
        })
    }

    async fn download_manifest(
        &self,
        namespace: &str,
        repository: &str,
        digest: &str,
    ) -> Result<Vec<u8>> {
        let path = format!("/api/v1/packages/{}/{}/blobs/sha256/{}", namespace, repository, digest);
        let bytes = self
            .get(&path, &[])
            .await?
            .bytes()
            .await
            .map_err(|e| OperatorError::AppRegistry(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// List every repository of `namespace` together with its current digest
///
/// Only a failed listing is fatal. Repositories whose release metadata cannot
/// be read are returned as errors next to the rest.
pub async fn retrieve_metadata(
    client: &dyn RegistryClient,
    namespace: &str,
) -> Result<(Vec<RegistryMetadata>, Vec<OperatorError>)> {
    let packages = client.list_packages(namespace).await?;
    let mut metadata = Vec::with_capacity(packages.len());
    let mut errors = Vec::new();
    for package in packages {
        match client
            .get_package_metadata(namespace, &package.repository, &package.default_release)
            .await
        {
            Ok(release) => metadata.push(RegistryMetadata {
                namespace: namespace.to_string(),
                repository: package.repository,
                release: package.default_release,
                digest: release.digest,
            }),
            Err(e) => {
                warn!(namespace, repository = %package.repository, error = %e, "failed to read package metadata");
                errors.push(e);
            }
        }
    }
    Ok((metadata, errors))
}

/// Download the blob of every repository in `metadata`
///
/// Failed downloads are returned alongside the successful ones so a single bad
/// repository does not hide the rest.
pub async fn retrieve_manifests(
    client: &dyn RegistryClient,
    metadata: Vec<RegistryMetadata>,
) -> (Vec<OperatorMetadata>, Vec<OperatorError>) {
    let mut manifests = Vec::with_capacity(metadata.len());
    let mut errors = Vec::new();
    for md in metadata {
        match client
            .download_manifest(&md.namespace, &md.repository, &md.digest)
            .await
        {
            Ok(blob) => manifests.push(OperatorMetadata {
                registry_metadata: md,
                blob,
            }),
            Err(e) => {
                warn!(repository = %md.id(), error = %e, "failed to download manifest");
                errors.push(e);
            }
        }
    }
    (manifests, errors)
}

/// Read the registry token referenced by `source`, if any
pub async fn resolve_token(kube: &Kube, source: &OperatorSource) -> Result<Option<String>> {
    let namespace = source.namespace().unwrap_or_default();
    let Some((secret_ns, secret_name)) = source.spec.token_secret(&namespace) else {
        return Ok(None);
    };

    let secret: Secret = kube.get_required(Some(&secret_ns), &secret_name).await?;
    let token = secret
        .data
        .as_ref()
        .and_then(|data| data.get(TOKEN_SECRET_KEY))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).trim().to_string())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(TOKEN_SECRET_KEY))
                .map(|s| s.trim().to_string())
        })
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            OperatorError::InvalidSpec(format!(
                "secret {}/{} has no '{}' key",
                secret_ns, secret_name, TOKEN_SECRET_KEY
            ))
        })?;
    Ok(Some(token))
}
