//! Test doubles: in-memory Kubernetes API, canned app-registry, manual clock
//! and fixture builders.

use crate::appregistry::{
    ClientFactory, PackageDescriptor, PackageMetadata, RegistryClient, RegistryOptions,
};
use crate::clock::Clock;
use crate::crd::APP_REGISTRY_TYPE;
use crate::error::{OperatorError, Result};
use crate::kube_client::{Kube, KubeClient};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DynamicObject, TypeMeta};
use kube::core::{ApiResource, ErrorResponse};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Kubernetes API
// ============================================================================

type ObjectKey = (String, String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_version: u64,
    next_ip: u32,
    unavailable: HashSet<String>,
    deletions: Vec<ObjectKey>,
}

/// In-memory stand-in for the API server
#[derive(Clone, Default)]
pub struct FakeKube {
    state: Arc<Mutex<FakeState>>,
}

fn type_key(resource: &ApiResource) -> String {
    if resource.group.is_empty() {
        resource.kind.clone()
    } else {
        format!("{}.{}", resource.kind, resource.group)
    }
}

fn api_error(code: u16, reason: &str, message: String) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn matches_selector(object: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = object.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed facade backed by this fake
    pub fn kube(&self) -> Kube {
        Kube::new(Arc::new(self.clone()))
    }

    /// Make every request for `kind` fail with 404, as if the API was not installed
    pub fn make_unavailable(&self, kind: &str) {
        self.state.lock().unavailable.insert(kind.to_string());
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(k, _, _)| k.split('.').next() == Some(kind))
            .count()
    }

    /// `(kind, namespace, name)` of every delete that removed an object
    pub fn deletions(&self) -> Vec<(String, String, String)> {
        self.state
            .lock()
            .deletions
            .iter()
            .map(|(k, ns, name)| {
                (
                    k.split('.').next().unwrap_or_default().to_string(),
                    ns.clone(),
                    name.clone(),
                )
            })
            .collect()
    }

    fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectKey {
        (
            type_key(resource),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        )
    }

    fn check_available(state: &FakeState, resource: &ApiResource) -> Result<()> {
        if state.unavailable.contains(&resource.kind) {
            return Err(api_error(
                404,
                "NotFound",
                format!("the server could not find the requested resource ({})", resource.plural),
            ));
        }
        Ok(())
    }

    fn bump(state: &mut FakeState, object: &mut DynamicObject) {
        state.next_version += 1;
        object.metadata.resource_version = Some(state.next_version.to_string());
    }

    fn check_version(stored: &DynamicObject, incoming: &DynamicObject, resource: &ApiResource) -> Result<()> {
        match &incoming.metadata.resource_version {
            Some(rv) if Some(rv) != stored.metadata.resource_version.as_ref() => {
                Err(OperatorError::Conflict {
                    kind: resource.kind.clone(),
                    name: incoming.metadata.name.clone().unwrap_or_default(),
                    message: "the object has been modified".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.state.lock();
        Self::check_available(&state, resource)?;
        Ok(state.objects.get(&Self::key(resource, namespace, name)).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.lock();
        Self::check_available(&state, resource)?;
        let kind = type_key(resource);
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.map_or(true, |want| want == ns.as_str()))
            .map(|(_, object)| object)
            .filter(|object| matches_selector(object, label_selector))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        Self::check_available(&state, resource)?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| api_error(422, "Invalid", "name is required".to_string()))?;
        let key = Self::key(resource, namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind: resource.kind.clone(),
                name,
                namespace: key.1,
            });
        }

        let mut created = object.clone();
        created.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        created.metadata.namespace = namespace.map(str::to_string);
        created.metadata.generation = Some(1);
        created.metadata.deletion_timestamp = None;
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        if created.metadata.uid.is_none() {
            created.metadata.uid = Some(format!("uid-{}", state.next_version + 1));
        }
        if resource.kind == "Service" {
            state.next_ip += 1;
            let ip = format!("10.0.0.{}", state.next_ip);
            if let Some(spec) = created.data.get_mut("spec").and_then(|s| s.as_object_mut()) {
                spec.insert("clusterIP".to_string(), ip.into());
            }
        }
        Self::bump(&mut state, &mut created);
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        Self::check_available(&state, resource)?;
        let name = object.metadata.name.clone().unwrap_or_default();
        let key = Self::key(resource, namespace, &name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| OperatorError::not_found(&resource.kind, namespace, &name))?;
        Self::check_version(&stored, object, resource)?;

        let mut updated = object.clone();
        updated.types = stored.types.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        // status is only written through the subresource
        match stored.data.get("status") {
            Some(status) => {
                updated.data["status"] = status.clone();
            }
            None => {
                if let Some(map) = updated.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let generation = stored.metadata.generation.unwrap_or(1);
        updated.metadata.generation = Some(if stored.data.get("spec") != updated.data.get("spec") {
            generation + 1
        } else {
            generation
        });

        if updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty())
        {
            state.objects.remove(&key);
            state.deletions.push(key);
            return Ok(updated);
        }

        Self::bump(&mut state, &mut updated);
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        Self::check_available(&state, resource)?;
        let name = object.metadata.name.clone().unwrap_or_default();
        let key = Self::key(resource, namespace, &name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| OperatorError::not_found(&resource.kind, namespace, &name))?;
        Self::check_version(&stored, object, resource)?;

        let mut updated = stored;
        match object.data.get("status") {
            Some(status) => updated.data["status"] = status.clone(),
            None => {
                if let Some(map) = updated.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        Self::bump(&mut state, &mut updated);
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch_finalizers(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        finalizers: &[String],
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        Self::check_available(&state, resource)?;
        let key = Self::key(resource, namespace, name);
        let mut patched = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| OperatorError::not_found(&resource.kind, namespace, name))?;
        patched.metadata.finalizers = Some(finalizers.to_vec());

        if patched.metadata.deletion_timestamp.is_some() && finalizers.is_empty() {
            state.objects.remove(&key);
            state.deletions.push(key);
            return Ok(patched);
        }
        Self::bump(&mut state, &mut patched);
        state.objects.insert(key, patched.clone());
        Ok(patched)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        Self::check_available(&state, resource)?;
        let key = Self::key(resource, namespace, name);
        let Some(mut stored) = state.objects.get(&key).cloned() else {
            return Ok(false);
        };

        if stored.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
            Self::bump(&mut state, &mut stored);
            state.objects.insert(key, stored);
        } else {
            state.objects.remove(&key);
            state.deletions.push(key);
        }
        Ok(true)
    }
}

// ============================================================================
// App-registry
// ============================================================================

#[derive(Clone)]
struct Published {
    release: String,
    digest: String,
    blob: Vec<u8>,
}

/// App-registry serving canned blobs
#[derive(Default)]
pub struct FakeRegistry {
    repositories: Mutex<BTreeMap<(String, String), Published>>,
    unreadable: Mutex<HashSet<(String, String)>>,
    unreachable: Mutex<bool>,
}

impl FakeRegistry {
    pub fn publish(&self, namespace: &str, repository: &str, release: &str, digest: &str, blob: Vec<u8>) {
        self.repositories.lock().insert(
            (namespace.to_string(), repository.to_string()),
            Published {
                release: release.to_string(),
                digest: digest.to_string(),
                blob,
            },
        );
    }

    pub fn unpublish(&self, namespace: &str, repository: &str) {
        self.repositories
            .lock()
            .remove(&(namespace.to_string(), repository.to_string()));
    }

    /// Make release metadata lookups of one repository fail
    pub fn fail_metadata(&self, namespace: &str, repository: &str) {
        self.unreadable
            .lock()
            .insert((namespace.to_string(), repository.to_string()));
    }

    /// Make every request fail as if the endpoint was down
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    fn check_reachable(&self) -> Result<()> {
        if *self.unreachable.lock() {
            return Err(OperatorError::AppRegistry("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn list_packages(&self, namespace: &str) -> Result<Vec<PackageDescriptor>> {
        self.check_reachable()?;
        Ok(self
            .repositories
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, repository), published)| PackageDescriptor {
                repository: repository.clone(),
                default_release: published.release.clone(),
            })
            .collect())
    }

    async fn get_package_metadata(
        &self,
        namespace: &str,
        repository: &str,
        _release: &str,
    ) -> Result<PackageMetadata> {
        self.check_reachable()?;
        let key = (namespace.to_string(), repository.to_string());
        if self.unreadable.lock().contains(&key) {
            return Err(OperatorError::AppRegistry(format!("{}/{}: 500 Internal Server Error", namespace, repository)));
        }
        self.repositories
            .lock()
            .get(&(namespace.to_string(), repository.to_string()))
            .map(|p| PackageMetadata {
                digest: p.digest.clone(),
            })
            .ok_or_else(|| OperatorError::AppRegistry(format!("{}/{} not found", namespace, repository)))
    }

    async fn download_manifest(
        &self,
        namespace: &str,
        repository: &str,
        digest: &str,
    ) -> Result<Vec<u8>> {
        self.check_reachable()?;
        self.repositories
            .lock()
            .get(&(namespace.to_string(), repository.to_string()))
            .filter(|p| p.digest == digest)
            .map(|p| p.blob.clone())
            .ok_or_else(|| OperatorError::AppRegistry(format!("blob {} not found", digest)))
    }
}

/// Factory handing out one shared [`FakeRegistry`]
#[derive(Default)]
pub struct FakeClientFactory {
    pub registry: Arc<FakeRegistry>,
    requests: Mutex<Vec<RegistryOptions>>,
}

impl FakeClientFactory {
    /// Options every client was built with, in order
    pub fn requests(&self) -> Vec<RegistryOptions> {
        self.requests.lock().clone()
    }
}

impl ClientFactory for FakeClientFactory {
    fn new_client(&self, options: &RegistryOptions) -> Result<Arc<dyn RegistryClient>> {
        if options.source_type != APP_REGISTRY_TYPE {
            return Err(OperatorError::InvalidSpec(format!(
                "operator source type '{}' is not supported",
                options.source_type
            )));
        }
        self.requests.lock().push(options.clone());
        Ok(self.registry.clone())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub mod fixtures {
    use super::*;
    use crate::crd::{
        CatalogSourceConfig, CatalogSourceConfigSpec, OperatorSource, OperatorSourceSpec,
    };
    use crate::manifest::blob::encode_blob;
    use crate::manifest::{
        marshal, ClusterServiceVersion, CrdKey, CustomResourceDefinition, OperatorManifest,
        PackageChannel, PackageManifest, RawOperatorManifestData, StructuredOperatorManifestData,
    };
    use serde_json::json;

    pub const NAMESPACE: &str = "openshift-marketplace";
    pub const REGISTRY_NAMESPACE: &str = "marketplace_e2e";

    pub fn crd(kind: &str, name: &str, version: &str) -> CustomResourceDefinition {
        CustomResourceDefinition(json!({
            "apiVersion": "apiextensions.k8s.io/v1beta1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": name},
            "spec": {
                "group": name.split_once('.').map(|(_, g)| g).unwrap_or_default(),
                "names": {"kind": kind, "plural": name.split('.').next().unwrap_or_default()},
                "scope": "Namespaced",
                "version": version
            }
        }))
    }

    pub fn csv(name: &str, replaces: &str, owned: &[CrdKey]) -> ClusterServiceVersion {
        let owned: Vec<_> = owned
            .iter()
            .map(|k| json!({"name": k.name, "kind": k.kind, "version": k.version}))
            .collect();
        let mut spec = json!({
            "displayName": name,
            "customresourcedefinitions": {"owned": owned}
        });
        if !replaces.is_empty() {
            spec["replaces"] = replaces.into();
        }
        ClusterServiceVersion(json!({
            "apiVersion": "operators.coreos.com/v1alpha1",
            "kind": "ClusterServiceVersion",
            "metadata": {"name": name},
            "spec": spec
        }))
    }

    pub fn package(name: &str, channel: &str, current_csv: &str) -> PackageManifest {
        PackageManifest {
            package_name: name.to_string(),
            channels: vec![PackageChannel {
                name: channel.to_string(),
                current_csv: current_csv.to_string(),
            }],
            default_channel: Some(channel.to_string()),
        }
    }

    pub fn etcd_structured_manifest() -> StructuredOperatorManifestData {
        let etcd = crd("EtcdCluster", "etcdclusters.etcd.database.coreos.com", "v1beta2");
        let key = etcd.key().unwrap();
        StructuredOperatorManifestData {
            custom_resource_definitions: vec![etcd],
            cluster_service_versions: vec![
                csv("etcdoperator.v0.9.2", "etcdoperator.v0.9.0", std::slice::from_ref(&key)),
                csv("etcdoperator.v0.9.0", "", &[key]),
            ],
            packages: vec![package("etcd", "alpha", "etcdoperator.v0.9.2")],
        }
    }

    /// One package, one CSV, one CRD
    pub fn simple_structured_manifest(package_name: &str, csv_name: &str, kind: &str) -> StructuredOperatorManifestData {
        let owned = crd(kind, &format!("{}s.example.com", kind.to_lowercase()), "v1");
        let key = owned.key().unwrap();
        StructuredOperatorManifestData {
            custom_resource_definitions: vec![owned],
            cluster_service_versions: vec![csv(csv_name, "", &[key])],
            packages: vec![package(package_name, "stable", csv_name)],
        }
    }

    pub fn merge(manifests: &[StructuredOperatorManifestData]) -> StructuredOperatorManifestData {
        let mut merged = StructuredOperatorManifestData::default();
        for m in manifests {
            merged
                .custom_resource_definitions
                .extend(m.custom_resource_definitions.iter().cloned());
            merged
                .cluster_service_versions
                .extend(m.cluster_service_versions.iter().cloned());
            merged.packages.extend(m.packages.iter().cloned());
        }
        merged
    }

    pub fn etcd_raw_manifest() -> RawOperatorManifestData {
        marshal(&etcd_structured_manifest()).unwrap()
    }

    pub fn etcd_operator_manifest() -> OperatorManifest {
        OperatorManifest {
            publisher: "CoreOS".to_string(),
            data: etcd_raw_manifest(),
        }
    }

    pub fn etcd_document_yaml() -> String {
        serde_yaml::to_string(&etcd_operator_manifest()).unwrap()
    }

    pub fn blob_for(structured: &StructuredOperatorManifestData) -> Vec<u8> {
        encode_blob(&OperatorManifest {
            publisher: "test".to_string(),
            data: marshal(structured).unwrap(),
        })
        .unwrap()
    }

    pub fn etcd_blob() -> Vec<u8> {
        encode_blob(&etcd_operator_manifest()).unwrap()
    }

    pub fn operator_source(name: &str, namespace: &str) -> OperatorSource {
        let mut source = OperatorSource::new(
            name,
            OperatorSourceSpec {
                source_type: APP_REGISTRY_TYPE.to_string(),
                endpoint: "https://quay.io/cnr".to_string(),
                registry_namespace: REGISTRY_NAMESPACE.to_string(),
                authorization_token: None,
                display_name: Some("E2E Operators".to_string()),
                publisher: Some("Red Hat".to_string()),
            },
        );
        source.metadata.namespace = Some(namespace.to_string());
        source
    }

    pub fn operator_source_with_uid(name: &str, namespace: &str, uid: &str) -> OperatorSource {
        let mut source = operator_source(name, namespace);
        source.metadata.uid = Some(uid.to_string());
        source
    }

    pub fn catalog_source_config(name: &str, target_namespace: &str, packages: &str) -> CatalogSourceConfig {
        let mut csc = CatalogSourceConfig::new(
            name,
            CatalogSourceConfigSpec {
                source: String::new(),
                target_namespace: target_namespace.to_string(),
                packages: packages.to_string(),
                display_name: Some("Custom Operators".to_string()),
                publisher: Some("Example".to_string()),
            },
        );
        csc.metadata.namespace = Some(NAMESPACE.to_string());
        csc
    }

    /// Registry holding the etcd repository in the e2e namespace
    pub fn etcd_registry() -> FakeClientFactory {
        let factory = FakeClientFactory::default();
        factory
            .registry
            .publish(REGISTRY_NAMESPACE, "etcd", "1.0.0", "sha-etcd-1", etcd_blob());
        factory
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Both controllers wired against one fake cluster, registry and datastore
pub struct Harness {
    pub fake: FakeKube,
    pub clock: Arc<ManualClock>,
    pub datastore: Arc<crate::datastore::Datastore>,
    pub factory: Arc<FakeClientFactory>,
    pub counters: Arc<crate::status::SyncCounters>,
    pub config: crate::config::OperatorConfig,
}

impl Harness {
    pub fn new(factory: FakeClientFactory) -> Self {
        Self {
            fake: FakeKube::new(),
            clock: Arc::new(ManualClock::default()),
            datastore: Arc::new(crate::datastore::Datastore::new()),
            factory: Arc::new(factory),
            counters: Arc::new(crate::status::SyncCounters::new(10_000)),
            config: crate::config::OperatorConfig::default(),
        }
    }

    pub fn kube(&self) -> Kube {
        self.fake.kube()
    }

    pub fn operator_source_context(&self) -> crate::operatorsource::Context {
        crate::operatorsource::Context::new(
            self.kube(),
            self.datastore.clone(),
            self.factory.clone(),
            self.clock.clone(),
            self.counters.clone(),
            self.config.clone(),
        )
    }

    /// Fresh context each call, so its spec cache starts empty
    pub fn catalog_source_config_context(&self) -> crate::catalogsourceconfig::Context {
        crate::catalogsourceconfig::Context::new(
            self.kube(),
            self.datastore.clone(),
            self.clock.clone(),
            self.counters.clone(),
            self.config.clone(),
        )
    }

    /// One reconciliation of the live OperatorSource `name`
    pub async fn sync_source(
        &self,
        ctx: &crate::operatorsource::Context,
        name: &str,
    ) -> Result<crate::phase::PhaseName> {
        let live: crate::crd::OperatorSource = self
            .kube()
            .get_required(Some(fixtures::NAMESPACE), name)
            .await?;
        crate::operatorsource::sync(ctx, live).await
    }

    /// Reconcile until the source rests in `Succeeded` or `Failed`
    pub async fn settle_source(
        &self,
        ctx: &crate::operatorsource::Context,
        name: &str,
    ) -> crate::phase::PhaseName {
        let mut phase = crate::phase::PhaseName::Initial;
        for _ in 0..10 {
            phase = match self.sync_source(ctx, name).await {
                Ok(phase) => phase,
                Err(e) => self.failed_phase::<crate::crd::OperatorSource>(name, e).await,
            };
            if matches!(
                phase,
                crate::phase::PhaseName::Succeeded | crate::phase::PhaseName::Failed
            ) {
                break;
            }
        }
        phase
    }

    /// One reconciliation of the live CatalogSourceConfig `name`
    pub async fn sync_csc(
        &self,
        ctx: &crate::catalogsourceconfig::Context,
        name: &str,
    ) -> Result<crate::phase::PhaseName> {
        let live: crate::crd::CatalogSourceConfig = self
            .kube()
            .get_required(Some(fixtures::NAMESPACE), name)
            .await?;
        crate::catalogsourceconfig::sync(ctx, live).await
    }

    /// Phase persisted alongside a re-raised error; only `Failed` is expected
    async fn failed_phase<K>(&self, name: &str, error: crate::error::OperatorError) -> crate::phase::PhaseName
    where
        K: crate::kube_client::KubeResource + crate::crd::PhasedResource,
    {
        let live: K = self
            .kube()
            .get_required(Some(fixtures::NAMESPACE), name)
            .await
            .unwrap();
        let phase = live.phase_name();
        assert_eq!(phase, crate::phase::PhaseName::Failed, "unexpected error: {error}");
        phase
    }

    pub async fn settle_csc(
        &self,
        ctx: &crate::catalogsourceconfig::Context,
        name: &str,
    ) -> crate::phase::PhaseName {
        let mut phase = crate::phase::PhaseName::Initial;
        for _ in 0..10 {
            phase = match self.sync_csc(ctx, name).await {
                Ok(phase) => phase,
                Err(e) => self.failed_phase::<crate::crd::CatalogSourceConfig>(name, e).await,
            };
            if matches!(
                phase,
                crate::phase::PhaseName::Succeeded | crate::phase::PhaseName::Failed
            ) {
                break;
            }
        }
        phase
    }
}
