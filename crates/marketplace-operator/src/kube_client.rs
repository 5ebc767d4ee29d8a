//! Kubernetes client seam
//!
//! Reconcilers talk to the API server through the object-safe [`KubeClient`]
//! trait so tests can swap in an in-memory fake. [`Kube`] is the typed facade
//! used everywhere else; it converts between concrete resource types and
//! [`DynamicObject`] via serde.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use dashmap::DashSet;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Bound for every resource type passed through the typed facade
pub trait KubeResource:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> KubeResource for K where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Object-safe Kubernetes API operations used by the operator
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get an object, `None` if it does not exist. A kind the server does not
    /// serve is a 404 error.
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects, optionally filtered by a label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object; fails with [`OperatorError::AlreadyExists`] on a name clash
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace an object; fails with [`OperatorError::Conflict`] on a stale resourceVersion
    async fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace the status subresource of an object
    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Merge-patch `metadata.finalizers`, with no resourceVersion precondition
    async fn patch_finalizers(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        finalizers: &[String],
    ) -> Result<DynamicObject>;

    /// Delete an object. Returns `false` when it was already gone.
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool>;
}

/// Kinds the API server is known to serve
///
/// A 404 on a named get does not say whether the object or the whole API is
/// missing. The first such miss per kind is settled with a list; a kind seen
/// served is never listed again. Kinds found missing are not remembered, so a
/// CRD installed later is picked up.
#[derive(Debug, Default)]
pub(crate) struct ServedKinds {
    kinds: DashSet<String>,
}

impl ServedKinds {
    fn key(resource: &ApiResource) -> String {
        format!("{}/{}", resource.api_version, resource.plural)
    }

    pub(crate) fn is_known(&self, resource: &ApiResource) -> bool {
        self.kinds.contains(&Self::key(resource))
    }

    /// Settle a discovery list; a forbidden list still proves the kind is served
    pub(crate) fn record(
        &self,
        resource: &ApiResource,
        listed: std::result::Result<(), kube::Error>,
    ) -> Result<bool> {
        match listed {
            Ok(()) => {}
            Err(e) if is_status(&e, 404) => return Ok(false),
            Err(e) if is_status(&e, 403) => {
                debug!(kind = %resource.kind, "discovery list forbidden, assuming the kind is served");
            }
            Err(e) => return Err(e.into()),
        }
        self.kinds.insert(Self::key(resource));
        Ok(true)
    }
}

/// [`KubeClient`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    served: Arc<ServedKinds>,
}

impl ApiClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            served: Arc::new(ServedKinds::default()),
        }
    }

    async fn is_served(&self, resource: &ApiResource, api: &Api<DynamicObject>) -> Result<bool> {
        if self.served.is_known(resource) {
            return Ok(true);
        }
        let listed = api.list(&ListParams::default().limit(1)).await.map(|_| ());
        self.served.record(resource, listed)
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn object_name(object: &DynamicObject) -> Result<String> {
    object
        .metadata
        .name
        .clone()
        .ok_or_else(|| OperatorError::Internal("object has no name".to_string()))
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

#[async_trait]
impl KubeClient for ApiClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(resource, namespace);
        match api.get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if is_status(&e, 404) => {
                if self.is_served(resource, &api).await? {
                    Ok(None)
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.api(resource, namespace).list(&params).await?.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        match self
            .api(resource, namespace)
            .create(&PostParams::default(), object)
            .await
        {
            Ok(created) => Ok(created),
            Err(e) if is_status(&e, 409) => Err(OperatorError::AlreadyExists {
                kind: resource.kind.clone(),
                name: object_name(object)?,
                namespace: namespace.unwrap_or_default().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object_name(object)?;
        match self
            .api(resource, namespace)
            .replace(&name, &PostParams::default(), object)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(e) if is_status(&e, 409) => Err(OperatorError::Conflict {
                kind: resource.kind.clone(),
                name,
                message: e.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object_name(object)?;
        let body = serde_json::to_vec(object)?;
        match self
            .api(resource, namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(e) if is_status(&e, 409) => Err(OperatorError::Conflict {
                kind: resource.kind.clone(),
                name,
                message: e.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_finalizers(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        finalizers: &[String],
    ) -> Result<DynamicObject> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        Ok(self
            .api(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => {
                debug!(kind = %resource.kind, name = %name, "object already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Typed facade over a shared [`KubeClient`]
#[derive(Clone)]
pub struct Kube {
    inner: Arc<dyn KubeClient>,
}

impl Kube {
    pub fn new(inner: Arc<dyn KubeClient>) -> Self {
        Self { inner }
    }

    /// Facade over a live cluster connection
    pub fn from_client(client: Client) -> Self {
        Self::new(Arc::new(ApiClient::new(client)))
    }

    pub async fn get<K: KubeResource>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.inner
            .get(&api_resource::<K>(), namespace, name)
            .await?
            .map(from_dynamic)
            .transpose()
    }

    /// Get an object, failing with [`OperatorError::NotFound`] when absent
    pub async fn get_required<K: KubeResource>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.get(namespace, name)
            .await?
            .ok_or_else(|| OperatorError::not_found(&K::kind(&()), namespace, name))
    }

    pub async fn list<K: KubeResource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        self.inner
            .list(&api_resource::<K>(), namespace, label_selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn create<K: KubeResource>(&self, object: &K) -> Result<K> {
        let namespace = object.namespace();
        let created = self
            .inner
            .create(&api_resource::<K>(), namespace.as_deref(), &to_dynamic(object)?)
            .await?;
        from_dynamic(created)
    }

    pub async fn update<K: KubeResource>(&self, object: &K) -> Result<K> {
        let namespace = object.namespace();
        let updated = self
            .inner
            .update(&api_resource::<K>(), namespace.as_deref(), &to_dynamic(object)?)
            .await?;
        from_dynamic(updated)
    }

    pub async fn update_status<K: KubeResource>(&self, object: &K) -> Result<K> {
        let namespace = object.namespace();
        let updated = self
            .inner
            .update_status(&api_resource::<K>(), namespace.as_deref(), &to_dynamic(object)?)
            .await?;
        from_dynamic(updated)
    }

    /// Replace the finalizers of `object`, even if `object` is stale
    pub async fn set_finalizers<K: KubeResource>(&self, object: &K, finalizers: &[String]) -> Result<K> {
        let namespace = object.namespace();
        let patched = self
            .inner
            .patch_finalizers(&api_resource::<K>(), namespace.as_deref(), &object.name_any(), finalizers)
            .await?;
        from_dynamic(patched)
    }

    pub async fn delete<K: KubeResource>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        self.inner
            .delete(&api_resource::<K>(), namespace, name)
            .await
    }
}

fn api_resource<K: KubeResource>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

fn to_dynamic<K: KubeResource>(object: &K) -> Result<DynamicObject> {
    let mut value = serde_json::to_value(object)?;
    // Typed objects built in code may not carry their type meta
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| K::api_version(&()).into());
        map.entry("kind").or_insert_with(|| K::kind(&()).into());
    }
    Ok(serde_json::from_value(value)?)
}

fn from_dynamic<K: KubeResource>(object: DynamicObject) -> Result<K> {
    let mut value = serde_json::to_value(&object)?;
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| K::api_version(&()).into());
        map.entry("kind").or_insert_with(|| K::kind(&()).into());
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{OperatorSource, OperatorSourceSpec};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the server could not find the requested resource".to_string(),
            reason: "NotFound".to_string(),
            code,
        })
    }

    #[test]
    fn test_served_kinds_are_remembered() {
        let served = ServedKinds::default();
        let resource = api_resource::<OperatorSource>();
        assert!(!served.is_known(&resource));

        assert!(served.record(&resource, Ok(())).unwrap());
        assert!(served.is_known(&resource));
        assert!(!served.is_known(&api_resource::<ConfigMap>()));
    }

    #[test]
    fn test_missing_kind_is_not_remembered() {
        let served = ServedKinds::default();
        let resource = api_resource::<OperatorSource>();
        assert!(!served.record(&resource, Err(api_error(404))).unwrap());
        assert!(!served.is_known(&resource));
    }

    #[test]
    fn test_forbidden_list_counts_as_served() {
        let served = ServedKinds::default();
        let resource = api_resource::<ConfigMap>();
        assert!(served.record(&resource, Err(api_error(403))).unwrap());
        assert!(served.is_known(&resource));
        assert!(served.record(&resource, Err(api_error(500))).is_err());
    }

    #[test]
    fn test_typed_round_trip_keeps_type_meta() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("trusted-ca".into()),
                namespace: Some("openshift-marketplace".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        let types = dynamic.types.clone().unwrap();
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(types.api_version, "v1");

        let back: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("trusted-ca"));
    }

    #[test]
    fn test_custom_resource_conversion() {
        let opsrc = OperatorSource::new(
            "community-operators",
            OperatorSourceSpec {
                source_type: "appregistry".into(),
                endpoint: "https://quay.io/cnr".into(),
                registry_namespace: "community-operators".into(),
                authorization_token: None,
                display_name: None,
                publisher: None,
            },
        );
        let dynamic = to_dynamic(&opsrc).unwrap();
        assert_eq!(dynamic.data["spec"]["registryNamespace"], "community-operators");
        assert_eq!(
            api_resource::<OperatorSource>().group,
            "operators.coreos.com"
        );
    }
}
