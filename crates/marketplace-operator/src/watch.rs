//! Mapping of child deletions back to the objects that own them
//!
//! Children never point at their owner with an owner reference; they carry
//! the owner's name and namespace as labels (see [`crate::ownership`]). Only
//! deletions matter here: the owner's `Succeeded` phase notices the missing
//! child and rebuilds it. Every other watch event is dropped.

use crate::crd::{CatalogSource, OperatorHub, OperatorSource};
use crate::defaults::{Restorer, OPERATOR_HUB_NAME};
use crate::ownership::{Owner, OwnerKind};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ObjectMeta};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;

/// Bound shared by watched and reconciled kinds
pub trait Watched:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> Watched for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// The deleted object, if `event` is a deletion
pub fn deleted<K>(event: watcher::Event<K>) -> Option<K> {
    match event {
        watcher::Event::Delete(object) => Some(object),
        watcher::Event::Apply(_)
        | watcher::Event::Init
        | watcher::Event::InitApply(_)
        | watcher::Event::InitDone => None,
    }
}

/// Cluster-wide stream of deleted `K` objects matching `config`
pub fn deletions<K: Watched>(
    client: &Client,
    config: watcher::Config,
) -> BoxStream<'static, Result<K, watcher::Error>> {
    watcher(Api::<K>::all(client.clone()), config)
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(event) => deleted(event).map(Ok),
                Err(e) => Some(Err(e)),
            }
        })
        .boxed()
}

/// Reference to the owner named by the labels in `meta`
pub fn owner_ref<K>(kind: OwnerKind, meta: &ObjectMeta) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let labels = meta.labels.as_ref()?;
    let owner = Owner::from_labels(kind, labels)?;
    Some(ObjectRef::new(&owner.name).within(&owner.namespace))
}

/// The OperatorHub singleton, when `meta` names a default source
pub fn hub_ref(restorer: &Restorer, meta: &ObjectMeta) -> Option<ObjectRef<OperatorHub>> {
    let name = meta.name.as_deref()?;
    restorer
        .is_default(name)
        .then(|| ObjectRef::new(OPERATOR_HUB_NAME))
}

fn watch_child<K: Watched, C: Watched>(
    controller: Controller<K>,
    client: &Client,
    kind: OwnerKind,
) -> Controller<K> {
    let config = watcher::Config::default().labels(kind.name_label());
    controller.watches_stream(deletions::<C>(client, config), move |child: C| {
        owner_ref::<K>(kind, child.meta())
    })
}

/// Requeue the owner of every deleted registry child labelled for `kind`
pub fn watch_children<K: Watched>(
    controller: Controller<K>,
    client: &Client,
    kind: OwnerKind,
) -> Controller<K> {
    let controller = watch_child::<K, CatalogSource>(controller, client, kind);
    let controller = watch_child::<K, Deployment>(controller, client, kind);
    let controller = watch_child::<K, Service>(controller, client, kind);
    let controller = watch_child::<K, ServiceAccount>(controller, client, kind);
    let controller = watch_child::<K, Role>(controller, client, kind);
    watch_child::<K, RoleBinding>(controller, client, kind)
}

/// Requeue the OperatorHub whenever a default source is deleted
pub fn watch_defaults(
    controller: Controller<OperatorHub>,
    client: &Client,
    restorer: Arc<Restorer>,
) -> Controller<OperatorHub> {
    let for_sources = restorer.clone();
    controller
        .watches_stream(
            deletions::<OperatorSource>(client, watcher::Config::default()),
            move |source: OperatorSource| hub_ref(&for_sources, source.meta()),
        )
        .watches_stream(
            deletions::<CatalogSource>(client, watcher::Config::default()),
            move |catalog: CatalogSource| hub_ref(&restorer, catalog.meta()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CatalogSourceConfig;
    use crate::defaults::{DefaultDefinition, HubConfig};
    use crate::testing::{fixtures, FakeKube};
    use std::collections::BTreeMap;

    fn labelled(labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("child".into()),
            namespace: Some("default".into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_only_deletions_pass() {
        let service = Service::default();
        assert!(deleted(watcher::Event::Delete(service.clone())).is_some());
        assert!(deleted(watcher::Event::Apply(service.clone())).is_none());
        assert!(deleted(watcher::Event::InitApply(service)).is_none());
        assert!(deleted::<Service>(watcher::Event::Init).is_none());
        assert!(deleted::<Service>(watcher::Event::InitDone).is_none());
    }

    #[test]
    fn test_owner_labels_map_to_owner() {
        let meta = labelled(&[
            ("csc-owner-name", "mine"),
            ("csc-owner-namespace", "openshift-marketplace"),
        ]);
        let owner = owner_ref::<CatalogSourceConfig>(OwnerKind::CatalogSourceConfig, &meta).unwrap();
        assert_eq!(owner.name, "mine");
        assert_eq!(owner.namespace.as_deref(), Some("openshift-marketplace"));

        assert!(owner_ref::<OperatorSource>(OwnerKind::OperatorSource, &meta).is_none());
    }

    #[test]
    fn test_unlabelled_child_is_ignored() {
        assert!(owner_ref::<OperatorSource>(OwnerKind::OperatorSource, &ObjectMeta::default()).is_none());
        let partial = labelled(&[("opsrc-owner-name", "e2e")]);
        assert!(owner_ref::<OperatorSource>(OwnerKind::OperatorSource, &partial).is_none());
    }

    #[test]
    fn test_default_deletion_requeues_hub() {
        let restorer = Restorer::new(
            FakeKube::new().kube(),
            Arc::new(HubConfig::new()),
            BTreeMap::from([(
                "community-operators".to_string(),
                DefaultDefinition::OperatorSource(fixtures::operator_source(
                    "community-operators",
                    fixtures::NAMESPACE,
                )),
            )]),
        );
        let mut meta = ObjectMeta {
            name: Some("community-operators".into()),
            ..Default::default()
        };
        assert_eq!(hub_ref(&restorer, &meta).unwrap().name, OPERATOR_HUB_NAME);

        meta.name = Some("my-source".into());
        assert!(hub_ref(&restorer, &meta).is_none());
    }
}
