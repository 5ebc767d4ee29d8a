//! Kubernetes resource builders for the registry stack
//!
//! Every object built here carries the owner labels of the request and nothing
//! that would tie it to a specific cluster state, so the ensurer can compare
//! and replace freely.

use super::{RegistryRequest, REGISTRY_PORT, REGISTRY_PORT_NAME};
use crate::crd::{CatalogSource, CatalogSourceSpec, RegistryPoll, UpdateStrategy};
use crate::ownership::{Owner, OwnerKind};
use crate::proxy::{ProxySettings, TRUSTED_CA_FILE, TRUSTED_CA_KEY, TRUSTED_CA_MOUNT_PATH};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, ExecAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Pod template annotation refreshed on every ensure to force a rollout
pub const UPDATE_ANNOTATION: &str = "openshift-marketplace-update-hash";

const TRUSTED_CA_VOLUME: &str = "marketplace-trusted-ca";

/// Builder for the children of one registry request
pub struct RegistryBuilder<'a> {
    request: &'a RegistryRequest,
}

impl<'a> RegistryBuilder<'a> {
    pub fn new(request: &'a RegistryRequest) -> Self {
        Self { request }
    }

    fn name(&self) -> &str {
        &self.request.owner.name
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name().to_string()),
            namespace: Some(self.request.target_namespace.clone()),
            labels: Some(self.request.owner.labels()),
            ..Default::default()
        }
    }

    /// Label selecting the registry pods
    fn pod_labels(&self) -> BTreeMap<String, String> {
        let key = match self.request.owner.kind {
            OwnerKind::OperatorSource => "marketplace.operatorSource",
            OwnerKind::CatalogSourceConfig => "marketplace.catalogSourceConfig",
        };
        BTreeMap::from([(key.to_string(), self.name().to_string())])
    }

    /// `appregistry-server -r <endpoint>|<ns>[|<secretNs>/<secretName>] ... -o <packages>`
    pub fn command(&self) -> Vec<String> {
        let mut command = vec!["appregistry-server".to_string()];
        for source in &self.request.sources {
            let mut arg = format!("{}|{}", source.endpoint, source.registry_namespace);
            if let Some((ns, name)) = &source.secret {
                arg.push_str(&format!("|{}/{}", ns, name));
            }
            command.push("-r".to_string());
            command.push(arg);
        }
        command.push("-o".to_string());
        command.push(self.request.packages.join(","));
        command
    }

    pub fn build_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.metadata(),
            ..Default::default()
        }
    }

    pub fn build_role(&self) -> Role {
        Role {
            metadata: self.metadata(),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["secrets".to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            }]),
        }
    }

    pub fn build_role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: self.metadata(),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: self.name().to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: self.name().to_string(),
                namespace: Some(self.request.target_namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    fn probe(&self, initial_delay: i32, failure_threshold: i32) -> Probe {
        Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "grpc_health_probe".to_string(),
                    format!("-addr=localhost:{}", REGISTRY_PORT),
                ]),
            }),
            initial_delay_seconds: Some(initial_delay),
            failure_threshold: Some(failure_threshold),
            ..Default::default()
        }
    }

    /// Registry Deployment; `update_hash` is stamped on the pod template
    pub fn build_deployment(&self, proxy: &ProxySettings, update_hash: &str) -> Deployment {
        let pod_labels = self.pod_labels();

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        if let Some(config_map) = &proxy.trusted_ca {
            volumes.push(Volume {
                name: TRUSTED_CA_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.clone(),
                    items: Some(vec![KeyToPath {
                        key: TRUSTED_CA_KEY.to_string(),
                        path: TRUSTED_CA_FILE.to_string(),
                        mode: None,
                    }]),
                    optional: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: TRUSTED_CA_VOLUME.to_string(),
                mount_path: TRUSTED_CA_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let container = Container {
            name: self.name().to_string(),
            image: Some(self.request.image.clone()),
            command: Some(self.command()),
            ports: Some(vec![ContainerPort {
                name: Some(REGISTRY_PORT_NAME.to_string()),
                container_port: REGISTRY_PORT,
                ..Default::default()
            }]),
            readiness_probe: Some(self.probe(5, 30)),
            liveness_probe: Some(self.probe(5, 30)),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("10m".to_string())),
                    ("memory".to_string(), Quantity("100Mi".to_string())),
                ])),
                ..Default::default()
            }),
            env: if proxy.env.is_empty() {
                None
            } else {
                Some(proxy.env.clone())
            },
            volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
            ..Default::default()
        };

        let service_account = self
            .request
            .requires_pull_secret
            .then(|| self.name().to_string());

        Deployment {
            metadata: self.metadata(),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(self.name().to_string()),
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([(
                            UPDATE_ANNOTATION.to_string(),
                            update_hash.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        service_account_name: service_account,
                        volumes: if volumes.is_empty() { None } else { Some(volumes) },
                        node_selector: Some(BTreeMap::from([(
                            "kubernetes.io/os".to_string(),
                            "linux".to_string(),
                        )])),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build_service(&self) -> Service {
        Service {
            metadata: self.metadata(),
            spec: Some(ServiceSpec {
                selector: Some(self.pod_labels()),
                ports: Some(vec![ServicePort {
                    name: Some(REGISTRY_PORT_NAME.to_string()),
                    port: REGISTRY_PORT,
                    target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Display metadata and placement of a published CatalogSource
#[derive(Debug, Clone, Default)]
pub struct CatalogSourceParams {
    pub name: String,
    pub namespace: String,
    pub address: String,
    pub display_name: Option<String>,
    pub publisher: Option<String>,
    /// Labels added next to the owner labels
    pub extra_labels: BTreeMap<String, String>,
    /// `updateStrategy.registryPoll.interval`, e.g. `15m`
    pub poll_interval: Option<String>,
}

/// OLM CatalogSource pointing at a gRPC registry address
pub fn build_catalog_source(owner: &Owner, params: CatalogSourceParams) -> CatalogSource {
    let mut labels = owner.labels();
    labels.extend(params.extra_labels);

    let mut catalog = CatalogSource::new(
        &params.name,
        CatalogSourceSpec {
            source_type: "grpc".to_string(),
            address: Some(params.address),
            display_name: params.display_name,
            publisher: params.publisher,
            update_strategy: params.poll_interval.map(|interval| UpdateStrategy {
                registry_poll: Some(RegistryPoll { interval }),
            }),
            ..Default::default()
        },
    );
    catalog.metadata.namespace = Some(params.namespace);
    catalog.metadata.labels = Some(labels);
    catalog
}
