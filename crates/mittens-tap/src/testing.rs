//! In-memory [`ClusterStore`] for tests.
//!
//! Behaves like the API server where the engine cares: replacements are
//! checked against `resourceVersion`, creates of an existing name fail, and
//! label selectors are evaluated as a conjunction. Faults can be queued to
//! simulate concurrent writers and API failures.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec,
    Service, ServicePort, ServiceSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::store::ClusterStore;
use crate::{Error, Result};

type Key = (String, String);
type DeploymentHook = Box<dyn FnOnce(&mut Deployment) + Send>;
type ServiceHook = Box<dyn FnOnce(&mut Service) + Send>;

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    services: BTreeMap<Key, Service>,
    deployments: BTreeMap<Key, Deployment>,
    config_maps: BTreeMap<Key, ConfigMap>,
    pods: Vec<(String, Pod)>,
    version: u64,
    writes: usize,
    deployment_writers: VecDeque<DeploymentHook>,
    service_writers: VecDeque<ServiceHook>,
    service_replace_failures: VecDeque<Error>,
    deployment_replace_failures: VecDeque<Error>,
    config_map_create_failures: VecDeque<Error>,
    truncate_config_maps: usize,
}

impl State {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// In-memory cluster
#[derive(Default)]
pub(crate) struct FakeStore {
    state: Mutex<State>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|pair| {
        let Some((k, v)) = pair.split_once('=') else {
            return false;
        };
        labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v)
    })
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_namespace(self, namespace: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(namespace.to_string());
        self
    }

    pub(crate) fn with_service(self, mut service: Service) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let ns = service.metadata.namespace.clone().unwrap_or_default();
            service.metadata.resource_version = Some(state.bump());
            state.namespaces.insert(ns.clone());
            state
                .services
                .insert(key(&ns, &name_of(&service.metadata)), service);
        }
        self
    }

    pub(crate) fn with_deployment(self, mut deployment: Deployment) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let ns = deployment.metadata.namespace.clone().unwrap_or_default();
            deployment.metadata.resource_version = Some(state.bump());
            state
                .deployments
                .insert(key(&ns, &name_of(&deployment.metadata)), deployment);
        }
        self
    }

    pub(crate) fn with_config_map(self, mut config_map: ConfigMap) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let ns = config_map.metadata.namespace.clone().unwrap_or_default();
            config_map.metadata.resource_version = Some(state.bump());
            state
                .config_maps
                .insert(key(&ns, &name_of(&config_map.metadata)), config_map);
        }
        self
    }

    /// Delete a Deployment as another client would
    pub(crate) fn remove_deployment(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .deployments
            .remove(&key(namespace, name));
    }

    pub(crate) fn add_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        let ns = pod.metadata.namespace.clone().unwrap_or_default();
        state.pods.push((ns, pod));
    }

    /// Before the next Deployment replace, apply `hook` as another writer
    /// would and reject our write as stale.
    pub(crate) fn concurrent_deployment_write(
        &self,
        hook: impl FnOnce(&mut Deployment) + Send + 'static,
    ) {
        self.state
            .lock()
            .unwrap()
            .deployment_writers
            .push_back(Box::new(hook));
    }

    /// Same as [`Self::concurrent_deployment_write`] for Services.
    pub(crate) fn concurrent_service_write(
        &self,
        hook: impl FnOnce(&mut Service) + Send + 'static,
    ) {
        self.state
            .lock()
            .unwrap()
            .service_writers
            .push_back(Box::new(hook));
    }

    pub(crate) fn fail_next_service_replace(&self, err: Error) {
        self.state
            .lock()
            .unwrap()
            .service_replace_failures
            .push_back(err);
    }

    pub(crate) fn fail_next_deployment_replace(&self, err: Error) {
        self.state
            .lock()
            .unwrap()
            .deployment_replace_failures
            .push_back(err);
    }

    pub(crate) fn fail_next_config_map_create(&self, err: Error) {
        self.state
            .lock()
            .unwrap()
            .config_map_create_failures
            .push_back(err);
    }

    /// Store the next `n` created ConfigMaps with their payload cut short.
    pub(crate) fn truncate_next_config_maps(&self, n: usize) {
        self.state.lock().unwrap().truncate_config_maps = n;
    }

    /// Number of successful mutations so far
    pub(crate) fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub(crate) fn service(&self, namespace: &str, name: &str) -> Service {
        self.state.lock().unwrap().services[&key(namespace, name)].clone()
    }

    pub(crate) fn deployment(&self, namespace: &str, name: &str) -> Deployment {
        self.state.lock().unwrap().deployments[&key(namespace, name)].clone()
    }

    pub(crate) fn config_maps(&self, namespace: &str) -> Vec<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, cm)| cm.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().namespaces.contains(namespace))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("Service", name))
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        let name = name_of(&service.metadata);
        if let Some(err) = state.service_replace_failures.pop_front() {
            return Err(err);
        }
        let k = key(namespace, &name);
        if let Some(hook) = state.service_writers.pop_front() {
            let version = state.bump();
            let stored = state
                .services
                .get_mut(&k)
                .ok_or_else(|| Error::not_found("Service", &name))?;
            hook(stored);
            stored.metadata.resource_version = Some(version);
            return Err(Error::conflict("Service", name));
        }
        let current = state
            .services
            .get(&k)
            .ok_or_else(|| Error::not_found("Service", &name))?;
        if current.metadata.resource_version != service.metadata.resource_version {
            return Err(Error::conflict("Service", name));
        }
        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.services.insert(k, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .filter(|((ns, _), d)| {
                ns == namespace && matches_selector(d.metadata.labels.as_ref(), selector)
            })
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("Deployment", name))
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        let name = name_of(&deployment.metadata);
        if let Some(err) = state.deployment_replace_failures.pop_front() {
            return Err(err);
        }
        let k = key(namespace, &name);
        if let Some(hook) = state.deployment_writers.pop_front() {
            let version = state.bump();
            let stored = state
                .deployments
                .get_mut(&k)
                .ok_or_else(|| Error::not_found("Deployment", &name))?;
            hook(stored);
            stored.metadata.resource_version = Some(version);
            return Err(Error::conflict("Deployment", name));
        }
        let current = state
            .deployments
            .get(&k)
            .ok_or_else(|| Error::not_found("Deployment", &name))?;
        if current.metadata.resource_version != deployment.metadata.resource_version {
            return Err(Error::conflict("Deployment", name));
        }
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.deployments.insert(k, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let mut state = self.state.lock().unwrap();
        let name = name_of(&config_map.metadata);
        if let Some(err) = state.config_map_create_failures.pop_front() {
            return Err(err);
        }
        let k = key(namespace, &name);
        if state.config_maps.contains_key(&k) {
            return Err(Error::already_exists("ConfigMap", name));
        }
        let mut stored = config_map.clone();
        stored.metadata.resource_version = Some(state.bump());
        if state.truncate_config_maps > 0 {
            state.truncate_config_maps -= 1;
            if let Some(data) = stored.binary_data.as_mut() {
                for value in data.values_mut() {
                    value.0.truncate(value.0.len() / 2);
                }
            }
        }
        state.config_maps.insert(k, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>> {
        Ok(self.config_maps(namespace))
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .config_maps
            .remove(&key(namespace, name))
            .ok_or_else(|| Error::not_found("ConfigMap", name))?;
        state.writes += 1;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect())
    }
}

// -----------------------------------------------------------------------------
// Fixtures
// -----------------------------------------------------------------------------

pub(crate) fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn service_port(name: Option<&str>, port: i32, target: IntOrString) -> ServicePort {
    ServicePort {
        name: name.map(str::to_string),
        port,
        target_port: Some(target),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub(crate) fn service(
    namespace: &str,
    name: &str,
    selector: &[(&str, &str)],
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: if selector.is_empty() {
                None
            } else {
                Some(labels(selector))
            },
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn container(name: &str, ports: &[(&str, i32)]) -> Container {
    Container {
        name: name.to_string(),
        image: Some(format!("{}:1.0", name)),
        ports: if ports.is_empty() {
            None
        } else {
            Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ContainerPort {
                        name: Some(port_name.to_string()),
                        container_port: *port,
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        ..Default::default()
    }
}

pub(crate) fn deployment(
    namespace: &str,
    name: &str,
    app_labels: &[(&str, &str)],
    containers: Vec<Container>,
    volumes: Vec<Volume>,
) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(app_labels)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels(app_labels)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(app_labels)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: if volumes.is_empty() {
                        None
                    } else {
                        Some(volumes)
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn tapped_pod(
    namespace: &str,
    name: &str,
    tapped_key: &str,
    deployment: &str,
    containers_ready: bool,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(labels(&[(tapped_key, deployment)])),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "ContainersReady".to_string(),
                status: if containers_ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
