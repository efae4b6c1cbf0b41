//! Cluster object store seam.
//!
//! The tap engine only ever needs get/list/create/replace/delete on a handful
//! of namespaced kinds. [`ClusterStore`] is that surface; [`KubeStore`] backs
//! it with the API server and tests back it with an in-memory fake.
//!
//! Replacements carry the object's `resourceVersion`. A stale version fails
//! with [`Error::Conflict`], distinct from every other failure.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use mittens_common::kube_utils::{classify, Verb};
use mittens_common::FIELD_MANAGER;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Trait abstracting the cluster API for tap operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Whether the namespace exists
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    /// Fetch a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// Replace a Service, checking its resourceVersion
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    /// List Deployments matching a `k1=v1,k2=v2` label selector
    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>>;

    /// Fetch a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    /// Replace a Deployment, checking its resourceVersion
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<ConfigMap>;

    /// List all ConfigMaps in the namespace
    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>>;

    /// Delete a ConfigMap by name
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    /// List all Pods in the namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
}

/// Shared handle to a store
pub type SharedStore = Arc<dyn ClusterStore>;

/// [`ClusterStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Result<&str> {
    meta.name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("store", "object has no name"))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let found = api
            .get_opt(namespace)
            .await
            .map_err(|e| classify(e, Verb::Read, "Namespace", namespace))?;
        Ok(found.is_some())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| classify(e, Verb::Read, "Service", name))
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let name = object_name(&service.metadata)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        debug!(service = %name, namespace = %namespace, "Replacing Service");
        api.replace(name, &Self::post_params(), service)
            .await
            .map_err(|e| classify(e, Verb::Replace, "Service", name))
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| classify(e, Verb::Read, "Deployment", selector))?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| classify(e, Verb::Read, "Deployment", name))
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let name = object_name(&deployment.metadata)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        debug!(deployment = %name, namespace = %namespace, "Replacing Deployment");
        api.replace(name, &Self::post_params(), deployment)
            .await
            .map_err(|e| classify(e, Verb::Replace, "Deployment", name))
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let name = object_name(&config_map.metadata)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), config_map)
            .await
            .map_err(|e| classify(e, Verb::Create, "ConfigMap", name))
    }

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, Verb::Read, "ConfigMap", namespace))?;
        Ok(list.items)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, Verb::Delete, "ConfigMap", name))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, Verb::Read, "Pod", namespace))?;
        Ok(list.items)
    }
}
