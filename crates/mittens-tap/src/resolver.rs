//! Service selector to Deployment resolution.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::store::ClusterStore;
use crate::{Error, Result};

/// Build the `k1=v1,k2=v2` label selector for a selector map.
///
/// `BTreeMap` iteration is sorted, so the same selector always renders to
/// the same bytes.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector of a Service, failing when it has none.
pub fn service_selector(service: &Service) -> Result<&BTreeMap<String, String>> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::SelectorsMissing {
            service: service.metadata.name.clone().unwrap_or_default(),
        })
}

/// Find the single Deployment matching every pair of `selector`.
///
/// Zero or several matches are errors; the result is never guessed.
pub async fn deployment_from_selector(
    store: &dyn ClusterStore,
    namespace: &str,
    service_name: &str,
    selector: &BTreeMap<String, String>,
) -> Result<Deployment> {
    if selector.is_empty() {
        return Err(Error::SelectorsMissing {
            service: service_name.to_string(),
        });
    }
    let selector = selector_string(selector);
    let mut deployments = store.list_deployments(namespace, &selector).await?;
    match deployments.len() {
        0 => Err(Error::SelectorNoMatch { selector }),
        1 => {
            let deployment = deployments.remove(0);
            let found_in = deployment.metadata.namespace.as_deref().unwrap_or(namespace);
            if found_in != namespace {
                return Err(Error::DeploymentOutsideNamespace {
                    deployment: deployment.metadata.name.clone().unwrap_or_default(),
                    namespace: namespace.to_string(),
                });
            }
            debug!(
                selector = %selector,
                deployment = ?deployment.metadata.name,
                "Resolved Deployment from Service selector"
            );
            Ok(deployment)
        }
        count => Err(Error::SelectorMultiMatch { selector, count }),
    }
}

/// Resolve the Deployment behind a Service.
pub async fn deployment_for_service(
    store: &dyn ClusterStore,
    namespace: &str,
    service: &Service,
) -> Result<Deployment> {
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let selector = service_selector(service)?;
    deployment_from_selector(store, namespace, name, selector).await
}

/// Pick the Service port to tap when none was given.
///
/// One port is chosen automatically; several need an explicit choice.
pub fn detect_service_port(service: &Service) -> Result<i32> {
    let name = service.metadata.name.clone().unwrap_or_default();
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    match ports {
        [] => Err(Error::ServiceHasNoPorts { service: name }),
        [only] => Ok(only.port),
        many => Err(Error::PortSelectionRequired {
            service: name,
            ports: many.iter().map(|p| p.port).collect(),
        }),
    }
}

/// Resolve the container port the proxy must forward to.
///
/// Numeric target ports are used as-is. Named target ports are looked up in
/// the Deployment's container port list. A port without a target port
/// forwards to the same number, as Kubernetes does.
pub fn resolve_upstream_port(
    service: &Service,
    port: i32,
    deployment: &Deployment,
) -> Result<String> {
    let service_name = service.metadata.name.clone().unwrap_or_default();
    let service_port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == port))
        .ok_or(Error::ServiceMissingPort {
            service: service_name,
            port,
        })?;

    match &service_port.target_port {
        None => Ok(port.to_string()),
        Some(IntOrString::Int(n)) => Ok(n.to_string()),
        Some(IntOrString::String(named)) => {
            let container_port = deployment
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .into_iter()
                .flat_map(|pod| pod.containers.iter())
                .flat_map(|c| c.ports.iter().flatten())
                .find(|p| p.name.as_deref() == Some(named.as_str()))
                .map(|p| p.container_port);
            container_port
                .map(|p| p.to_string())
                .ok_or_else(|| Error::DeploymentMissingPorts {
                    deployment: deployment.metadata.name.clone().unwrap_or_default(),
                    port_name: named.clone(),
                })
        }
    }
}
