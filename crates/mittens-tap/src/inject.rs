//! Sidecar injection into a Deployment's pod template.
//!
//! Injection only ever appends: user containers keep their order and user
//! volumes are untouched. Removal filters by the reserved container name and
//! the reserved volume prefix, never by substring.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PodSpec;
use mittens_common::kube_utils::annotations_mut;

use crate::config::TapConfig;
use crate::options::ProxyOptions;
use crate::proxy::TapProxy;
use crate::{Error, Result};

fn pod_spec_mut(deployment: &mut Deployment) -> Result<&mut PodSpec> {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(|| {
            Error::internal_with_context("inject", format!("Deployment {:?} has no pod spec", name))
        })
}

/// Whether the pod template already carries the sidecar container.
pub fn has_sidecar(deployment: &Deployment, config: &TapConfig) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|pod| pod.containers.iter().any(|c| c.name == config.names.container))
        .unwrap_or(false)
}

/// Add the proxy sidecar to a freshly fetched Deployment.
///
/// Leftovers from an earlier failed run are stripped first so repeated
/// attempts converge on one sidecar. The proxy patches volumes before the
/// container is appended, then the pod template is stamped with the tapped
/// marker naming the Deployment.
pub fn inject_sidecar(
    deployment: &mut Deployment,
    proxy: &dyn TapProxy,
    options: &ProxyOptions,
    config: &TapConfig,
) -> Result<()> {
    strip_sidecar(deployment, config)?;

    let name = deployment.metadata.name.clone().unwrap_or_default();
    let mut sidecar = proxy.sidecar(&name);
    sidecar.image = Some(options.image.clone());
    sidecar.args = if options.command_args.is_empty() {
        None
    } else {
        Some(options.command_args.clone())
    };

    proxy.patch_deployment(deployment);
    pod_spec_mut(deployment)?.containers.push(sidecar);

    let template = &mut deployment
        .spec
        .as_mut()
        .ok_or_else(|| Error::internal_with_context("inject", "Deployment has no spec"))?
        .template;
    let meta = template.metadata.get_or_insert_with(Default::default);
    annotations_mut(meta).insert(config.annotations.tapped.clone(), name);
    Ok(())
}

/// Remove everything [`inject_sidecar`] added.
///
/// Returns whether anything changed, so callers can skip a no-op write.
pub fn strip_sidecar(deployment: &mut Deployment, config: &TapConfig) -> Result<bool> {
    let names = &config.names;
    let pod = pod_spec_mut(deployment)?;

    let containers_before = pod.containers.len();
    pod.containers.retain(|c| c.name != names.container);
    let mut changed = pod.containers.len() != containers_before;

    if let Some(volumes) = pod.volumes.as_mut() {
        let before = volumes.len();
        volumes.retain(|v| !names.is_reserved_volume(&v.name));
        changed |= volumes.len() != before;
        if volumes.is_empty() {
            pod.volumes = None;
        }
    }

    if let Some(meta) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.metadata.as_mut())
    {
        if let Some(annotations) = meta.annotations.as_mut() {
            changed |= annotations.remove(&config.annotations.tapped).is_some();
            if annotations.is_empty() {
                meta.annotations = None;
            }
        }
    }

    Ok(changed)
}
