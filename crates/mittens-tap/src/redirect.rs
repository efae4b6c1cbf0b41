//! Service port redirection into the proxy sidecar.
//!
//! The pre-tap target port is written to the Service as an annotation before
//! the port is rewritten, so the rewrite can always be undone from the
//! Service alone.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use mittens_common::kube_utils::{
    annotation, annotations_mut, int_or_string_to_string, parse_int_or_string,
};
use mittens_common::retry::retry_on_conflict;
use tracing::{debug, info};

use crate::config::TapConfig;
use crate::store::ClusterStore;
use crate::{Error, Result};

/// Point the Service port `port` at the proxy listen port. Returns whether
/// anything changed.
///
/// A Service that already carries the marker is left as is, so the recorded
/// pre-tap target is never overwritten by the listen port.
pub fn apply_redirect(service: &mut Service, port: i32, config: &TapConfig) -> Result<bool> {
    let names = &config.names;
    let keys = &config.annotations;
    let service_name = service.metadata.name.clone().unwrap_or_default();
    let already_redirected = is_redirected(service, config);

    let entry = service
        .spec
        .as_mut()
        .and_then(|s| s.ports.as_mut())
        .and_then(|ports| ports.iter_mut().find(|p| p.port == port))
        .ok_or(Error::ServiceMissingPort {
            service: service_name,
            port,
        })?;

    if already_redirected {
        return Ok(false);
    }

    let original = entry
        .target_port
        .as_ref()
        .map(int_or_string_to_string)
        .unwrap_or_else(|| port.to_string());

    if entry.name.as_deref().map_or(true, str::is_empty) {
        entry.name = Some(names.listen_port_name.clone());
    }
    entry.target_port = Some(IntOrString::Int(names.listen_port));

    let annotations = annotations_mut(&mut service.metadata);
    annotations.insert(keys.original_target_port.clone(), original);
    annotations.insert(keys.tapped_port.clone(), port.to_string());
    if let Some(previous) = annotations.get(&keys.drift_detection).cloned() {
        annotations.insert(keys.drift_detection_previous.clone(), previous);
    }
    annotations.insert(
        keys.drift_detection.clone(),
        keys.drift_detection_disabled.clone(),
    );
    Ok(true)
}

/// Undo [`apply_redirect`]. Returns whether anything changed.
///
/// Only the port recorded as tapped gets its target back, and only while it
/// still points at the proxy listen port. Services redirected before the
/// tapped port was recorded fall back to the port carrying the synthetic
/// listen port name. The recorded value is parsed permissively so named
/// target ports survive the round trip as names.
pub fn revert_redirect(service: &mut Service, config: &TapConfig) -> bool {
    let names = &config.names;
    let keys = &config.annotations;
    let original = annotation(&service.metadata, &keys.original_target_port)
        .filter(|v| !v.is_empty())
        .map(parse_int_or_string);
    let tapped_port =
        annotation(&service.metadata, &keys.tapped_port).and_then(|v| v.parse::<i32>().ok());
    let previous_drift =
        annotation(&service.metadata, &keys.drift_detection_previous).map(str::to_string);
    let mut changed = false;

    if let Some(ports) = service.spec.as_mut().and_then(|s| s.ports.as_mut()) {
        let before = ports.len();
        ports.retain(|p| p.name.as_deref() != Some(names.web_port_name.as_str()));
        changed |= ports.len() != before;

        if let Some(original) = &original {
            let listen = IntOrString::Int(names.listen_port);
            let was_tapped = |p: &ServicePort| match tapped_port {
                Some(port) => p.port == port,
                None => p.name.as_deref() == Some(names.listen_port_name.as_str()),
            };
            for entry in ports
                .iter_mut()
                .filter(|p| p.target_port.as_ref() == Some(&listen) && was_tapped(&**p))
            {
                if entry.name.as_deref() == Some(names.listen_port_name.as_str()) {
                    entry.name = None;
                }
                entry.target_port = Some(original.clone());
                changed = true;
            }
        }
    }

    if let Some(annotations) = service.metadata.annotations.as_mut() {
        for key in [
            &keys.original_target_port,
            &keys.tapped_port,
            &keys.drift_detection_previous,
            &keys.tapped,
        ] {
            changed |= annotations.remove(key).is_some();
        }
        match previous_drift {
            Some(previous) => {
                annotations.insert(keys.drift_detection.clone(), previous);
            }
            None => changed |= annotations.remove(&keys.drift_detection).is_some(),
        }
        if annotations.is_empty() {
            service.metadata.annotations = None;
        }
    }
    changed
}

/// Whether the Service carries a non-empty original-port marker.
pub fn is_redirected(service: &Service, config: &TapConfig) -> bool {
    annotation(&service.metadata, &config.annotations.original_target_port)
        .is_some_and(|v| !v.is_empty())
}

/// Redirect the Service port `port` into the sidecar.
///
/// Each attempt works on a freshly fetched Service. A Service that is
/// already redirected is not written.
pub async fn redirect(
    store: &dyn ClusterStore,
    namespace: &str,
    service: &str,
    port: i32,
    config: &TapConfig,
) -> Result<()> {
    let written = retry_on_conflict(&config.retry(), "redirect_service", || async move {
        let mut svc = store.get_service(namespace, service).await?;
        if !apply_redirect(&mut svc, port, config)? {
            return Ok(false);
        }
        store.replace_service(namespace, &svc).await?;
        Ok(true)
    })
    .await?;

    if !written {
        debug!(service = %service, namespace = %namespace, "Service already redirected");
        return Ok(());
    }
    info!(
        service = %service,
        namespace = %namespace,
        port = port,
        listen_port = config.names.listen_port,
        "Redirected Service to proxy"
    );
    Ok(())
}

/// Restore the Service to its pre-tap ports and annotations.
pub async fn unredirect(
    store: &dyn ClusterStore,
    namespace: &str,
    service: &str,
    config: &TapConfig,
) -> Result<()> {
    let written = retry_on_conflict(&config.retry(), "unredirect_service", || async move {
        let mut svc = store.get_service(namespace, service).await?;
        if !revert_redirect(&mut svc, config) {
            return Ok(false);
        }
        store.replace_service(namespace, &svc).await?;
        Ok(true)
    })
    .await?;

    if written {
        info!(service = %service, namespace = %namespace, "Restored Service ports");
    } else {
        debug!(service = %service, namespace = %namespace, "Service was not redirected");
    }
    Ok(())
}
