//! Lifecycle of the auxiliary ConfigMap a tap implementation mounts.
//!
//! The ConfigMap is found again by its owner annotation
//! (`<owner-prefix><deployment>`), not by name, so cleanup never removes an
//! unrelated object that happens to share the name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use mittens_common::kube_utils::annotation;
use tracing::{debug, info, warn};

use crate::config::TapConfig;
use crate::store::ClusterStore;
use crate::{Error, Result};

/// Build the ConfigMap carrying `payload` under `file_key`.
pub fn build_config_map(
    config: &TapConfig,
    namespace: &str,
    deployment: &str,
    file_key: &str,
    payload: Vec<u8>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config.names.config_map_name(deployment)),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                config.annotations.config_map_owner.clone(),
                config.names.owner_value(deployment),
            )])),
            ..Default::default()
        },
        binary_data: Some(BTreeMap::from([(file_key.to_string(), ByteString(payload))])),
        ..Default::default()
    }
}

/// Create the ConfigMap and check the stored payload is what was sent.
async fn create_checked(
    store: &dyn ClusterStore,
    namespace: &str,
    config_map: &ConfigMap,
    file_key: &str,
) -> Result<ConfigMap> {
    let name = config_map.metadata.name.clone().unwrap_or_default();
    let sent = config_map
        .binary_data
        .as_ref()
        .and_then(|d| d.get(file_key))
        .map(|b| b.0.len())
        .unwrap_or(0);
    if sent == 0 {
        return Err(Error::internal_with_context(
            "aux_config",
            format!("refusing to create ConfigMap {:?} with empty {}", name, file_key),
        ));
    }

    let created = store.create_config_map(namespace, config_map).await?;
    let stored = created
        .binary_data
        .as_ref()
        .and_then(|d| d.get(file_key))
        .map(|b| b.0.len())
        .unwrap_or(0);
    if stored != sent {
        return Err(Error::CreateResourceMismatch {
            kind: "ConfigMap".to_string(),
            name,
            sent,
            stored,
        });
    }
    Ok(created)
}

/// Create the auxiliary ConfigMap for a tap.
///
/// If creation collides with a stale ConfigMap from a failed run, or the
/// stored payload comes back short, every ConfigMap owned by the Deployment
/// is removed and creation is retried exactly once. A second failure is
/// returned as-is.
pub async fn ready(
    store: &dyn ClusterStore,
    config: &TapConfig,
    namespace: &str,
    deployment: &str,
    file_key: &str,
    payload: Vec<u8>,
) -> Result<ConfigMap> {
    let config_map = build_config_map(config, namespace, deployment, file_key, payload);

    match create_checked(store, namespace, &config_map, file_key).await {
        Ok(created) => {
            info!(
                config_map = ?created.metadata.name,
                namespace = %namespace,
                "Created proxy ConfigMap"
            );
            Ok(created)
        }
        Err(e @ (Error::AlreadyExists { .. } | Error::CreateResourceMismatch { .. })) => {
            warn!(
                deployment = %deployment,
                error = %e,
                "Proxy ConfigMap left over from an earlier run, replacing it"
            );
            if let Err(cleanup) = unready(store, config, namespace, deployment).await {
                debug!(error = %cleanup, "No stale proxy ConfigMap removed");
            }
            create_checked(store, namespace, &config_map, file_key).await
        }
        Err(e) => Err(e),
    }
}

/// Delete every ConfigMap owned by the Deployment.
///
/// Returns how many were removed, or [`Error::ConfigMapNoMatch`] when none
/// carried the owner marker.
pub async fn unready(
    store: &dyn ClusterStore,
    config: &TapConfig,
    namespace: &str,
    deployment: &str,
) -> Result<usize> {
    let owner = config.names.owner_value(deployment);
    let owned: Vec<String> = store
        .list_config_maps(namespace)
        .await?
        .into_iter()
        .filter(|cm| {
            annotation(&cm.metadata, &config.annotations.config_map_owner) == Some(owner.as_str())
        })
        .filter_map(|cm| cm.metadata.name)
        .collect();

    if owned.is_empty() {
        return Err(Error::ConfigMapNoMatch {
            deployment: deployment.to_string(),
        });
    }

    let mut removed = 0;
    for name in &owned {
        match store.delete_config_map(namespace, name).await {
            Ok(()) => {
                removed += 1;
                info!(config_map = %name, namespace = %namespace, "Deleted proxy ConfigMap");
            }
            // Already gone between list and delete
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;

    const KEY: &str = "config.yaml";

    fn stale(config: &TapConfig, name: &str, deployment: &str) -> ConfigMap {
        let mut cm = build_config_map(config, "default", deployment, KEY, b"old".to_vec());
        cm.metadata.name = Some(name.to_string());
        cm
    }

    #[tokio::test]
    async fn creates_annotated_config_map() {
        let config = TapConfig::default();
        let store = FakeStore::new().with_namespace("default");

        ready(&store, &config, "default", "web", KEY, b"listen_port: 7777\n".to_vec())
            .await
            .unwrap();

        let cms = store.config_maps("default");
        assert_eq!(cms.len(), 1);
        assert_eq!(cms[0].metadata.name.as_deref(), Some("mittens-target-web"));
        assert_eq!(
            annotation(&cms[0].metadata, "mittens.io/proxy-config"),
            Some("target-web")
        );
    }

    #[tokio::test]
    async fn stale_config_map_is_replaced_once() {
        let config = TapConfig::default();
        let store = FakeStore::new()
            .with_namespace("default")
            .with_config_map(stale(&config, "mittens-target-web", "web"));

        ready(&store, &config, "default", "web", KEY, b"fresh".to_vec())
            .await
            .unwrap();

        let cms = store.config_maps("default");
        assert_eq!(cms.len(), 1);
        assert_eq!(cms[0].binary_data.as_ref().unwrap()[KEY].0, b"fresh".to_vec());
    }

    #[tokio::test]
    async fn unowned_name_collision_is_never_deleted() {
        let config = TapConfig::default();
        let mut foreign = stale(&config, "mittens-target-web", "web");
        foreign.metadata.annotations = None;
        let store = FakeStore::new()
            .with_namespace("default")
            .with_config_map(foreign);

        let err = ready(&store, &config, "default", "web", KEY, b"fresh".to_vec())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyExists { .. }));
        let cms = store.config_maps("default");
        assert_eq!(cms.len(), 1);
        assert_eq!(cms[0].binary_data.as_ref().unwrap()[KEY].0, b"old".to_vec());
    }

    #[tokio::test]
    async fn truncated_payload_is_retried_then_surfaced() {
        let config = TapConfig::default();
        let store = FakeStore::new().with_namespace("default");

        // first attempt truncated, retry succeeds
        store.truncate_next_config_maps(1);
        ready(&store, &config, "default", "web", KEY, b"0123456789".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.config_maps("default")[0].binary_data.as_ref().unwrap()[KEY].0.len(),
            10
        );

        // both attempts truncated
        unready(&store, &config, "default", "web").await.unwrap();
        store.truncate_next_config_maps(2);
        let err = ready(&store, &config, "default", "web", KEY, b"0123456789".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CreateResourceMismatch {
                sent: 10,
                stored: 5,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn other_create_failures_are_not_retried() {
        let config = TapConfig::default();
        let store = FakeStore::new().with_namespace("default");
        store.fail_next_config_map_create(Error::internal_with_context("test", "forbidden"));

        let err = ready(&store, &config, "default", "web", KEY, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert!(store.config_maps("default").is_empty());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_before_create() {
        let config = TapConfig::default();
        let store = FakeStore::new().with_namespace("default");
        assert!(ready(&store, &config, "default", "web", KEY, Vec::new())
            .await
            .is_err());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn unready_matches_on_annotation_not_name() {
        let config = TapConfig::default();
        let store = FakeStore::new()
            .with_namespace("default")
            .with_config_map(stale(&config, "renamed-by-someone", "web"))
            .with_config_map(stale(&config, "mittens-target-api", "api"));

        assert_eq!(unready(&store, &config, "default", "web").await.unwrap(), 1);

        let left: Vec<_> = store
            .config_maps("default")
            .into_iter()
            .filter_map(|cm| cm.metadata.name)
            .collect();
        assert_eq!(left, vec!["mittens-target-api".to_string()]);

        assert!(matches!(
            unready(&store, &config, "default", "web").await,
            Err(Error::ConfigMapNoMatch { .. })
        ));
    }
}
