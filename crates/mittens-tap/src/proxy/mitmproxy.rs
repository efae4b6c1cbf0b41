//! mitmproxy sidecar for HTTP(S) taps.
//!
//! The image runs mitmproxy inside a tmux session so it needs no TTY at
//! start-up; operators attach with
//! `kubectl exec -it <pod> -c mittens -- tmux attach-session -t mitmproxy`.
//!
//! mitmproxy reads its settings from a ConfigMap mounted next to (not over)
//! its home directory, because the image chowns `~/.mitmproxy` on start.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, Probe,
    TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::TapProxy;
use crate::aux_config;
use crate::config::TapConfig;
use crate::options::{Protocol, ProxyMode, ProxyOptions};
use crate::store::ClusterStore;
use crate::{Error, Result};

/// Key of the config file inside the ConfigMap
pub const CONFIG_FILE: &str = "config.yaml";

const CONFIG_MOUNT_PATH: &str = "/home/mitmproxy/config/";
const DATA_MOUNT_PATH: &str = "/home/mitmproxy/.mitmproxy";

const PROTOCOLS: &[Protocol] = &[Protocol::Http];

/// mitmproxy tap
pub struct Mitmproxy {
    config: Arc<TapConfig>,
}

impl Mitmproxy {
    /// Create a mitmproxy tap using the given naming config
    pub fn new(config: Arc<TapConfig>) -> Self {
        Self { config }
    }

    fn tcp_probe(&self) -> Probe {
        Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(self.config.names.listen_port),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Render `config.yaml` for the proxy.
    pub fn render_config(&self, options: &ProxyOptions) -> Result<Vec<u8>> {
        self.check_mode(options.mode)?;
        let rendered = format!(
            "listen_port: {}\nssl_insecure: true\nkeep_host_header: true\nmode:\n  - reverse:{}://127.0.0.1:{}",
            self.config.names.listen_port,
            options.upstream_scheme(),
            options.upstream_port,
        );
        Ok(rendered.into_bytes())
    }
}

#[async_trait]
impl TapProxy for Mitmproxy {
    fn name(&self) -> &'static str {
        "mitmproxy"
    }

    fn protocols(&self) -> &[Protocol] {
        PROTOCOLS
    }

    fn check_mode(&self, mode: ProxyMode) -> Result<()> {
        match mode {
            ProxyMode::Reverse => Ok(()),
            ProxyMode::Regular
            | ProxyMode::Socks5
            | ProxyMode::Upstream
            | ProxyMode::Transparent => Err(Error::UnsupportedMode {
                proxy: self.name().to_string(),
                mode: mode.to_string(),
            }),
        }
    }

    fn sidecar(&self, deployment: &str) -> Container {
        let names = &self.config.names;

        let mut readiness = self.tcp_probe();
        readiness.initial_delay_seconds = Some(5);
        readiness.period_seconds = Some(5);
        readiness.success_threshold = Some(1);
        readiness.timeout_seconds = Some(5);

        // restart the sidecar if mitmproxy stops listening
        let mut liveness = self.tcp_probe();
        liveness.initial_delay_seconds = Some(10);
        liveness.period_seconds = Some(10);
        liveness.failure_threshold = Some(2);
        liveness.timeout_seconds = Some(5);

        Container {
            name: names.container.clone(),
            image_pull_policy: Some("Always".to_string()),
            ports: Some(vec![ContainerPort {
                name: Some(names.listen_port_name.clone()),
                container_port: names.listen_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            readiness_probe: Some(readiness),
            liveness_probe: Some(liveness),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: names.config_map_name(deployment),
                    mount_path: CONFIG_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: names.data_volume.clone(),
                    mount_path: DATA_MOUNT_PATH.to_string(),
                    read_only: Some(false),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    fn patch_deployment(&self, deployment: &mut Deployment) {
        let names = &self.config.names;
        let config_map =
            names.config_map_name(deployment.metadata.name.as_deref().unwrap_or_default());

        let Some(pod) = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        else {
            return;
        };
        let volumes = pod.volumes.get_or_insert_with(Vec::new);
        volumes.push(Volume {
            name: config_map.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map,
                ..Default::default()
            }),
            ..Default::default()
        });
        // scratch space for mitmproxy's certificates and flow dumps
        volumes.push(Volume {
            name: names.data_volume.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }

    async fn ready_env(&self, store: &dyn ClusterStore, options: &ProxyOptions) -> Result<()> {
        let payload = self.render_config(options)?;
        aux_config::ready(
            store,
            &self.config,
            &options.namespace,
            &options.deployment,
            CONFIG_FILE,
            payload,
        )
        .await
        .map(|_| ())
    }

    async fn unready_env(
        &self,
        store: &dyn ClusterStore,
        namespace: &str,
        deployment: &str,
    ) -> Result<()> {
        aux_config::unready(store, &self.config, namespace, deployment)
            .await
            .map(|_| ())
    }
}
