//! Runtime configuration for tap operations.
//!
//! Names, annotation keys, images and timings are carried in a [`TapConfig`]
//! value handed to the orchestrator at construction, so two orchestrations in
//! one process can never observe each other's settings.
//!
//! The config can be overridden from a JSON file; every field is optional and
//! falls back to the defaults below.

use std::path::Path;
use std::time::Duration;

use mittens_common::retry::{RetryConfig, DEFAULT_CONFLICT_ATTEMPTS};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Annotation keys that make up the persisted tap state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Annotations {
    /// On the Service: pre-tap target port. Presence means "tapped".
    pub original_target_port: String,
    /// On the Service: number of the Service port that was rewritten.
    pub tapped_port: String,
    /// On the aux ConfigMap: `<prefix><deployment>` owner marker.
    pub config_map_owner: String,
    /// On the pod template and its Pods: name of the tapped Deployment.
    pub tapped: String,
    /// On the Service: suppresses GitOps drift correction.
    pub drift_detection: String,
    /// Value written under `drift_detection`.
    pub drift_detection_disabled: String,
    /// On the Service: pre-tap value of `drift_detection`, when it had one.
    pub drift_detection_previous: String,
}

impl Default for Annotations {
    fn default() -> Self {
        Self {
            original_target_port: "mittens.io/original-port".to_string(),
            tapped_port: "mittens.io/tapped-port".to_string(),
            config_map_owner: "mittens.io/proxy-config".to_string(),
            tapped: "mittens.io/tapped".to_string(),
            drift_detection: "helm.toolkit.fluxcd.io/driftDetection".to_string(),
            drift_detection_disabled: "disabled".to_string(),
            drift_detection_previous: "mittens.io/previous-drift-detection".to_string(),
        }
    }
}

/// Reserved names for everything mittens adds to a workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SidecarNames {
    /// Name of the injected container
    pub container: String,
    /// Name of the proxy listen port, also given to unnamed Service ports
    pub listen_port_name: String,
    /// Legacy synthetic web port removed from Services on untap
    pub web_port_name: String,
    /// Port the proxy listens on inside the Pod
    pub listen_port: i32,
    /// Prefix of the aux ConfigMap name and its volume
    pub config_map_prefix: String,
    /// Prefix of the owner marker value on the aux ConfigMap
    pub owner_value_prefix: String,
    /// Every volume mittens adds starts with this prefix
    pub volume_prefix: String,
    /// Scratch volume for proxy runtime state
    pub data_volume: String,
}

impl Default for SidecarNames {
    fn default() -> Self {
        Self {
            container: "mittens".to_string(),
            listen_port_name: "mittens-listen".to_string(),
            web_port_name: "mittens-web".to_string(),
            listen_port: 7777,
            config_map_prefix: "mittens-target-".to_string(),
            owner_value_prefix: "target-".to_string(),
            volume_prefix: "mittens-".to_string(),
            data_volume: "mittens-mitmproxy-data".to_string(),
        }
    }
}

impl SidecarNames {
    /// Name of the aux ConfigMap (and its volume) for a Deployment
    pub fn config_map_name(&self, deployment: &str) -> String {
        format!("{}{}", self.config_map_prefix, deployment)
    }

    /// Owner marker value written on the aux ConfigMap for a Deployment
    pub fn owner_value(&self, deployment: &str) -> String {
        format!("{}{}", self.owner_value_prefix, deployment)
    }

    /// True for volumes mittens owns
    pub fn is_reserved_volume(&self, name: &str) -> bool {
        name.starts_with(&self.volume_prefix)
    }
}

/// Default sidecar images per protocol family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Images {
    /// HTTP(S) intercepting proxy
    pub http: String,
    /// Raw TCP/UDP capture
    pub raw: String,
    /// gRPC-aware capture
    pub grpc: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            http: "ghcr.io/lappihuan/mittens-mitmproxy:latest".to_string(),
            raw: "ghcr.io/lappihuan/mittens-raw:latest".to_string(),
            grpc: "ghcr.io/lappihuan/mittens-grpc:latest".to_string(),
        }
    }
}

/// Full tap configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TapConfig {
    /// Annotation keys
    pub annotations: Annotations,
    /// Reserved names
    pub names: SidecarNames,
    /// Default images
    pub images: Images,
    /// Default sidecar command arguments
    pub command_args: Vec<String>,
    /// Seconds to wait for the tapped Pod to become ready
    pub readiness_timeout_secs: u64,
    /// Milliseconds between readiness polls
    pub readiness_interval_millis: u64,
    /// Seconds to wait before the first readiness check, so the pre-tap Pod
    /// is not mistaken for the tapped one while the rollout starts
    pub readiness_settle_secs: u64,
    /// Attempts for a conflicting update before giving up
    pub conflict_attempts: u32,
    /// Command run inside the sidecar on attach
    pub session_command: Vec<String>,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            annotations: Annotations::default(),
            names: SidecarNames::default(),
            images: Images::default(),
            command_args: vec!["mitmproxy".to_string()],
            readiness_timeout_secs: 90,
            readiness_interval_millis: 1000,
            readiness_settle_secs: 5,
            conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS,
            session_command: vec![
                "tmux".to_string(),
                "attach-session".to_string(),
                "-t".to_string(),
                "mitmproxy".to_string(),
            ],
        }
    }
}

impl TapConfig {
    /// Load a config file, falling back to defaults for omitted fields.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make tap/untap unable to find their own state.
    pub fn validate(&self) -> Result<()> {
        let names = &self.names;
        if names.container.is_empty() {
            return Err(Error::config("names.container must not be empty"));
        }
        if names.volume_prefix.is_empty() {
            return Err(Error::config(
                "names.volumePrefix must not be empty, untap would strip every volume",
            ));
        }
        if !names.config_map_prefix.starts_with(&names.volume_prefix)
            || !names.data_volume.starts_with(&names.volume_prefix)
        {
            return Err(Error::config(format!(
                "names.configMapPrefix and names.dataVolume must start with {:?}",
                names.volume_prefix
            )));
        }
        if !(1..=65535).contains(&names.listen_port) {
            return Err(Error::config(format!(
                "names.listenPort {} is not a valid port",
                names.listen_port
            )));
        }
        if self.annotations.original_target_port.is_empty()
            || self.annotations.tapped_port.is_empty()
            || self.annotations.drift_detection_previous.is_empty()
            || self.annotations.tapped.is_empty()
            || self.annotations.config_map_owner.is_empty()
        {
            return Err(Error::config("annotation keys must not be empty"));
        }
        if self.readiness_interval_millis == 0 {
            return Err(Error::config("readinessIntervalMillis must be positive"));
        }
        Ok(())
    }

    /// Retry budget for optimistic-concurrency writes
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.conflict_attempts)
    }

    /// Readiness timeout
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Readiness poll interval
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_millis)
    }

    /// Delay before the first readiness check
    pub fn readiness_settle(&self) -> Duration {
        Duration::from_secs(self.readiness_settle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TapConfig::default();
        config.validate().unwrap();
        assert_eq!(config.names.listen_port, 7777);
        assert_eq!(config.readiness_timeout(), Duration::from_secs(90));
        assert_eq!(config.readiness_interval(), Duration::from_secs(1));
        assert_eq!(config.retry().max_attempts, DEFAULT_CONFLICT_ATTEMPTS);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config: TapConfig = serde_json::from_str(
            r#"{"images": {"http": "registry.local/mitm:1"}, "readinessTimeoutSecs": 30}"#,
        )
        .unwrap();
        assert_eq!(config.images.http, "registry.local/mitm:1");
        assert_eq!(config.images.grpc, Images::default().grpc);
        assert_eq!(config.readiness_timeout_secs, 30);
        assert_eq!(config.annotations, Annotations::default());
    }

    #[test]
    fn reserved_names_derive_from_deployment() {
        let names = SidecarNames::default();
        assert_eq!(names.config_map_name("web"), "mittens-target-web");
        assert_eq!(names.owner_value("web"), "target-web");
        assert!(names.is_reserved_volume("mittens-target-web"));
        assert!(names.is_reserved_volume("mittens-mitmproxy-data"));
        // shares the word but not the reserved prefix
        assert!(!names.is_reserved_volume("mittensdata"));
        assert!(!names.is_reserved_volume("app-mittens-cache"));
    }

    #[test]
    fn empty_volume_prefix_is_rejected() {
        let mut config = TapConfig::default();
        config.names.volume_prefix.clear();
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn config_map_prefix_must_be_reserved() {
        let mut config = TapConfig::default();
        config.names.config_map_prefix = "proxy-".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = TapConfig::load(Path::new("/nonexistent/mittens.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
