//! Readiness wait and interactive attach around a tap.
//!
//! Once the forward transition has run, the tapped Pod is polled until its
//! containers are ready and the operator is attached to the proxy session.
//! Whatever ends the session, the tap is reversed before returning.
//!
//! A readiness timeout is the one exit that leaves the tap in place, so the
//! stuck Pod can be inspected.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use mittens_common::kube_utils::annotation;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::TapConfig;
use crate::orchestrator::{Orchestrator, TapOutcome, TapRequest};
use crate::store::ClusterStore;
use crate::{Error, Result};

/// Attaches the local terminal to a process in a running container.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionAttacher: Send + Sync {
    /// Run `command` in `container` of `pod` until it exits or `cancel` fires.
    async fn attach(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// [`SessionAttacher`] running `kubectl exec -it`.
#[derive(Clone, Debug, Default)]
pub struct KubectlAttacher {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlAttacher {
    /// Attach using the given kubeconfig and context, or kubectl's defaults
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubeconfig,
            context,
        }
    }

    fn command(&self, namespace: &str, pod: &str, container: &str, command: &[String]) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            cmd.args(["--context", context.as_str()]);
        }
        cmd.args(["exec", "-it", pod, "-n", namespace, "-c", container, "--"])
            .args(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SessionAttacher for KubectlAttacher {
    async fn attach(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut child = self
            .command(namespace, pod, container, command)
            .spawn()
            .map_err(|e| Error::session(format!("failed to run kubectl exec: {}", e)))?;

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|e| Error::session(format!("failed to wait for kubectl exec: {}", e)))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::session(format!("kubectl exec exited with {}", status)))
                }
            }
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "kubectl exec already exited");
                }
                Err(Error::Cancelled)
            }
        }
    }
}

/// Find the Pod spawned from the tapped template of `deployment`.
///
/// The first Pod carrying the tapped marker for the Deployment wins.
pub async fn find_tapped_pod(
    store: &dyn ClusterStore,
    namespace: &str,
    deployment: &str,
    config: &TapConfig,
) -> Result<Pod> {
    store
        .list_pods(namespace)
        .await?
        .into_iter()
        .find(|pod| annotation(&pod.metadata, &config.annotations.tapped) == Some(deployment))
        .ok_or_else(|| Error::TappedPodNoMatch {
            deployment: deployment.to_string(),
        })
}

/// Whether the Pod reports `ContainersReady=True`.
pub fn containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "ContainersReady" && c.status == "True")
}

/// Runs tap, readiness wait, attach and untap as one lifecycle.
pub struct Coordinator {
    orchestrator: Orchestrator,
    attacher: Arc<dyn SessionAttacher>,
}

impl Coordinator {
    /// Create a coordinator
    pub fn new(orchestrator: Orchestrator, attacher: Arc<dyn SessionAttacher>) -> Self {
        Self {
            orchestrator,
            attacher,
        }
    }

    /// Wait until the tapped Pod of `deployment` is ready and return its name.
    ///
    /// The first check happens after the settle delay so the pre-tap Pod is
    /// not mistaken for the new one. `cancel` is observed before every poll
    /// and during every sleep. A Pod that does not exist yet counts as not
    /// ready; any other poll failure is returned.
    pub async fn wait_for_ready(
        &self,
        namespace: &str,
        deployment: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let config = self.orchestrator.config();
        let timeout = config.readiness_timeout();
        let deadline = Instant::now() + timeout;

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(config.readiness_settle()) => {}
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(Error::ReadinessTimeout {
                    deployment: deployment.to_string(),
                    timeout,
                });
            }

            match find_tapped_pod(self.orchestrator.store(), namespace, deployment, config).await {
                Ok(pod) if containers_ready(&pod) => {
                    let name = pod.metadata.name.unwrap_or_default();
                    info!(pod = %name, namespace = %namespace, "Tapped Pod ready");
                    return Ok(name);
                }
                Ok(pod) => debug!(pod = ?pod.metadata.name, "Tapped Pod not ready yet"),
                Err(Error::TappedPodNoMatch { .. }) => {
                    debug!(deployment = %deployment, "Tapped Pod not scheduled yet")
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(config.readiness_interval()) => {}
            }
        }
    }

    /// Tap, wait for the proxy, attach, and untap when the session ends.
    ///
    /// Cancellation or a failed poll untaps before returning. A readiness
    /// timeout returns without untapping.
    pub async fn run(&self, request: &TapRequest, cancel: CancellationToken) -> Result<TapOutcome> {
        let outcome = self.orchestrator.tap(request).await?;
        let namespace = request.namespace.as_str();
        let deployment = outcome.deployment().to_string();

        let pod = match self.wait_for_ready(namespace, &deployment, &cancel).await {
            Ok(pod) => pod,
            Err(e @ Error::ReadinessTimeout { .. }) => {
                warn!(
                    service = %request.service,
                    namespace = %namespace,
                    "Leaving tap in place for inspection"
                );
                return Err(e);
            }
            Err(e) => {
                self.untap_quietly(namespace, &request.service).await;
                return Err(e);
            }
        };

        let config = self.orchestrator.config();
        info!(pod = %pod, container = %config.names.container, "Attaching to proxy session");
        let session = self
            .attacher
            .attach(
                namespace,
                &pod,
                &config.names.container,
                &config.session_command,
                cancel.clone(),
            )
            .await;

        let untapped = self.orchestrator.untap(namespace, &request.service).await;
        session?;
        untapped?;
        Ok(outcome)
    }

    async fn untap_quietly(&self, namespace: &str, service: &str) {
        if let Err(e) = self.orchestrator.untap(namespace, service).await {
            warn!(service = %service, error = %e, "Untap failed, run untap again to clean up");
        }
    }
}
