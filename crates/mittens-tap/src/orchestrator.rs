//! Tap/untap state machine.
//!
//! A Service moves Untapped -> Tapping -> Tapped -> Untapping -> Untapped.
//! "Tapped" is decided by the original-port marker on the Service alone.
//!
//! The forward transition is ready env, inject sidecar, redirect Service.
//! Any failure once the first mutation has been attempted runs the reverse
//! transition before the original error is returned. The reverse transition
//! is unconditional and tolerates objects that are already gone, so it also
//! repairs state left behind by a crashed run.

use std::sync::Arc;

use mittens_common::retry::retry_on_conflict;
use tracing::{debug, info, warn};

use crate::config::TapConfig;
use crate::inject::{inject_sidecar, strip_sidecar};
use crate::options::{Protocol, ProxyMode, ProxyOptions};
use crate::proxy::{self, TapProxy};
use crate::redirect::{self, is_redirected};
use crate::resolver::{deployment_for_service, detect_service_port, resolve_upstream_port};
use crate::store::{ClusterStore, SharedStore};
use crate::{Error, Result};

/// What to tap and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapRequest {
    /// Target Service
    pub service: String,
    /// Namespace of the Service
    pub namespace: String,
    /// Service port to tap; detected when the Service has exactly one
    pub port: Option<i32>,
    /// Intercepted protocol
    pub protocol: Protocol,
    /// Proxy mode
    pub mode: ProxyMode,
    /// Upstream container speaks TLS
    pub upstream_https: bool,
    /// Sidecar image; the protocol's default image when unset
    pub image: Option<String>,
    /// Sidecar arguments; the configured default when unset
    pub command_args: Option<Vec<String>>,
}

impl TapRequest {
    /// HTTP reverse-proxy tap of `service` with every other option defaulted
    pub fn new(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            port: None,
            protocol: Protocol::Http,
            mode: ProxyMode::Reverse,
            upstream_https: false,
            image: None,
            command_args: None,
        }
    }
}

/// Result of a successful tap call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TapOutcome {
    /// The forward transition ran
    Tapped {
        /// Service port that now routes through the proxy
        port: i32,
        /// Deployment the sidecar was injected into
        deployment: String,
    },
    /// The Service already carried the marker; nothing was changed
    AlreadyTapped {
        /// Deployment behind the Service
        deployment: String,
    },
}

impl TapOutcome {
    /// Deployment behind the tapped Service
    pub fn deployment(&self) -> &str {
        match self {
            Self::Tapped { deployment, .. } | Self::AlreadyTapped { deployment } => deployment,
        }
    }
}

/// Drives tap and untap against a cluster store.
#[derive(Clone)]
pub struct Orchestrator {
    store: SharedStore,
    config: Arc<TapConfig>,
}

impl Orchestrator {
    /// Create an orchestrator. The config is fixed for its lifetime.
    pub fn new(store: SharedStore, config: Arc<TapConfig>) -> Self {
        Self { store, config }
    }

    /// Cluster store this orchestrator writes to
    pub fn store(&self) -> &dyn ClusterStore {
        self.store.as_ref()
    }

    /// Active configuration
    pub fn config(&self) -> &Arc<TapConfig> {
        &self.config
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if self.store.namespace_exists(namespace).await? {
            Ok(())
        } else {
            Err(Error::NamespaceNotExist {
                namespace: namespace.to_string(),
            })
        }
    }

    /// Whether the Service currently carries the original-port marker.
    pub async fn is_tapped(&self, namespace: &str, service: &str) -> Result<bool> {
        let svc = self.store.get_service(namespace, service).await?;
        Ok(is_redirected(&svc, &self.config))
    }

    /// Tap a Service.
    ///
    /// Validation and resolution happen before anything is written, so their
    /// errors leave the cluster untouched. An already tapped Service is
    /// reported as [`TapOutcome::AlreadyTapped`] without any write.
    pub async fn tap(&self, request: &TapRequest) -> Result<TapOutcome> {
        let namespace = request.namespace.as_str();
        self.ensure_namespace(namespace).await?;

        let proxy = proxy::proxy_for(request.protocol, &self.config)?;
        proxy.check_mode(request.mode)?;

        let service = self.store.get_service(namespace, &request.service).await?;
        if is_redirected(&service, &self.config) {
            let deployment = deployment_for_service(self.store(), namespace, &service).await?;
            let deployment_name = deployment.metadata.name.clone().unwrap_or_default();
            info!(
                service = %request.service,
                namespace = %namespace,
                deployment = %deployment_name,
                "Service already tapped"
            );
            return Ok(TapOutcome::AlreadyTapped {
                deployment: deployment_name,
            });
        }

        let port = match request.port {
            Some(port) => port,
            None => detect_service_port(&service)?,
        };
        let deployment = deployment_for_service(self.store(), namespace, &service).await?;
        let deployment_name = deployment.metadata.name.clone().unwrap_or_default();

        let options = ProxyOptions {
            target: request.service.clone(),
            protocol: request.protocol,
            upstream_https: request.upstream_https,
            upstream_port: resolve_upstream_port(&service, port, &deployment)?,
            mode: request.mode,
            namespace: namespace.to_string(),
            image: request
                .image
                .clone()
                .unwrap_or_else(|| proxy::default_image(request.protocol, &self.config).to_string()),
            command_args: request
                .command_args
                .clone()
                .unwrap_or_else(|| self.config.command_args.clone()),
            deployment: deployment_name.clone(),
        };

        info!(
            service = %request.service,
            namespace = %namespace,
            deployment = %deployment_name,
            port = port,
            upstream_port = %options.upstream_port,
            proxy = proxy.name(),
            "Tapping Service"
        );

        if let Err(e) = self.forward(proxy.as_ref(), &options, port).await {
            warn!(
                service = %request.service,
                namespace = %namespace,
                error = %e,
                "Tap failed, reverting"
            );
            if let Err(rollback) = self
                .reverse(namespace, &request.service, Some(&deployment_name))
                .await
            {
                warn!(error = %rollback, "Rollback incomplete, run untap to finish cleanup");
            }
            return Err(e);
        }

        info!(
            service = %request.service,
            namespace = %namespace,
            port = port,
            "Service tapped"
        );
        Ok(TapOutcome::Tapped {
            port,
            deployment: deployment_name,
        })
    }

    async fn forward(&self, proxy: &dyn TapProxy, options: &ProxyOptions, port: i32) -> Result<()> {
        let store = self.store();
        let config = self.config.as_ref();
        let namespace = options.namespace.as_str();

        proxy.ready_env(store, options).await?;

        retry_on_conflict(&config.retry(), "inject_sidecar", || async move {
            let mut deployment = store.get_deployment(namespace, &options.deployment).await?;
            inject_sidecar(&mut deployment, proxy, options, config)?;
            store.replace_deployment(namespace, &deployment).await
        })
        .await?;
        debug!(deployment = %options.deployment, "Sidecar injected");

        redirect::redirect(store, namespace, &options.target, port, config).await
    }

    /// Remove every trace of a tap from the Service, its Deployment and the
    /// namespace. Safe to run on a Service that was never tapped.
    ///
    /// The Service is restored even when its Deployment no longer resolves;
    /// the Deployment-scoped steps are then skipped.
    pub async fn untap(&self, namespace: &str, service: &str) -> Result<()> {
        self.ensure_namespace(namespace).await?;
        let svc = self.store.get_service(namespace, service).await?;
        let deployment = match deployment_for_service(self.store(), namespace, &svc).await {
            Ok(deployment) => deployment.metadata.name,
            Err(e) if e.is_validation() || e.is_not_found() => {
                warn!(
                    service = %service,
                    namespace = %namespace,
                    error = %e,
                    "Deployment not resolved, restoring the Service only"
                );
                None
            }
            Err(e) => return Err(e),
        };

        info!(service = %service, namespace = %namespace, "Untapping Service");
        self.reverse(namespace, service, deployment.as_deref()).await?;
        info!(service = %service, namespace = %namespace, "Service untapped");
        Ok(())
    }

    /// Reverse transition. Every step runs even if an earlier one failed;
    /// the first failure is returned. Without a Deployment only the Service
    /// is restored.
    async fn reverse(&self, namespace: &str, service: &str, deployment: Option<&str>) -> Result<()> {
        let store = self.store();
        let config = self.config.as_ref();
        let mut first_error = None;

        if let Err(e) = redirect::unredirect(store, namespace, service, config).await {
            warn!(service = %service, error = %e, "Failed to restore Service");
            first_error.get_or_insert(e);
        }

        let Some(deployment) = deployment else {
            return match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            };
        };

        let stripped = retry_on_conflict(&config.retry(), "strip_sidecar", || async move {
            let mut current = store.get_deployment(namespace, deployment).await?;
            if !strip_sidecar(&mut current, config)? {
                return Ok(false);
            }
            store.replace_deployment(namespace, &current).await?;
            Ok(true)
        })
        .await;
        match stripped {
            Ok(true) => info!(deployment = %deployment, "Sidecar removed"),
            Ok(false) => debug!(deployment = %deployment, "No sidecar to remove"),
            Err(e) if e.is_not_found() => debug!(deployment = %deployment, "Deployment gone"),
            Err(e) => {
                warn!(deployment = %deployment, error = %e, "Failed to remove sidecar");
                first_error.get_or_insert(e);
            }
        }

        // The proxy that tapped is not recorded, so every known one tears down
        for proxy in proxy::registry(&self.config) {
            match proxy.unready_env(store, namespace, deployment).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(proxy = proxy.name(), error = %e, "Nothing to tear down")
                }
                Err(e) => {
                    warn!(proxy = proxy.name(), error = %e, "Failed to tear down proxy env");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
