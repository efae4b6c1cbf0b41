//! CLI commands

use std::sync::Arc;

use mittens_common::kube_utils::create_client;
use mittens_tap::store::SharedStore;
use mittens_tap::{KubeStore, Orchestrator};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::load_tap_config;
use crate::{GlobalArgs, Result};

pub mod tap;
pub mod untap;
pub mod version;

/// An orchestrator bound to a cluster and namespace.
pub struct Connection {
    pub orchestrator: Orchestrator,
    pub namespace: String,
}

/// Load the tap config, build a kube client and pick the namespace.
///
/// Without `--namespace` the kubeconfig context's namespace is used.
pub async fn connect(global: &GlobalArgs, namespace: Option<&str>) -> Result<Connection> {
    let config = Arc::new(load_tap_config(global.config.as_deref())?);
    let client = create_client(global.kubeconfig.as_deref(), global.context.as_deref()).await?;
    let namespace = namespace
        .map(str::to_string)
        .unwrap_or_else(|| client.default_namespace().to_string());
    debug!(namespace = %namespace, "Connected to cluster");

    let store: SharedStore = Arc::new(KubeStore::new(client));
    Ok(Connection {
        orchestrator: Orchestrator::new(store, config),
        namespace,
    })
}

/// Token cancelled on Ctrl+C or SIGTERM.
pub fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        println!();
        println!("Stopping mittens...");
        trigger.cancel();
    });
    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = sigterm => info!("Received SIGTERM"),
    }
}
