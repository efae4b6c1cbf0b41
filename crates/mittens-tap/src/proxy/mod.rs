//! Tap implementations.
//!
//! A [`TapProxy`] is everything the orchestrator needs to know about one kind
//! of intercepting sidecar. The orchestrator only talks to this trait, so a
//! raw TCP/UDP or gRPC capture can be added here without touching it.

pub mod mitmproxy;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;

use crate::config::TapConfig;
use crate::options::{Protocol, ProxyMode, ProxyOptions};
use crate::store::ClusterStore;
use crate::{Error, Result};

pub use mitmproxy::Mitmproxy;

/// A way of tapping a Service.
#[async_trait]
pub trait TapProxy: Send + Sync {
    /// Short name, e.g. "mitmproxy"
    fn name(&self) -> &'static str;

    /// Protocols this implementation intercepts
    fn protocols(&self) -> &[Protocol];

    /// Reject modes this implementation cannot run in
    fn check_mode(&self, mode: ProxyMode) -> Result<()>;

    /// Sidecar container for the named Deployment. Image and arguments are
    /// filled in by the caller.
    fn sidecar(&self, deployment: &str) -> Container;

    /// Add the volumes the sidecar mounts. Called before the sidecar is
    /// appended to the container list.
    fn patch_deployment(&self, deployment: &mut Deployment);

    /// Create resources the sidecar needs that live outside the Deployment
    async fn ready_env(&self, store: &dyn ClusterStore, options: &ProxyOptions) -> Result<()>;

    /// Remove what [`TapProxy::ready_env`] created
    async fn unready_env(
        &self,
        store: &dyn ClusterStore,
        namespace: &str,
        deployment: &str,
    ) -> Result<()>;
}

/// Every known tap implementation, used by untap to tear down whatever a
/// previous tap may have left behind.
pub fn registry(config: &Arc<TapConfig>) -> Vec<Box<dyn TapProxy>> {
    vec![Box::new(Mitmproxy::new(config.clone()))]
}

/// The tap implementation for a protocol.
pub fn proxy_for(protocol: Protocol, config: &Arc<TapConfig>) -> Result<Box<dyn TapProxy>> {
    registry(config)
        .into_iter()
        .find(|p| p.protocols().contains(&protocol))
        .ok_or_else(|| Error::UnsupportedProtocol {
            protocol: protocol.to_string(),
        })
}

/// Default sidecar image for a protocol.
pub fn default_image(protocol: Protocol, config: &TapConfig) -> &str {
    match protocol {
        Protocol::Http => config.images.http.as_str(),
        Protocol::Tcp | Protocol::Udp => config.images.raw.as_str(),
        Protocol::Grpc => config.images.grpc.as_str(),
    }
}
