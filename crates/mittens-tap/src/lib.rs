//! Tap engine for mittens
//!
//! Inserts an intercepting proxy sidecar in front of a running Service and
//! removes it again. All persisted state lives in annotations on the cluster
//! objects themselves, so a crashed run can always be repaired by an untap.

#![deny(missing_docs)]

pub mod aux_config;
pub mod config;
pub mod inject;
pub mod options;
pub mod orchestrator;
pub mod proxy;
pub mod redirect;
pub mod resolver;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::TapConfig;
pub use mittens_common::{Error, Result};
pub use options::{Protocol, ProxyMode, ProxyOptions};
pub use orchestrator::{Orchestrator, TapOutcome, TapRequest};
pub use session::{Coordinator, KubectlAttacher, SessionAttacher};
pub use store::{ClusterStore, KubeStore};
