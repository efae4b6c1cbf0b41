//! Error types for tap and untap operations
//!
//! Variants are grouped by how callers are expected to react: resolution and
//! validation errors abort before anything is mutated, conflicts are retried
//! inside a bounded budget, and cleanup errors on an already-absent object are
//! tolerated by the untap path.

use std::time::Duration;

use thiserror::Error;

/// Main error type for mittens operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that has no more specific classification
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    // ---------------------------------------------------------------------
    // Resolution / validation
    // ---------------------------------------------------------------------
    /// The requested namespace does not exist
    #[error("the provided Namespace {namespace:?} does not exist")]
    NamespaceNotExist {
        /// Namespace that was looked up
        namespace: String,
    },

    /// The target Service has no selector to resolve a workload from
    #[error("no selectors are set for the target Service {service:?}")]
    SelectorsMissing {
        /// Service name
        service: String,
    },

    /// The selector matched no Deployment
    #[error("the Service selector {selector:?} did not match any Deployments")]
    SelectorNoMatch {
        /// Label selector string that was queried
        selector: String,
    },

    /// The selector matched more than one Deployment
    #[error("the Service selector {selector:?} matched {count} Deployments")]
    SelectorMultiMatch {
        /// Label selector string that was queried
        selector: String,
        /// Number of Deployments matched
        count: usize,
    },

    /// The selected Deployment lives in a different namespace than requested
    #[error("the Service selector matched Deployment {deployment:?} outside Namespace {namespace:?}")]
    DeploymentOutsideNamespace {
        /// Deployment name
        deployment: String,
        /// Namespace that was requested
        namespace: String,
    },

    /// The target Service does not expose the requested port
    #[error("the target Service {service:?} does not have port {port}")]
    ServiceMissingPort {
        /// Service name
        service: String,
        /// Requested service port
        port: i32,
    },

    /// The target Service exposes no ports at all
    #[error("the target Service {service:?} has no ports defined")]
    ServiceHasNoPorts {
        /// Service name
        service: String,
    },

    /// The Service exposes several ports and none was chosen
    #[error("the target Service {service:?} exposes multiple ports {ports:?}, choose one with --port")]
    PortSelectionRequired {
        /// Service name
        service: String,
        /// Candidate service ports
        ports: Vec<i32>,
    },

    /// A named target port is not declared by any container of the Deployment
    #[error("could not resolve named port {port_name:?} from Deployment {deployment:?}")]
    DeploymentMissingPorts {
        /// Deployment name
        deployment: String,
        /// Named target port on the Service
        port_name: String,
    },

    /// The protocol is recognised but has no tap implementation yet
    #[error("protocol {protocol:?} is currently not supported")]
    UnsupportedProtocol {
        /// Requested protocol
        protocol: String,
    },

    /// The protocol string is not recognised at all
    #[error("invalid protocol {protocol:?}")]
    InvalidProtocol {
        /// Requested protocol
        protocol: String,
    },

    /// The proxy mode is recognised but unsupported by the tap implementation
    #[error("{proxy} only supports \"reverse\" mode, {mode:?} is currently not supported")]
    UnsupportedMode {
        /// Tap implementation name
        proxy: String,
        /// Requested mode
        mode: String,
    },

    /// The proxy mode string is not recognised at all
    #[error("invalid proxy mode {mode:?}")]
    InvalidProxyMode {
        /// Requested mode
        mode: String,
    },

    // ---------------------------------------------------------------------
    // Optimistic concurrency
    // ---------------------------------------------------------------------
    /// The object changed between read and write (HTTP 409 on update)
    #[error("conflict updating {kind} {name:?}: the object has been modified")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Conflicts persisted past the retry budget
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Operation that was retried
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Last error observed
        #[source]
        source: Box<Error>,
    },

    // ---------------------------------------------------------------------
    // Consistency
    // ---------------------------------------------------------------------
    /// Create was rejected because the object already exists
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// The created object does not carry what was sent
    #[error("the created {kind} {name:?} did not match the desired state: sent {sent} bytes, stored {stored}")]
    CreateResourceMismatch {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Payload length that was sent
        sent: usize,
        /// Payload length observed on the created object
        stored: usize,
    },

    // ---------------------------------------------------------------------
    // Not found
    // ---------------------------------------------------------------------
    /// The requested object does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// No config map carries the owner marker for the Deployment
    #[error("no proxy ConfigMap is owned by Deployment {deployment:?}")]
    ConfigMapNoMatch {
        /// Deployment name
        deployment: String,
    },

    /// No running Pod carries the tapped marker for the Deployment
    #[error("no tapped Pod was found for Deployment {deployment:?}")]
    TappedPodNoMatch {
        /// Deployment name
        deployment: String,
    },

    // ---------------------------------------------------------------------
    // Fatal / environmental
    // ---------------------------------------------------------------------
    /// The tapped Pod did not become ready in time
    #[error("Pod for Deployment {deployment:?} not ready after {}s", .timeout.as_secs())]
    ReadinessTimeout {
        /// Deployment name
        deployment: String,
        /// How long we waited
        timeout: Duration,
    },

    /// The operation was interrupted by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// The interactive session could not be launched or failed
    #[error("interactive session error: {message}")]
    Session {
        /// Description of what failed
        message: String,
    },

    /// Invalid runtime configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is wrong
        message: String,
    },

    /// Internal error with context
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error happened
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a conflict error for a resource
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for a resource
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error for a resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a session error with the given message
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// True for optimistic-concurrency version mismatches
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True when the object the operation targeted is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::ConfigMapNoMatch { .. } | Self::TappedPodNoMatch { .. }
        )
    }

    /// True for errors raised before any cluster mutation, which never
    /// warrant a retry or a compensating untap
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NamespaceNotExist { .. }
                | Self::SelectorsMissing { .. }
                | Self::SelectorNoMatch { .. }
                | Self::SelectorMultiMatch { .. }
                | Self::DeploymentOutsideNamespace { .. }
                | Self::ServiceMissingPort { .. }
                | Self::ServiceHasNoPorts { .. }
                | Self::PortSelectionRequired { .. }
                | Self::DeploymentMissingPorts { .. }
                | Self::UnsupportedProtocol { .. }
                | Self::InvalidProtocol { .. }
                | Self::UnsupportedMode { .. }
                | Self::InvalidProxyMode { .. }
        )
    }
}
