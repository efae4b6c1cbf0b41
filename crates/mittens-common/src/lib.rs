//! Common types for mittens: errors, retry discipline and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager / user agent reported to the API server
pub const FIELD_MANAGER: &str = "mittens";
