//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction and the mapping from raw API failures onto the
//! error taxonomy the tap engine branches on.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connect timeout for API server connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for API server requests
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Which kind of request produced an API error.
///
/// HTTP 409 means "stale resourceVersion" on an update but "name taken" on a
/// create, so the mapping needs to know which one it is looking at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// get / list
    Read,
    /// create
    Create,
    /// replace (update with resourceVersion)
    Replace,
    /// delete
    Delete,
}

/// Map a kube-rs error onto the mittens taxonomy.
pub fn classify(err: kube::Error, verb: Verb, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 && verb == Verb::Create => {
            Error::already_exists(kind, name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, name),
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
        other => Error::Kube { source: other },
    }
}

/// Create a kube client from optional kubeconfig path
pub async fn create_client(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, context, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
        .await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None if context.is_some() => Config::from_kubeconfig(&options).await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig context: {}", e),
            )
        })?,
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Annotation value on an object, treating an absent map as empty.
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Mutable annotation map, creating it when the object had none.
///
/// Only a missing map is initialised; an existing map is always extended in
/// place so annotations owned by other tooling survive.
pub fn annotations_mut(meta: &mut ObjectMeta) -> &mut BTreeMap<String, String> {
    meta.annotations.get_or_insert_with(BTreeMap::new)
}

/// Parse a port that may be numeric or named.
///
/// `"8443"` becomes `Int(8443)` and anything else `String(..)`, so a value
/// written from either form reads back as the same kind of port.
pub fn parse_int_or_string(value: &str) -> IntOrString {
    match value.parse::<i32>() {
        Ok(n) => IntOrString::Int(n),
        Err(_) => IntOrString::String(value.to_string()),
    }
}

/// Render a port in the form [`parse_int_or_string`] accepts.
pub fn int_or_string_to_string(value: &IntOrString) -> String {
    match value {
        IntOrString::Int(n) => n.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}
