//! Per-attempt proxy options.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Traffic protocol a tap intercepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP or HTTPS
    Http,
    /// Raw TCP
    Tcp,
    /// Raw UDP
    Udp,
    /// gRPC
    Grpc,
}

impl Protocol {
    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "grpc" => Ok(Self::Grpc),
            _ => Err(Error::InvalidProtocol {
                protocol: s.to_string(),
            }),
        }
    }
}

/// Proxy operating mode. Closed set; only `Reverse` is implemented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Reverse proxy in front of the upstream container
    #[default]
    Reverse,
    /// Regular forward proxy
    Regular,
    /// SOCKS5 proxy
    Socks5,
    /// Chained to an upstream proxy
    Upstream,
    /// iptables-based transparent proxy
    Transparent,
}

impl ProxyMode {
    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reverse => "reverse",
            Self::Regular => "regular",
            Self::Socks5 => "socks5",
            Self::Upstream => "upstream",
            Self::Transparent => "transparent",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reverse" => Ok(Self::Reverse),
            "regular" => Ok(Self::Regular),
            "socks5" => Ok(Self::Socks5),
            "upstream" => Ok(Self::Upstream),
            "transparent" => Ok(Self::Transparent),
            _ => Err(Error::InvalidProxyMode {
                mode: s.to_string(),
            }),
        }
    }
}

/// Everything a tap implementation needs, resolved once per tap attempt.
///
/// Built after the Deployment and upstream port have been resolved and then
/// only borrowed, so every mutation step sees the same inputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyOptions {
    /// Target Service
    pub target: String,
    /// Intercepted protocol
    pub protocol: Protocol,
    /// Upstream speaks TLS
    pub upstream_https: bool,
    /// Container port the proxy forwards to
    pub upstream_port: String,
    /// Proxy mode
    pub mode: ProxyMode,
    /// Namespace of the Service and Deployment
    pub namespace: String,
    /// Sidecar image
    pub image: String,
    /// Sidecar command arguments
    pub command_args: Vec<String>,
    /// Resolved Deployment name
    pub deployment: String,
}

impl ProxyOptions {
    /// URL scheme used to reach the upstream container
    pub fn upstream_scheme(&self) -> &'static str {
        if self.upstream_https {
            "https"
        } else {
            "http"
        }
    }
}
