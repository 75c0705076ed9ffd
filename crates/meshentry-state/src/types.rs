//! Domain types for service-registration records.
//!
//! These types are the ingestion shape of the registry: a record names a
//! set of hosts, optional virtual addresses, ports, a location and a
//! resolution mode, plus an optional endpoint list. All types round-trip
//! through serde unchanged so `List` hands back exactly what `Put` stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

/// Unique identifier for a record (`{namespace}/{name}`).
pub type RecordKey = String;

/// Prefix marking a socket-path endpoint address.
pub const UNIX_PREFIX: &str = "unix://";

// ── Record ─────────────────────────────────────────────────────────

/// A declarative service registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Exact DNS names or `*.suffix` wildcards.
    pub hosts: Vec<String>,
    /// Virtual IPs or CIDR blocks.
    #[serde(default)]
    pub addresses: Vec<String>,
    pub ports: Vec<ServicePort>,
    pub location: Location,
    pub resolution: Resolution,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A declared service port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePort {
    pub number: u16,
    /// Unique within the record; endpoint overrides refer to it.
    pub name: String,
    pub protocol: Protocol,
}

/// One concrete backend of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Endpoint {
    /// IP literal, DNS name, or `unix:///absolute/path`.
    pub address: String,
    /// Port-name → port-number overrides.
    #[serde(default, rename = "ports")]
    pub port_overrides: BTreeMap<String, u16>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Whether a service lives inside the mesh or outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Location {
    MeshExternal,
    MeshInternal,
}

/// How a record's endpoint addresses are determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// Forward to the connection's original destination.
    None,
    /// Use the declared endpoint addresses verbatim.
    Static,
    /// Resolve endpoint (or host) names through DNS.
    Dns,
}

/// Port protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Http,
    Https,
    Http2,
    Grpc,
    Tls,
    Tcp,
    Mongo,
    Udp,
}

impl Protocol {
    /// Whether traffic on this port carries a host name (HTTP `Host`
    /// header or TLS SNI) that can identify the service.
    pub fn is_host_identified(self) -> bool {
        match self {
            Protocol::Http | Protocol::Http2 | Protocol::Grpc => true,
            Protocol::Https | Protocol::Tls => true,
            Protocol::Tcp | Protocol::Mongo | Protocol::Udp => false,
        }
    }
}

// ── Endpoint addresses ────────────────────────────────────────────

/// Parsed form of [`Endpoint::address`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EndpointAddress {
    Ip(IpAddr),
    Hostname(String),
    Unix(PathBuf),
}

impl EndpointAddress {
    /// Classify an address literal. Returns `None` for empty strings and
    /// for `unix://` literals that are not followed by an absolute path.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(path) = raw.strip_prefix(UNIX_PREFIX) {
            if !path.starts_with('/') || path.len() < 2 {
                return None;
            }
            return Some(EndpointAddress::Unix(PathBuf::from(path)));
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Some(EndpointAddress::Ip(ip));
        }
        Some(EndpointAddress::Hostname(raw.to_ascii_lowercase()))
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, EndpointAddress::Unix(_))
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointAddress::Ip(ip) => write!(f, "{ip}"),
            EndpointAddress::Hostname(host) => f.write_str(host),
            EndpointAddress::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

impl ServiceRecord {
    /// Build the composite store key.
    pub fn table_key(&self) -> RecordKey {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Look up a declared port by number.
    pub fn port(&self, number: u16) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.number == number)
    }
}

impl Endpoint {
    /// Convenience constructor for an endpoint with no overrides or labels.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Effective port for `port`: the override keyed by its name, or the
    /// declared number.
    pub fn effective_port(&self, port: &ServicePort) -> u16 {
        self.port_overrides
            .get(&port.name)
            .copied()
            .unwrap_or(port.number)
    }
}
