//! Name resolution for DNS-mode records.
//!
//! Resolution goes through the [`Resolve`] trait so the cache can be
//! driven by the host system, a fixed table, or a test double. The
//! default [`SystemResolver`] is a two-tier chain:
//! 1. **Hosts overrides**: parsed from `/etc/hosts`-format content
//! 2. **Host system DNS**: via `tokio::net::lookup_host`
//!
//! Resolution stops at the first tier that returns addresses.

pub mod cache;
pub mod refresh;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DnsConfig;

pub use cache::{CacheLookup, DnsCache, DnsUpdate};

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub addresses: Vec<IpAddr>,
    /// TTL reported by the resolver, if it knows one.
    pub ttl: Option<Duration>,
}

/// Asynchronous hostname resolver.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    /// Resolve `hostname` to at least one address, or fail with a reason.
    async fn lookup(&self, hostname: &str) -> Result<DnsAnswer, String>;
}

/// Parsed hosts-file entries: hostname → addresses.
#[derive(Clone, Debug, Default)]
pub struct EtcHosts {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl EtcHosts {
    /// Parse `/etc/hosts`-format content.
    ///
    /// Each line is `<IP> <hostname1> [hostname2 ...]`; `#` starts a
    /// comment. A hostname listed on several lines collects all IPs.
    pub fn parse(content: &str) -> Self {
        let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let Some(ip_str) = parts.next() else {
                continue;
            };
            let Ok(ip) = ip_str.parse::<IpAddr>() else {
                tracing::debug!(line = %line, "skipping hosts line with invalid IP");
                continue;
            };

            for hostname in parts {
                if hostname.starts_with('#') {
                    break;
                }
                entries.entry(hostname.to_lowercase()).or_default().push(ip);
            }
        }

        Self { entries }
    }

    /// Load and parse a hosts file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn lookup(&self, hostname: &str) -> Option<&Vec<IpAddr>> {
        self.entries.get(&hostname.to_lowercase())
    }
}

/// Resolver backed by hosts overrides and the host system's DNS.
#[derive(Clone, Debug, Default)]
pub struct SystemResolver {
    overrides: EtcHosts,
}

impl SystemResolver {
    pub fn new(overrides: EtcHosts) -> Self {
        Self { overrides }
    }

    /// Build from configuration, loading the hosts file if one is set.
    pub fn from_config(config: &DnsConfig) -> std::io::Result<Self> {
        let overrides = match &config.hosts_file {
            Some(path) => EtcHosts::load(path)?,
            None => EtcHosts::default(),
        };
        Ok(Self::new(overrides))
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, hostname: &str) -> Result<DnsAnswer, String> {
        let hostname_lower = hostname.to_lowercase();

        if let Some(addrs) = self.overrides.lookup(&hostname_lower)
            && !addrs.is_empty()
        {
            tracing::debug!(
                hostname = %hostname,
                source = "hosts_file",
                count = addrs.len(),
                "resolved via hosts overrides"
            );
            return Ok(DnsAnswer {
                addresses: addrs.clone(),
                ttl: None,
            });
        }

        let lookup_addr = format!("{hostname_lower}:0");
        match tokio::net::lookup_host(&lookup_addr).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.sort();
                ips.dedup();
                if ips.is_empty() {
                    return Err(format!("no addresses for {hostname}"));
                }
                tracing::debug!(
                    hostname = %hostname,
                    source = "system_dns",
                    count = ips.len(),
                    "resolved via system DNS"
                );
                Ok(DnsAnswer {
                    addresses: ips,
                    ttl: None,
                })
            }
            Err(e) => {
                tracing::debug!(hostname = %hostname, error = %e, "system DNS lookup failed");
                Err(e.to_string())
            }
        }
    }
}
