//! Host and address matchers compiled per record.
//!
//! Host patterns are either exact names or leading wildcards. A wildcard
//! `*.bar.com` matches any name ending in `.bar.com` with at least one
//! label in front of it (`api.bar.com`, `x.y.bar.com`) but never the bare
//! suffix `bar.com`. Addresses are single IPs or CIDR blocks.

use std::net::IpAddr;

use ipnet::IpNet;

use meshentry_state::{ServiceRecord, parse_address};

/// A compiled host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Exact(String),
    /// Stored with its leading dot: `*.bar.com` → `.bar.com`.
    Wildcard(String),
}

impl HostPattern {
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        match lowered.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => HostPattern::Wildcard(suffix.to_string()),
            _ => HostPattern::Exact(lowered),
        }
    }

    /// Match a normalized (lowercase, no port, no trailing dot) host.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(name) => name == host,
            HostPattern::Wildcard(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }

    /// Ranking used when several patterns match: exact names beat any
    /// wildcard, longer wildcard suffixes beat shorter ones.
    pub fn specificity(&self) -> usize {
        match self {
            HostPattern::Exact(_) => usize::MAX,
            HostPattern::Wildcard(suffix) => suffix.len(),
        }
    }
}

/// Normalize an inbound host header: strip any `:port` suffix and a
/// trailing dot, lowercase the rest.
pub fn normalize_host(header: &str) -> String {
    let header = header.trim();
    let host = match header.rsplit_once(':') {
        // Bracketed IPv6 literal, with or without a port.
        _ if header.starts_with('[') => header
            .split_once(']')
            .map(|(h, _)| h.trim_start_matches('['))
            .unwrap_or(header),
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => header,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Per-record matcher over hosts and addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMatcher {
    hosts: Vec<HostPattern>,
    addresses: Vec<IpNet>,
}

impl RecordMatcher {
    /// Compile the matcher for an admitted record.
    pub fn build(record: &ServiceRecord) -> Self {
        Self {
            hosts: record.hosts.iter().map(|h| HostPattern::parse(h)).collect(),
            addresses: record
                .addresses
                .iter()
                .filter_map(|a| parse_address(a))
                .collect(),
        }
    }

    pub fn addresses(&self) -> &[IpNet] {
        &self.addresses
    }

    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// Best-ranked pattern matching `host`, if any.
    pub fn match_host(&self, host: &str) -> Option<&HostPattern> {
        self.hosts
            .iter()
            .filter(|p| p.matches(host))
            .max_by_key(|p| p.specificity())
    }

    /// Most specific declared network containing `ip`, if any.
    pub fn match_address(&self, ip: IpAddr) -> Option<&IpNet> {
        self.addresses
            .iter()
            .filter(|net| net.contains(&ip))
            .max_by_key(|net| net.prefix_len())
    }
}
