//! Admission checks run on every `Put`.
//!
//! [`validate_record`] covers the per-record structural invariants;
//! [`check_conflicts`] covers address-based identification, which must be
//! unique across the full proposed record set.

use std::collections::HashSet;
use std::fmt;

use ipnet::IpNet;

use crate::error::{StateError, StateResult};
use crate::types::*;

/// Parse a record address (`10.0.0.1`, `10.0.0.0/24`, `fd00::/64`).
///
/// Single IPs become host-length networks; CIDRs are truncated to their
/// network address so `192.192.192.192/24` and `192.192.192.0/24` claim
/// the same block.
pub fn parse_address(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Some(net.trunc());
    }
    raw.parse::<std::net::IpAddr>().ok().map(IpNet::from)
}

/// Whether a host pattern is a leading wildcard (`*.suffix`).
pub fn is_wildcard_host(host: &str) -> bool {
    host.starts_with("*.")
}

// ── Per-record invariants ─────────────────────────────────────────

/// Validate the structural invariants of a single record.
pub fn validate_record(record: &ServiceRecord) -> StateResult<()> {
    let key = record.table_key();

    if record.name.trim().is_empty() || record.name.contains('/') {
        return Err(StateError::invalid(&key, "name must be non-empty and must not contain '/'"));
    }
    if record.namespace.trim().is_empty() || record.namespace.contains('/') {
        return Err(StateError::invalid(
            &key,
            "namespace must be non-empty and must not contain '/'",
        ));
    }

    validate_hosts(&key, record)?;

    for address in &record.addresses {
        if parse_address(address).is_none() {
            return Err(StateError::invalid(
                &key,
                format!("address {address:?} is neither an IP nor a CIDR block"),
            ));
        }
    }

    validate_ports(&key, record)?;
    validate_endpoints(&key, record)?;
    Ok(())
}

fn validate_hosts(key: &str, record: &ServiceRecord) -> StateResult<()> {
    if record.hosts.is_empty() {
        return Err(StateError::invalid(key, "at least one host is required"));
    }

    for host in &record.hosts {
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(StateError::invalid(key, format!("malformed host {host:?}")));
        }
        if host.contains('*') {
            let suffix = host.strip_prefix("*.").unwrap_or_default();
            if suffix.is_empty() || suffix.contains('*') || suffix.starts_with('.') {
                return Err(StateError::invalid(
                    key,
                    format!("host {host:?}: wildcards must have the form *.suffix"),
                ));
            }
            match record.location {
                Location::MeshExternal => {}
                Location::MeshInternal => {
                    return Err(StateError::invalid(
                        key,
                        format!("wildcard host {host:?} requires MESH_EXTERNAL location"),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_ports(key: &str, record: &ServiceRecord) -> StateResult<()> {
    if record.ports.is_empty() {
        return Err(StateError::invalid(key, "at least one port is required"));
    }

    let mut names = HashSet::new();
    let mut numbers = HashSet::new();
    for port in &record.ports {
        if port.number == 0 {
            return Err(StateError::invalid(key, format!("port {:?} has number 0", port.name)));
        }
        if port.name.trim().is_empty() {
            return Err(StateError::invalid(key, format!("port {} has no name", port.number)));
        }
        if !names.insert(port.name.as_str()) {
            return Err(StateError::invalid(key, format!("duplicate port name {:?}", port.name)));
        }
        if !numbers.insert(port.number) {
            return Err(StateError::invalid(key, format!("duplicate port number {}", port.number)));
        }
    }
    Ok(())
}

fn validate_endpoints(key: &str, record: &ServiceRecord) -> StateResult<()> {
    if record.resolution == Resolution::None && !record.endpoints.is_empty() {
        return Err(StateError::invalid(key, "endpoints are not allowed with resolution NONE"));
    }

    for endpoint in &record.endpoints {
        let Some(address) = EndpointAddress::parse(&endpoint.address) else {
            return Err(StateError::invalid(
                key,
                format!("malformed endpoint address {:?}", endpoint.address),
            ));
        };

        match (&address, record.resolution) {
            (EndpointAddress::Ip(_), _) => {}
            (EndpointAddress::Hostname(host), Resolution::Dns) => {
                if host.contains('*') || host.contains('/') || host.chars().any(char::is_whitespace) {
                    return Err(StateError::invalid(
                        key,
                        format!("endpoint address {host:?} is not a resolvable name"),
                    ));
                }
            }
            (EndpointAddress::Hostname(host), _) => {
                return Err(StateError::invalid(
                    key,
                    format!("endpoint address {host:?} is a DNS name; requires resolution DNS"),
                ));
            }
            (EndpointAddress::Unix(_), Resolution::Static) => {
                if record.ports.len() != 1 {
                    return Err(StateError::invalid(
                        key,
                        "socket-path endpoints require exactly one declared port",
                    ));
                }
            }
            (EndpointAddress::Unix(_), _) => {
                return Err(StateError::invalid(
                    key,
                    "socket-path endpoints require resolution STATIC",
                ));
            }
        }

        for (name, number) in &endpoint.port_overrides {
            if !record.ports.iter().any(|p| &p.name == name) {
                return Err(StateError::invalid(
                    key,
                    format!("endpoint {} overrides undeclared port {name:?}", endpoint.address),
                ));
            }
            if *number == 0 {
                return Err(StateError::invalid(
                    key,
                    format!("endpoint {} overrides port {name:?} with 0", endpoint.address),
                ));
            }
        }
    }
    Ok(())
}

// ── Address claims ────────────────────────────────────────────────

/// The address side of an identification claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimAddress {
    /// A declared virtual IP or CIDR block.
    Net(IpNet),
    /// Any destination: an address-less record claiming a port outright.
    Any,
}

impl fmt::Display for ClaimAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimAddress::Net(net) => write!(f, "{net}"),
            ClaimAddress::Any => f.write_str("*"),
        }
    }
}

/// An `(address, port)` pair a record identifies traffic by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressClaim {
    pub address: ClaimAddress,
    pub port: u16,
}

/// Enumerate the address claims of a record.
///
/// Records with addresses claim every `(address, port)` pair. Address-less
/// records claim `(*, port)` only for ports that cannot be identified by
/// host name; host-identified ports carry no address claim.
pub fn address_claims(record: &ServiceRecord) -> Vec<AddressClaim> {
    let nets: Vec<IpNet> = record
        .addresses
        .iter()
        .filter_map(|a| parse_address(a))
        .collect();

    let mut claims = Vec::new();
    for port in &record.ports {
        if nets.is_empty() {
            if !port.protocol.is_host_identified() {
                claims.push(AddressClaim {
                    address: ClaimAddress::Any,
                    port: port.number,
                });
            }
            continue;
        }
        for net in &nets {
            claims.push(AddressClaim {
                address: ClaimAddress::Net(*net),
                port: port.number,
            });
        }
    }
    claims
}

/// Reject `record` if any of its address claims is already held by
/// another record in `others`. Records sharing `record`'s key are skipped
/// (they are about to be replaced).
pub fn check_conflicts<'a>(
    record: &ServiceRecord,
    others: impl IntoIterator<Item = &'a ServiceRecord>,
) -> StateResult<()> {
    let key = record.table_key();
    let claims: HashSet<AddressClaim> = address_claims(record).into_iter().collect();
    if claims.is_empty() {
        return Ok(());
    }

    for other in others {
        let other_key = other.table_key();
        if other_key == key {
            continue;
        }
        if let Some(claim) = address_claims(other).into_iter().find(|c| claims.contains(c)) {
            return Err(StateError::AddressConflict {
                address: claim.address.to_string(),
                port: claim.port,
                existing: other_key,
            });
        }
    }
    Ok(())
}
