//! Immutable, versioned registry snapshots and the query API.
//!
//! A [`Snapshot`] bundles every [`ResolvedView`] with per-port lookup
//! indexes. It is built once by the writer and never touched again;
//! readers hold an `Arc<Snapshot>` for the duration of a query.
//!
//! Matching policy:
//! - Records declaring `addresses` are identified by destination address
//!   on each of their ports. The most specific network wins.
//! - Address-less records are identified by host on host-identified ports
//!   (HTTP family, TLS) and by port alone on every other port. A record
//!   declaring `addresses` is never identified by host alone.
//! - Among host matches, an exact name beats any wildcard, a longer
//!   wildcard suffix beats a shorter one, and ties go to the smaller
//!   record key.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::Serialize;

use meshentry_state::{EndpointAddress, RecordKey, ServicePort};

use crate::engine::{EndpointSet, ResolutionState, ResolvedView};
use crate::matcher::normalize_host;

/// One routable destination for a matched port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub address: EndpointAddress,
    pub port: u16,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Destination set returned by a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "destinations", rename_all = "snake_case")]
pub enum Destinations {
    /// Forward the connection unmodified.
    PassThrough,
    Endpoints(Vec<Destination>),
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteMatch {
    pub record: RecordKey,
    pub port: ServicePort,
    pub state: ResolutionState,
    pub version: u64,
    pub destinations: Destinations,
}

/// Resolution status of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordStatus {
    pub record: RecordKey,
    pub state: ResolutionState,
    pub version: u64,
    pub endpoints: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Immutable point-in-time registry.
#[derive(Debug, Default)]
pub struct Snapshot {
    version: u64,
    views: BTreeMap<RecordKey, Arc<ResolvedView>>,
    /// port → (network, record) for address-declaring records.
    by_address: HashMap<u16, Vec<(IpNet, RecordKey)>>,
    /// port → address-less record claiming the port outright.
    by_port: HashMap<u16, RecordKey>,
    /// port → address-less records declaring it as host-identified, in key order.
    by_host: HashMap<u16, Vec<RecordKey>>,
}

impl Snapshot {
    /// Assemble a snapshot from the engine's views.
    pub fn build<'a>(version: u64, views: impl IntoIterator<Item = &'a Arc<ResolvedView>>) -> Self {
        let mut snapshot = Snapshot {
            version,
            ..Default::default()
        };

        for view in views {
            let key = view.key.clone();
            for port in &view.record.ports {
                if view.matcher.has_addresses() {
                    let entries = snapshot.by_address.entry(port.number).or_default();
                    entries.extend(view.matcher.addresses().iter().map(|net| (*net, key.clone())));
                } else if port.protocol.is_host_identified() {
                    snapshot.by_host.entry(port.number).or_default().push(key.clone());
                } else {
                    snapshot.by_port.entry(port.number).or_insert_with(|| key.clone());
                }
            }
            snapshot.views.insert(key, Arc::clone(view));
        }

        for keys in snapshot.by_host.values_mut() {
            keys.sort();
            keys.dedup();
        }
        snapshot
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<ResolvedView>> {
        self.views.get(key)
    }

    /// Views ordered by record key.
    pub fn views(&self) -> impl Iterator<Item = &Arc<ResolvedView>> {
        self.views.values()
    }

    pub fn status(&self, key: &str) -> Option<RecordStatus> {
        self.views.get(key).map(|view| RecordStatus {
            record: view.key.clone(),
            state: view.state,
            version: view.version,
            endpoints: view.endpoints.len(),
            last_error: view.last_error.as_ref().map(ToString::to_string),
        })
    }

    /// Identify a connection by destination address and port: address
    /// claims first, then a port-only claim.
    pub fn lookup(&self, ip: IpAddr, port: u16) -> Option<RouteMatch> {
        self.address_candidates(ip, port)
            .first()
            .map(|(_, key)| *key)
            .or_else(|| self.by_port.get(&port))
            .and_then(|key| self.found(key, port))
    }

    /// Identify a request by host header among address-less records that
    /// declare `port` as host-identified.
    pub fn lookup_by_host(&self, host: &str, port: u16) -> Option<RouteMatch> {
        let host = normalize_host(host);
        let keys = self.by_host.get(&port)?;
        self.best_host_match(&host, keys.iter().map(String::as_str))
            .and_then(|key| self.found(key, port))
    }

    /// Identify a connection carrying both a destination address and,
    /// optionally, a host name.
    ///
    /// Address claims are evaluated first; among them, a record whose
    /// hosts match `host` is preferred. Without an address match,
    /// address-less records are matched by host on host-identified ports,
    /// then by port alone.
    pub fn lookup_connection(&self, ip: IpAddr, port: u16, host: Option<&str>) -> Option<RouteMatch> {
        let host = host.map(normalize_host);
        let candidates = self.address_candidates(ip, port);

        if !candidates.is_empty() {
            let preferred = host.as_deref().and_then(|h| {
                self.best_host_match(h, candidates.iter().map(|(_, key)| key.as_str()))
            });
            let key = preferred.or_else(|| candidates.first().map(|(_, key)| key.as_str()))?;
            return self.found(key, port);
        }

        if let Some(host) = host.as_deref()
            && let Some(keys) = self.by_host.get(&port)
            && let Some(key) = self.best_host_match(host, keys.iter().map(String::as_str))
        {
            return self.found(key, port);
        }

        self.by_port.get(&port).and_then(|key| self.found(key, port))
    }

    /// Address claims on `port` containing `ip`, most specific first.
    /// IPv4-mapped IPv6 addresses match as their IPv4 form.
    fn address_candidates(&self, ip: IpAddr, port: u16) -> Vec<(u8, &RecordKey)> {
        let ip = ip.to_canonical();
        let mut candidates: Vec<(u8, &RecordKey)> = self
            .by_address
            .get(&port)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(net, _)| net.contains(&ip))
                    .map(|(net, key)| (net.prefix_len(), key))
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        candidates.dedup_by(|a, b| a.1 == b.1);
        candidates
    }

    fn best_host_match<'a>(&self, host: &str, keys: impl Iterator<Item = &'a str>) -> Option<&'a str> {
        keys.filter_map(|key| {
            let view = self.views.get(key)?;
            let pattern = view.matcher.match_host(host)?;
            Some((pattern.specificity(), Reverse(key)))
        })
        .max()
        .map(|(_, Reverse(key))| key)
    }

    fn found(&self, key: &str, port: u16) -> Option<RouteMatch> {
        let view = self.views.get(key)?;
        let declared = view.record.port(port)?.clone();
        let destinations = match &view.endpoints {
            EndpointSet::PassThrough => Destinations::PassThrough,
            EndpointSet::Endpoints(endpoints) => Destinations::Endpoints(
                endpoints
                    .iter()
                    .map(|ep| Destination {
                        address: ep.address.clone(),
                        port: ep.ports.get(&port).copied().unwrap_or(port),
                        labels: ep.labels.clone(),
                        network: ep.network.clone(),
                        locality: ep.locality.clone(),
                        weight: ep.weight,
                    })
                    .collect(),
            ),
        };
        Some(RouteMatch {
            record: view.key.clone(),
            port: declared,
            state: view.state,
            version: view.version,
            destinations,
        })
    }
}
