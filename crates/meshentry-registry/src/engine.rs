//! Resolution engine: turns admitted records into resolved views.
//!
//! Each record gets a [`ResolvedView`] carrying its compiled matcher, the
//! endpoint set it currently serves and a [`ResolutionState`]:
//!
//! - `NONE` records go straight to `PassThroughReady`.
//! - `STATIC` records go straight to `StaticReady` with the declared
//!   endpoints, port overrides applied.
//! - `DNS` records start in `DnsPending`, reach `DnsReady` once every name
//!   they depend on has resolved, and drop to `Degraded` when a name that
//!   had resolved starts failing. Degraded views keep serving the last
//!   addresses each name resolved to.
//!
//! The engine is owned by the writer pipeline. Views are immutable once
//! built; every change produces a new `Arc<ResolvedView>` with a fresh
//! version number.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use meshentry_state::validate::is_wildcard_host;
use meshentry_state::{Endpoint, EndpointAddress, RecordKey, Resolution, ServiceRecord};

use crate::dns::{CacheLookup, DnsCache, DnsUpdate};
use crate::error::DnsError;
use crate::matcher::RecordMatcher;

/// Per-record resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Unresolved,
    StaticReady,
    PassThroughReady,
    DnsPending,
    DnsReady,
    Degraded,
    Removed,
}

impl ResolutionState {
    /// Whether the view is serving a complete, healthy endpoint set.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            ResolutionState::StaticReady
                | ResolutionState::PassThroughReady
                | ResolutionState::DnsReady
        )
    }
}

/// One concrete backend after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEndpoint {
    pub address: EndpointAddress,
    /// Declared port number → effective port number.
    pub ports: BTreeMap<u16, u16>,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl ResolvedEndpoint {
    /// Resolve `address` against the record's ports, applying the
    /// declaring endpoint's overrides and attributes when there is one.
    pub fn new(record: &ServiceRecord, declared: Option<&Endpoint>, address: EndpointAddress) -> Self {
        let ports = record
            .ports
            .iter()
            .map(|p| (p.number, declared.map_or(p.number, |e| e.effective_port(p))))
            .collect();
        Self {
            address,
            ports,
            labels: declared.map(|e| e.labels.clone()).unwrap_or_default(),
            network: declared.and_then(|e| e.network.clone()),
            locality: declared.and_then(|e| e.locality.clone()),
            weight: declared.and_then(|e| e.weight),
        }
    }
}

/// What a record forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "endpoints", rename_all = "snake_case")]
pub enum EndpointSet {
    /// Forward to the connection's original destination.
    PassThrough,
    Endpoints(Vec<ResolvedEndpoint>),
}

impl EndpointSet {
    pub fn len(&self) -> usize {
        match self {
            EndpointSet::PassThrough => 0,
            EndpointSet::Endpoints(eps) => eps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Derived, immutable per-record view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedView {
    pub key: RecordKey,
    pub record: Arc<ServiceRecord>,
    pub matcher: RecordMatcher,
    pub endpoints: EndpointSet,
    pub state: ResolutionState,
    /// Endpoint set as of the most recent ready state.
    pub last_good: Option<EndpointSet>,
    pub last_error: Option<DnsError>,
    pub version: u64,
}

/// Resolution progress of one DNS name for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NameStatus {
    Pending,
    Resolved(Vec<IpAddr>),
    Failed {
        error: DnsError,
        last_good: Option<Vec<IpAddr>>,
    },
}

impl NameStatus {
    fn advance(&self, lookup: CacheLookup) -> Self {
        match lookup {
            CacheLookup::Resolved { addresses, .. } => NameStatus::Resolved(addresses),
            CacheLookup::Failed { error, last_good } => NameStatus::Failed {
                error,
                last_good: last_good.or_else(|| self.served().map(<[IpAddr]>::to_vec)),
            },
        }
    }

    /// Addresses to serve for this name: current, else last good.
    fn served(&self) -> Option<&[IpAddr]> {
        match self {
            NameStatus::Resolved(addrs) => Some(addrs),
            NameStatus::Failed {
                last_good: Some(addrs),
                ..
            } => Some(addrs),
            _ => None,
        }
    }
}

struct Computed {
    endpoints: EndpointSet,
    state: ResolutionState,
    error: Option<DnsError>,
}

/// Owns every resolved view and the DNS names they depend on.
pub struct ResolutionEngine {
    cache: DnsCache,
    views: BTreeMap<RecordKey, Arc<ResolvedView>>,
    names: HashMap<RecordKey, BTreeMap<String, NameStatus>>,
    /// hostname → records depending on it.
    host_refs: HashMap<String, BTreeSet<RecordKey>>,
    version: u64,
}

impl ResolutionEngine {
    pub fn new(cache: DnsCache) -> Self {
        Self {
            cache,
            views: BTreeMap::new(),
            names: HashMap::new(),
            host_refs: HashMap::new(),
            version: 0,
        }
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// (Re)compute the view for an admitted record.
    pub fn upsert(&mut self, record: ServiceRecord) -> Arc<ResolvedView> {
        let key = record.table_key();
        let wanted = match record.resolution {
            Resolution::Dns => dns_names(&record),
            Resolution::None | Resolution::Static => BTreeSet::new(),
        };
        self.retarget(&key, &wanted);

        let statuses: BTreeMap<String, NameStatus> = wanted
            .into_iter()
            .map(|name| {
                let status = match self.cache.peek(&name) {
                    Some(lookup) => NameStatus::Pending.advance(lookup),
                    None => NameStatus::Pending,
                };
                (name, status)
            })
            .collect();

        let computed = compute(&record, &statuses);
        if statuses.is_empty() {
            self.names.remove(&key);
        } else {
            self.names.insert(key.clone(), statuses);
        }

        let previous = self.views.get(&key).cloned();
        let view = ResolvedView {
            key: key.clone(),
            matcher: RecordMatcher::build(&record),
            record: Arc::new(record),
            last_good: last_good(previous.as_deref(), &computed),
            endpoints: computed.endpoints,
            state: computed.state,
            last_error: computed.error,
            version: self.next_version(),
        };
        log_transition(
            &key,
            previous.map_or(ResolutionState::Unresolved, |v| v.state),
            &view,
        );

        let view = Arc::new(view);
        self.views.insert(key, Arc::clone(&view));
        view
    }

    /// Drop a record's view and release its DNS names. Results still in
    /// flight for those names are ignored from here on.
    pub fn remove(&mut self, key: &str) -> Option<ResolvedView> {
        let view = self.views.remove(key)?;
        self.retarget(key, &BTreeSet::new());
        self.names.remove(key);

        let mut removed = Arc::unwrap_or_clone(view);
        let from = removed.state;
        removed.state = ResolutionState::Removed;
        log_transition(key, from, &removed);
        Some(removed)
    }

    /// Apply a DNS refresh result. Returns `true` if any view changed.
    pub fn apply_dns(&mut self, update: DnsUpdate) -> bool {
        let name = update.hostname.to_ascii_lowercase();
        let Some(keys) = self.host_refs.get(&name) else {
            debug!(host = %name, "dropping dns update for unreferenced host");
            return false;
        };
        let keys: Vec<RecordKey> = keys.iter().cloned().collect();

        let mut changed = false;
        for key in keys {
            let Some(statuses) = self.names.get_mut(&key) else {
                continue;
            };
            let Some(status) = statuses.get_mut(&name) else {
                continue;
            };
            *status = status.advance(update.lookup.clone());

            let Some(previous) = self.views.get(&key).cloned() else {
                continue;
            };
            let computed = compute(&previous.record, statuses);
            if computed.endpoints == previous.endpoints
                && computed.state == previous.state
                && computed.error == previous.last_error
            {
                continue;
            }

            let view = ResolvedView {
                last_good: last_good(Some(&previous), &computed),
                endpoints: computed.endpoints,
                state: computed.state,
                last_error: computed.error,
                version: self.next_version(),
                ..(*previous).clone()
            };
            log_transition(&key, previous.state, &view);
            self.views.insert(key, Arc::new(view));
            changed = true;
        }
        changed
    }

    /// Point a record at a new set of DNS names, watching names that gain
    /// their first reference and unwatching names that lose their last.
    fn retarget(&mut self, key: &str, wanted: &BTreeSet<String>) {
        let current: BTreeSet<String> = self
            .names
            .get(key)
            .map(|statuses| statuses.keys().cloned().collect())
            .unwrap_or_default();

        for name in current.difference(wanted) {
            if let Some(refs) = self.host_refs.get_mut(name) {
                refs.remove(key);
                if refs.is_empty() {
                    self.host_refs.remove(name);
                    self.cache.unwatch(name);
                }
            }
        }

        for name in wanted.difference(&current) {
            let refs = self.host_refs.entry(name.clone()).or_default();
            if refs.is_empty() {
                self.cache.watch(name);
            }
            refs.insert(key.to_string());
        }
    }

    pub fn view(&self, key: &str) -> Option<&Arc<ResolvedView>> {
        self.views.get(key)
    }

    /// All views, ordered by key.
    pub fn views(&self) -> impl Iterator<Item = &Arc<ResolvedView>> {
        self.views.values()
    }

    /// Hostnames with at least one dependent record.
    pub fn watched_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.host_refs.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }
}

/// Distinct DNS names a DNS-mode record depends on: its hostname
/// endpoints, or its non-wildcard hosts when it declares no endpoints.
fn dns_names(record: &ServiceRecord) -> BTreeSet<String> {
    if record.endpoints.is_empty() {
        return record
            .hosts
            .iter()
            .filter(|h| !is_wildcard_host(h))
            .map(|h| normalize_name(h))
            .collect();
    }
    record
        .endpoints
        .iter()
        .filter_map(|e| match EndpointAddress::parse(&e.address) {
            Some(EndpointAddress::Hostname(name)) => Some(normalize_name(&name)),
            _ => None,
        })
        .collect()
}

fn normalize_name(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn compute(record: &ServiceRecord, statuses: &BTreeMap<String, NameStatus>) -> Computed {
    match record.resolution {
        Resolution::None => Computed {
            endpoints: EndpointSet::PassThrough,
            state: ResolutionState::PassThroughReady,
            error: None,
        },
        Resolution::Static => Computed {
            endpoints: EndpointSet::Endpoints(
                record
                    .endpoints
                    .iter()
                    .filter_map(|e| {
                        EndpointAddress::parse(&e.address)
                            .map(|addr| ResolvedEndpoint::new(record, Some(e), addr))
                    })
                    .collect(),
            ),
            state: ResolutionState::StaticReady,
            error: None,
        },
        Resolution::Dns => compute_dns(record, statuses),
    }
}

fn compute_dns(record: &ServiceRecord, statuses: &BTreeMap<String, NameStatus>) -> Computed {
    let served = |name: &str| -> Vec<IpAddr> {
        statuses
            .get(&normalize_name(name))
            .and_then(NameStatus::served)
            .map(<[IpAddr]>::to_vec)
            .unwrap_or_default()
    };

    let mut endpoints = Vec::new();
    let mut unresolvable = None;
    if record.endpoints.is_empty() {
        for host in &record.hosts {
            if is_wildcard_host(host) {
                unresolvable.get_or_insert_with(|| DnsError::UnresolvableHost(host.clone()));
                continue;
            }
            endpoints.extend(
                served(host)
                    .into_iter()
                    .map(|ip| ResolvedEndpoint::new(record, None, EndpointAddress::Ip(ip))),
            );
        }
    } else {
        for declared in &record.endpoints {
            match EndpointAddress::parse(&declared.address) {
                Some(EndpointAddress::Hostname(name)) => endpoints.extend(
                    served(&name)
                        .into_iter()
                        .map(|ip| ResolvedEndpoint::new(record, Some(declared), EndpointAddress::Ip(ip))),
                ),
                Some(addr) => endpoints.push(ResolvedEndpoint::new(record, Some(declared), addr)),
                None => {}
            }
        }
    }

    let first_failure = statuses.values().find_map(|s| match s {
        NameStatus::Failed { error, .. } => Some(error.clone()),
        _ => None,
    });
    let degraded = statuses.values().find_map(|s| match s {
        NameStatus::Failed {
            error,
            last_good: Some(_),
        } => Some(error.clone()),
        _ => None,
    });
    let waiting = statuses.values().any(|s| s.served().is_none());

    let (state, error) = if let Some(error) = unresolvable {
        (ResolutionState::Degraded, Some(error))
    } else if let Some(error) = degraded {
        (ResolutionState::Degraded, Some(error))
    } else if waiting {
        (ResolutionState::DnsPending, first_failure)
    } else {
        (ResolutionState::DnsReady, None)
    };

    Computed {
        endpoints: EndpointSet::Endpoints(endpoints),
        state,
        error,
    }
}

fn last_good(previous: Option<&ResolvedView>, computed: &Computed) -> Option<EndpointSet> {
    if computed.state.is_ready() {
        Some(computed.endpoints.clone())
    } else {
        previous.and_then(|v| v.last_good.clone())
    }
}

fn log_transition(key: &str, from: ResolutionState, view: &ResolvedView) {
    match (&view.last_error, view.state) {
        (Some(error), ResolutionState::Degraded) => warn!(
            record = %key,
            from = ?from,
            state = ?view.state,
            error = %error,
            serving = view.endpoints.len(),
            "record degraded"
        ),
        _ if from != view.state => info!(
            record = %key,
            from = ?from,
            state = ?view.state,
            endpoints = view.endpoints.len(),
            version = view.version,
            "record state changed"
        ),
        _ => debug!(
            record = %key,
            state = ?view.state,
            endpoints = view.endpoints.len(),
            version = view.version,
            "record view updated"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsConfig;
    use crate::dns::{DnsAnswer, Resolve};
    use async_trait::async_trait;
    use meshentry_state::{Location, Protocol, ServicePort};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Resolver that never answers; updates are injected by hand.
    struct Silent;

    #[async_trait]
    impl Resolve for Silent {
        async fn lookup(&self, _hostname: &str) -> Result<DnsAnswer, String> {
            std::future::pending().await
        }
    }

    fn engine() -> ResolutionEngine {
        let (tx, _rx) = mpsc::unbounded_channel();
        ResolutionEngine::new(DnsCache::new(DnsConfig::default(), Arc::new(Silent), tx))
    }

    fn record(name: &str, resolution: Resolution, endpoints: &[&str]) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            namespace: "default".to_string(),
            hosts: vec![format!("{name}.example.com")],
            addresses: vec![],
            ports: vec![ServicePort {
                number: 443,
                name: "https".to_string(),
                protocol: Protocol::Https,
            }],
            location: Location::MeshExternal,
            resolution,
            endpoints: endpoints.iter().map(|a| Endpoint::new(*a)).collect(),
        }
    }

    fn resolved(host: &str, ips: &[&str]) -> DnsUpdate {
        DnsUpdate {
            hostname: host.to_string(),
            lookup: CacheLookup::Resolved {
                addresses: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
                ttl: Duration::from_secs(30),
            },
        }
    }

    fn failed(host: &str) -> DnsUpdate {
        DnsUpdate {
            hostname: host.to_string(),
            lookup: CacheLookup::Failed {
                error: DnsError::ResolutionFailed {
                    host: host.to_string(),
                    reason: "SERVFAIL".to_string(),
                },
                last_good: None,
            },
        }
    }

    fn addresses(set: &EndpointSet) -> Vec<String> {
        match set {
            EndpointSet::PassThrough => vec![],
            EndpointSet::Endpoints(eps) => eps.iter().map(|e| e.address.to_string()).collect(),
        }
    }

    // ── Static and pass-through ──────────────────────────────────────

    #[tokio::test]
    async fn none_resolution_is_pass_through() {
        let mut engine = engine();
        let view = engine.upsert(record("a", Resolution::None, &[]));
        assert_eq!(view.state, ResolutionState::PassThroughReady);
        assert_eq!(view.endpoints, EndpointSet::PassThrough);
    }

    #[tokio::test]
    async fn static_applies_port_overrides() {
        let mut engine = engine();
        let mut rec = record("a", Resolution::Static, &["2.2.2.2", "3.3.3.3"]);
        rec.endpoints[1].port_overrides.insert("https".to_string(), 8443);
        rec.endpoints[1].labels.insert("zone".to_string(), "b".to_string());

        let view = engine.upsert(rec);
        assert_eq!(view.state, ResolutionState::StaticReady);
        let EndpointSet::Endpoints(eps) = &view.endpoints else {
            panic!("expected endpoints");
        };
        assert_eq!(eps[0].ports[&443], 443);
        assert_eq!(eps[1].ports[&443], 8443);
        assert_eq!(eps[1].labels["zone"], "b");
        assert_eq!(view.last_good.as_ref(), Some(&view.endpoints));
    }

    #[tokio::test]
    async fn versions_increase_on_every_change() {
        let mut engine = engine();
        let v1 = engine.upsert(record("a", Resolution::None, &[])).version;
        let v2 = engine.upsert(record("b", Resolution::None, &[])).version;
        let v3 = engine.upsert(record("a", Resolution::None, &[])).version;
        assert!(v1 < v2 && v2 < v3);
    }

    // ── DNS lifecycle ────────────────────────────────────────────────

    #[tokio::test]
    async fn dns_pending_until_all_names_resolve() {
        let mut engine = engine();
        let view = engine.upsert(record("a", Resolution::Dns, &["one.example", "two.example"]));
        assert_eq!(view.state, ResolutionState::DnsPending);
        assert!(view.endpoints.is_empty());

        assert!(engine.apply_dns(resolved("one.example", &["10.0.0.1"])));
        assert_eq!(engine.view("default/a").unwrap().state, ResolutionState::DnsPending);

        assert!(engine.apply_dns(resolved("two.example", &["10.0.0.2", "10.0.0.3"])));
        let view = engine.view("default/a").unwrap();
        assert_eq!(view.state, ResolutionState::DnsReady);
        assert_eq!(addresses(&view.endpoints), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn first_failure_stays_pending() {
        let mut engine = engine();
        engine.upsert(record("a", Resolution::Dns, &["one.example"]));
        engine.apply_dns(failed("one.example"));
        let view = engine.view("default/a").unwrap();
        assert_eq!(view.state, ResolutionState::DnsPending);
        assert!(view.last_error.is_some());
    }

    #[tokio::test]
    async fn failure_after_success_degrades_and_recovers() {
        let mut engine = engine();
        engine.upsert(record("a", Resolution::Dns, &["one.example"]));
        engine.apply_dns(resolved("one.example", &["10.0.0.1"]));

        assert!(engine.apply_dns(failed("one.example")));
        let view = engine.view("default/a").unwrap().clone();
        assert_eq!(view.state, ResolutionState::Degraded);
        assert_eq!(addresses(&view.endpoints), vec!["10.0.0.1"]);
        assert_eq!(view.last_good.as_ref(), Some(&view.endpoints));

        assert!(engine.apply_dns(resolved("one.example", &["10.0.0.9"])));
        let view = engine.view("default/a").unwrap();
        assert_eq!(view.state, ResolutionState::DnsReady);
        assert_eq!(addresses(&view.endpoints), vec!["10.0.0.9"]);
        assert!(view.last_error.is_none());
    }

    #[tokio::test]
    async fn hosts_are_resolved_when_no_endpoints() {
        let mut engine = engine();
        engine.upsert(record("api", Resolution::Dns, &[]));
        assert_eq!(engine.watched_hosts(), vec!["api.example.com"]);

        engine.apply_dns(resolved("api.example.com", &["10.1.1.1"]));
        let view = engine.view("default/api").unwrap();
        assert_eq!(view.state, ResolutionState::DnsReady);
        assert_eq!(addresses(&view.endpoints), vec!["10.1.1.1"]);
    }

    #[tokio::test]
    async fn wildcard_host_is_permanently_degraded() {
        let mut engine = engine();
        let mut rec = record("wild", Resolution::Dns, &[]);
        rec.hosts = vec!["*.bar.com".to_string()];
        let view = engine.upsert(rec);
        assert_eq!(view.state, ResolutionState::Degraded);
        assert_eq!(
            view.last_error,
            Some(DnsError::UnresolvableHost("*.bar.com".to_string()))
        );
        assert!(engine.watched_hosts().is_empty());
    }

    #[tokio::test]
    async fn ip_only_dns_record_is_ready() {
        let mut engine = engine();
        let view = engine.upsert(record("a", Resolution::Dns, &["10.0.0.1"]));
        assert_eq!(view.state, ResolutionState::DnsReady);
    }

    // ── Host references ──────────────────────────────────────────────

    #[tokio::test]
    async fn shared_names_are_watched_once_and_released_last() {
        let mut engine = engine();
        engine.upsert(record("a", Resolution::Dns, &["shared.example"]));
        engine.upsert(record("b", Resolution::Dns, &["shared.example"]));
        assert!(engine.cache().is_watching("shared.example"));

        engine.remove("default/a");
        assert!(engine.cache().is_watching("shared.example"));

        let removed = engine.remove("default/b").unwrap();
        assert_eq!(removed.state, ResolutionState::Removed);
        assert!(!engine.cache().is_watching("shared.example"));
    }

    #[tokio::test]
    async fn update_after_delete_is_dropped() {
        let mut engine = engine();
        engine.upsert(record("a", Resolution::Dns, &["gone.example"]));
        engine.remove("default/a");
        assert!(!engine.apply_dns(resolved("gone.example", &["10.0.0.1"])));
        assert!(engine.view("default/a").is_none());
    }

    #[tokio::test]
    async fn replacing_record_moves_watches() {
        let mut engine = engine();
        engine.upsert(record("a", Resolution::Dns, &["old.example"]));
        engine.upsert(record("a", Resolution::Dns, &["new.example"]));
        assert_eq!(engine.watched_hosts(), vec!["new.example"]);
        assert!(!engine.apply_dns(resolved("old.example", &["10.0.0.1"])));
    }

    #[tokio::test]
    async fn unchanged_refresh_does_not_bump_version() {
        let mut engine = engine();
        engine.upsert(record("a", Resolution::Dns, &["one.example"]));
        assert!(engine.apply_dns(resolved("one.example", &["10.0.0.1"])));
        let version = engine.view("default/a").unwrap().version;
        assert!(!engine.apply_dns(resolved("one.example", &["10.0.0.1"])));
        assert_eq!(engine.view("default/a").unwrap().version, version);
    }
}
