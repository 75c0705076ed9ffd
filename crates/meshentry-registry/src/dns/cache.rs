//! DNS cache with TTL expiry, request coalescing, and background refresh.
//!
//! Each hostname has at most one outstanding resolution: concurrent
//! callers for the same name park on the in-flight lookup and all receive
//! its result. Successful answers are kept for a TTL clamped into the
//! configured bounds. A failed lookup keeps the last successful addresses
//! and hands them back alongside the error.
//!
//! Names the resolution engine depends on are *watched*: a refresh task
//! per name re-resolves on expiry (or after a capped backoff on failure)
//! and publishes every result as a [`DnsUpdate`] on the engine's channel.
//! Watched and in-flight entries are never evicted.
//!
//! Cache statistics (hits, misses, evictions) are emitted as tracing
//! fields.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::config::DnsConfig;
use crate::dns::refresh::{self, Backoff, RefreshSlot};
use crate::dns::{DnsAnswer, Resolve};
use crate::error::DnsError;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Fresh addresses and their remaining lifetime.
    Resolved { addresses: Vec<IpAddr>, ttl: Duration },
    /// The latest resolution failed; `last_good` is the most recent
    /// successful answer, if there ever was one.
    Failed {
        error: DnsError,
        last_good: Option<Vec<IpAddr>>,
    },
}

/// A refresh result for a watched hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsUpdate {
    pub hostname: String,
    pub lookup: CacheLookup,
}

struct CacheEntry {
    last_good: Option<Vec<IpAddr>>,
    fresh_until: Option<Instant>,
    last_error: Option<DnsError>,
    /// `Some` while a lookup is outstanding.
    waiters: Option<Vec<oneshot::Sender<CacheLookup>>>,
    last_accessed: Instant,
}

impl CacheEntry {
    fn new(now: Instant) -> Self {
        Self {
            last_good: None,
            fresh_until: None,
            last_error: None,
            waiters: None,
            last_accessed: now,
        }
    }

    fn fresh(&self, now: Instant) -> Option<CacheLookup> {
        match (&self.last_good, self.fresh_until) {
            (Some(addresses), Some(until)) if until > now => Some(CacheLookup::Resolved {
                addresses: addresses.clone(),
                ttl: until - now,
            }),
            _ => None,
        }
    }
}

#[derive(Default)]
struct CacheStats {
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    refreshers: HashMap<String, RefreshSlot>,
    stats: CacheStats,
}

struct Inner {
    resolver: Arc<dyn Resolve>,
    config: DnsConfig,
    state: Mutex<CacheState>,
    updates: mpsc::UnboundedSender<DnsUpdate>,
}

/// Shared DNS cache handle.
#[derive(Clone)]
pub struct DnsCache {
    inner: Arc<Inner>,
}

impl DnsCache {
    /// Create a cache resolving through `resolver` and publishing refresh
    /// results on `updates`.
    pub fn new(
        config: DnsConfig,
        resolver: Arc<dyn Resolve>,
        updates: mpsc::UnboundedSender<DnsUpdate>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                config,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    refreshers: HashMap::new(),
                    stats: CacheStats::default(),
                }),
                updates,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a hostname, answering from cache while fresh.
    ///
    /// On a miss the caller joins the in-flight lookup for the name or
    /// starts one. The lookup runs in its own task, so it completes (and
    /// populates the cache) even if every caller goes away.
    pub async fn resolve(&self, hostname: &str) -> CacheLookup {
        let key = hostname.to_ascii_lowercase();
        let (rx, start_lookup) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let now = Instant::now();

            if let Some(entry) = state.entries.get_mut(&key)
                && let Some(lookup) = entry.fresh(now)
            {
                entry.last_accessed = now;
                state.stats.hits += 1;
                debug!(
                    hostname = %key,
                    cache_hits = state.stats.hits,
                    cache_misses = state.stats.misses,
                    cache_evictions = state.stats.evictions,
                    "dns cache hit"
                );
                return lookup;
            }

            state.stats.misses += 1;
            if !state.entries.contains_key(&key)
                && state.entries.len() >= self.inner.config.max_entries
            {
                evict_lru(state);
            }

            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(now));
            entry.last_accessed = now;

            let (tx, rx) = oneshot::channel();
            let start_lookup = match entry.waiters.as_mut() {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    entry.waiters = Some(vec![tx]);
                    true
                }
            };
            debug!(
                hostname = %key,
                coalesced = !start_lookup,
                cache_hits = state.stats.hits,
                cache_misses = state.stats.misses,
                cache_evictions = state.stats.evictions,
                "dns cache miss"
            );
            (rx, start_lookup)
        };

        if start_lookup {
            self.spawn_lookup(key.clone());
        }

        rx.await.unwrap_or_else(|_| CacheLookup::Failed {
            error: DnsError::ResolutionFailed {
                host: key,
                reason: "lookup abandoned".to_string(),
            },
            last_good: None,
        })
    }

    fn spawn_lookup(&self, key: String) {
        let cache = self.clone();
        tokio::spawn(async move {
            let outcome = cache.inner.resolver.lookup(&key).await;
            cache.complete(&key, outcome);
        });
    }

    /// Record a lookup outcome and wake every waiter.
    fn complete(&self, key: &str, outcome: Result<DnsAnswer, String>) {
        let mut guard = self.lock();
        let now = Instant::now();
        let Some(entry) = guard.entries.get_mut(key) else {
            return;
        };

        let lookup = match outcome {
            Ok(answer) if !answer.addresses.is_empty() => {
                let ttl = self.inner.config.effective_ttl(answer.ttl);
                let mut addresses = answer.addresses;
                addresses.sort();
                addresses.dedup();
                entry.last_good = Some(addresses.clone());
                entry.fresh_until = Some(now + ttl);
                entry.last_error = None;
                debug!(hostname = %key, count = addresses.len(), ?ttl, "dns lookup succeeded");
                CacheLookup::Resolved { addresses, ttl }
            }
            Ok(_) => failed(entry, key, "no addresses returned".to_string()),
            Err(reason) => failed(entry, key, reason),
        };

        for waiter in entry.waiters.take().unwrap_or_default() {
            let _ = waiter.send(lookup.clone());
        }
    }

    /// Current cached view of a hostname without triggering a lookup:
    /// fresh addresses, the last failure (with last-good addresses), or
    /// stale addresses with a zero TTL. `None` if the name has never
    /// completed a lookup.
    pub fn peek(&self, hostname: &str) -> Option<CacheLookup> {
        let key = hostname.to_ascii_lowercase();
        let guard = self.lock();
        let entry = guard.entries.get(&key)?;
        if let Some(error) = &entry.last_error {
            return Some(CacheLookup::Failed {
                error: error.clone(),
                last_good: entry.last_good.clone(),
            });
        }
        entry.fresh(Instant::now()).or_else(|| {
            entry.last_good.clone().map(|addresses| CacheLookup::Resolved {
                addresses,
                ttl: Duration::ZERO,
            })
        })
    }

    /// Start background refresh for a hostname. Idempotent.
    pub fn watch(&self, hostname: &str) {
        let key = hostname.to_ascii_lowercase();
        let mut guard = self.lock();
        if guard.refreshers.contains_key(&key) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(refresh::run_refresh_loop(
            self.clone(),
            key.clone(),
            shutdown_rx,
        ));
        debug!(hostname = %key, "dns refresh started");
        guard.refreshers.insert(key, RefreshSlot::new(handle, shutdown_tx));
    }

    /// Stop background refresh for a hostname. A lookup already in flight
    /// still completes into the cache, but nothing is published for it.
    pub fn unwatch(&self, hostname: &str) {
        let key = hostname.to_ascii_lowercase();
        let slot = self.lock().refreshers.remove(&key);
        if let Some(slot) = slot {
            slot.stop();
            debug!(hostname = %key, "dns refresh stopped");
        }
    }

    pub fn is_watching(&self, hostname: &str) -> bool {
        self.lock()
            .refreshers
            .contains_key(&hostname.to_ascii_lowercase())
    }

    /// Stop every refresh task.
    pub fn shutdown(&self) {
        let slots: Vec<RefreshSlot> = self.lock().refreshers.drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.stop();
        }
    }

    pub(crate) fn publish(&self, update: DnsUpdate) {
        // The receiver is gone only once the registry has shut down.
        let _ = self.inner.updates.send(update);
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(
            self.inner.config.backoff_initial(),
            self.inner.config.backoff_max(),
        )
    }

    /// Cache statistics: `(hits, misses, evictions)`.
    pub fn stats(&self) -> (u64, u64, u64) {
        let guard = self.lock();
        (guard.stats.hits, guard.stats.misses, guard.stats.evictions)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

fn failed(entry: &mut CacheEntry, key: &str, reason: String) -> CacheLookup {
    let error = DnsError::ResolutionFailed {
        host: key.to_string(),
        reason,
    };
    entry.fresh_until = None;
    entry.last_error = Some(error.clone());
    debug!(
        hostname = %key,
        error = %error,
        has_last_good = entry.last_good.is_some(),
        "dns lookup failed"
    );
    CacheLookup::Failed {
        error,
        last_good: entry.last_good.clone(),
    }
}

/// Evict the least-recently-used entry that is neither watched nor in
/// flight. Does nothing when every entry is pinned.
fn evict_lru(state: &mut CacheState) {
    let lru_key = state
        .entries
        .iter()
        .filter(|(key, entry)| entry.waiters.is_none() && !state.refreshers.contains_key(*key))
        .min_by_key(|(_, entry)| entry.last_accessed)
        .map(|(key, _)| key.clone());

    if let Some(key) = lru_key {
        state.entries.remove(&key);
        state.stats.evictions += 1;
        debug!(
            evicted_hostname = %key,
            cache_evictions = state.stats.evictions,
            "dns cache LRU eviction"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use crate::config::TTL_FLOOR;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolver that answers from a mutable table after a fixed delay and
    /// counts calls per hostname.
    #[derive(Default)]
    struct TableResolver {
        answers: Mutex<HashMap<String, Result<DnsAnswer, String>>>,
        calls: AtomicUsize,
    }

    impl TableResolver {
        fn set(&self, host: &str, answer: Result<Vec<IpAddr>, &str>, ttl: Option<Duration>) {
            let answer = answer
                .map(|addresses| DnsAnswer { addresses, ttl })
                .map_err(str::to_string);
            self.answers.lock().unwrap().insert(host.to_string(), answer);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolve for TableResolver {
        async fn lookup(&self, hostname: &str) -> Result<DnsAnswer, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.answers
                .lock()
                .unwrap()
                .get(hostname)
                .cloned()
                .unwrap_or_else(|| Err("NXDOMAIN".to_string()))
        }
    }

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    fn cache_with(
        resolver: Arc<TableResolver>,
        config: DnsConfig,
    ) -> (DnsCache, mpsc::UnboundedReceiver<DnsUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DnsCache::new(config, resolver, tx), rx)
    }

    // ── Lookup and TTL ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn miss_then_hit() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(2), ip(1)]), Some(Duration::from_secs(60)));
        let (cache, _rx) = cache_with(resolver.clone(), DnsConfig::default());

        let first = cache.resolve("API.example").await;
        assert_eq!(
            first,
            CacheLookup::Resolved {
                addresses: vec![ip(1), ip(2)],
                ttl: Duration::from_secs(60)
            }
        );

        let second = cache.resolve("api.example").await;
        assert!(matches!(second, CacheLookup::Resolved { .. }));
        assert_eq!(resolver.calls(), 1);
        assert_eq!(cache.stats(), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_clamped_to_bounds() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("short.example", Ok(vec![ip(1)]), Some(Duration::from_secs(1)));
        let (cache, _rx) = cache_with(resolver, DnsConfig::default());

        match cache.resolve("short.example").await {
            CacheLookup::Resolved { ttl, .. } => assert_eq!(ttl, Duration::from_secs(5)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_re_resolved() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(1)]), Some(Duration::from_secs(10)));
        let (cache, _rx) = cache_with(resolver.clone(), DnsConfig::default());

        cache.resolve("api.example").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        resolver.set("api.example", Ok(vec![ip(9)]), Some(Duration::from_secs(10)));

        match cache.resolve("api.example").await {
            CacheLookup::Resolved { addresses, .. } => assert_eq!(addresses, vec![ip(9)]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(resolver.calls(), 2);
    }

    // ── Coalescing ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_lookup() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(1)]), None);
        let (cache, _rx) = cache_with(resolver.clone(), DnsConfig::default());

        let (a, b, c) = tokio::join!(
            cache.resolve("api.example"),
            cache.resolve("api.example"),
            cache.resolve("API.EXAMPLE"),
        );

        assert_eq!(resolver.calls(), 1);
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    // ── Failure handling ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_last_good() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(1)]), Some(Duration::from_secs(5)));
        let (cache, _rx) = cache_with(resolver.clone(), DnsConfig::default());

        cache.resolve("api.example").await;
        tokio::time::advance(Duration::from_secs(6)).await;
        resolver.set("api.example", Err("SERVFAIL"), None);

        match cache.resolve("api.example").await {
            CacheLookup::Failed { error, last_good } => {
                assert_eq!(last_good, Some(vec![ip(1)]));
                assert!(error.to_string().contains("SERVFAIL"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            cache.peek("api.example"),
            Some(CacheLookup::Failed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_history_has_no_last_good() {
        let resolver = Arc::new(TableResolver::default());
        let (cache, _rx) = cache_with(resolver, DnsConfig::default());

        match cache.resolve("missing.example").await {
            CacheLookup::Failed { last_good, .. } => assert!(last_good.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn peek_never_resolves() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(1)]), None);
        let (cache, _rx) = cache_with(resolver.clone(), DnsConfig::default());

        assert!(cache.peek("api.example").is_none());
        assert_eq!(resolver.calls(), 0);
    }

    // ── Eviction ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn evicts_lru_unwatched_entry() {
        let resolver = Arc::new(TableResolver::default());
        for host in ["a", "b", "c"] {
            resolver.set(host, Ok(vec![ip(1)]), Some(Duration::from_secs(300)));
        }
        let config = DnsConfig {
            max_entries: 2,
            ..DnsConfig::default()
        };
        let (cache, _rx) = cache_with(resolver, config);

        cache.resolve("a").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.resolve("b").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.resolve("a").await;
        cache.resolve("c").await;

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("b").is_none());
        assert!(cache.peek("a").is_some());
        assert_eq!(cache.stats().2, 1);
    }

    // ── Background refresh ───────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn watched_name_is_refreshed_on_expiry() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(1)]), Some(Duration::from_secs(10)));
        let (cache, mut rx) = cache_with(resolver.clone(), DnsConfig::default());

        cache.watch("api.example");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.hostname, "api.example");

        resolver.set("api.example", Ok(vec![ip(7)]), Some(Duration::from_secs(10)));
        let second = rx.recv().await.unwrap();
        match second.lookup {
            CacheLookup::Resolved { addresses, .. } => assert_eq!(addresses, vec![ip(7)]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(resolver.calls(), 2);
        cache.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_config_does_not_spin_refresh() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(1)]), Some(Duration::ZERO));
        let config = DnsConfig {
            default_ttl_secs: 0,
            min_ttl_secs: 0,
            ..DnsConfig::default()
        };
        let (cache, mut rx) = cache_with(resolver.clone(), config);

        cache.watch("api.example");
        let first = rx.recv().await.unwrap();
        match first.lookup {
            CacheLookup::Resolved { ttl, .. } => assert_eq!(ttl, TTL_FLOOR),
            other => panic!("unexpected {other:?}"),
        }

        // One lookup per floor interval (plus 50ms latency), not a tight loop.
        tokio::time::sleep(Duration::from_millis(3_200)).await;
        assert!(resolver.calls() <= 4, "calls = {}", resolver.calls());
        cache.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_backs_off_exponentially() {
        let resolver = Arc::new(TableResolver::default());
        let (cache, mut rx) = cache_with(resolver.clone(), DnsConfig::default());

        cache.watch("down.example");
        let mut stamps = Vec::new();
        for _ in 0..4 {
            let update = rx.recv().await.unwrap();
            assert!(matches!(update.lookup, CacheLookup::Failed { .. }));
            stamps.push(Instant::now());
        }

        // 50ms lookup latency plus 1s, 2s, 4s of backoff.
        let gaps: Vec<u64> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        assert_eq!(gaps, vec![1050, 2050, 4050]);
        cache.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn unwatch_stops_publishing() {
        let resolver = Arc::new(TableResolver::default());
        resolver.set("api.example", Ok(vec![ip(1)]), Some(Duration::from_secs(5)));
        let (cache, mut rx) = cache_with(resolver, DnsConfig::default());

        cache.watch("api.example");
        assert!(cache.is_watching("api.example"));
        rx.recv().await.unwrap();

        cache.unwatch("api.example");
        assert!(!cache.is_watching("api.example"));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
