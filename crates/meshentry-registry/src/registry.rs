//! The registry handle and its single-writer pipeline.
//!
//! All mutations funnel through one writer task that owns the
//! [`RecordStore`], the [`ResolutionEngine`] and the DNS update channel.
//! Each change runs store → matcher → engine → snapshot and ends with an
//! atomic swap of the published [`Snapshot`]. Queries load the current
//! snapshot without locking and never wait on the writer or on DNS.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use meshentry_state::{RecordChange, RecordKey, RecordStore, ServiceRecord, StateError};

use crate::config::RegistryConfig;
use crate::dns::{DnsCache, DnsUpdate, Resolve};
use crate::engine::ResolutionEngine;
use crate::error::{RegistryError, RegistryResult};
use crate::snapshot::{RecordStatus, RouteMatch, Snapshot};

enum Command {
    Put {
        record: ServiceRecord,
        reply: oneshot::Sender<RegistryResult<u64>>,
    },
    Delete {
        key: RecordKey,
        reply: oneshot::Sender<RegistryResult<ServiceRecord>>,
    },
    List {
        reply: oneshot::Sender<Vec<ServiceRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running registry.
#[derive(Clone)]
pub struct Registry {
    commands: mpsc::Sender<Command>,
    published: Arc<ArcSwap<Snapshot>>,
    changes: watch::Receiver<u64>,
    cache: DnsCache,
}

impl Registry {
    /// Start the writer pipeline on the current tokio runtime.
    pub fn spawn(config: RegistryConfig, resolver: Arc<dyn Resolve>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (dns_tx, dns_rx) = mpsc::unbounded_channel();
        let (version_tx, version_rx) = watch::channel(0);

        let cache = DnsCache::new(config.dns.clone(), resolver, dns_tx);
        let published = Arc::new(ArcSwap::from_pointee(Snapshot::default()));

        let writer = Writer {
            store: RecordStore::new(),
            engine: ResolutionEngine::new(cache.clone()),
            published: Arc::clone(&published),
            version_tx,
            version: 0,
        };
        tokio::spawn(writer.run(command_rx, dns_rx));
        info!(command_buffer = config.command_buffer, "registry started");

        Self {
            commands: command_tx,
            published,
            changes: version_rx,
            cache,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> RegistryResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Admit or replace a record. Resolves once the snapshot reflecting
    /// the change is published, returning its version.
    pub async fn put(&self, record: ServiceRecord) -> RegistryResult<u64> {
        self.request(|reply| Command::Put { record, reply }).await?
    }

    /// Remove a record by key (`{namespace}/{name}`).
    pub async fn delete(&self, key: &str) -> RegistryResult<ServiceRecord> {
        let key = key.to_string();
        self.request(|reply| Command::Delete { key, reply }).await?
    }

    /// Every admitted record, ordered by key.
    pub async fn list(&self) -> RegistryResult<Vec<ServiceRecord>> {
        self.request(|reply| Command::List { reply }).await
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.load_full()
    }

    pub fn lookup(&self, ip: IpAddr, port: u16) -> Option<RouteMatch> {
        self.published.load().lookup(ip, port)
    }

    pub fn lookup_by_host(&self, host: &str, port: u16) -> Option<RouteMatch> {
        self.published.load().lookup_by_host(host, port)
    }

    pub fn lookup_connection(&self, ip: IpAddr, port: u16, host: Option<&str>) -> Option<RouteMatch> {
        self.published.load().lookup_connection(ip, port, host)
    }

    pub fn status(&self, key: &str) -> Option<RecordStatus> {
        self.published.load().status(key)
    }

    /// Published snapshot versions.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Wait until the published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> RegistryResult<Arc<Snapshot>>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let mut changes = self.changes.clone();
        loop {
            changes.borrow_and_update();
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            if changes.changed().await.is_err() {
                return Err(RegistryError::Closed);
            }
        }
    }

    /// DNS cache statistics: `(hits, misses, evictions)`.
    pub fn cache_stats(&self) -> (u64, u64, u64) {
        self.cache.stats()
    }

    /// Stop the writer and every DNS refresh task. Later writes fail with
    /// [`RegistryError::Closed`]; queries keep answering from the last
    /// published snapshot.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("registry already stopped");
        }
    }
}

struct Writer {
    store: RecordStore,
    engine: ResolutionEngine,
    published: Arc<ArcSwap<Snapshot>>,
    version_tx: watch::Sender<u64>,
    version: u64,
}

impl Writer {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut dns: mpsc::UnboundedReceiver<DnsUpdate>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(update) = dns.recv() => {
                    let mut changed = self.engine.apply_dns(update);
                    while let Ok(update) = dns.try_recv() {
                        changed |= self.engine.apply_dns(update);
                    }
                    if changed {
                        self.publish();
                    }
                }
            }
        }

        self.engine.cache().shutdown();
        info!(records = self.store.len(), version = self.version, "registry writer stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Put { record, reply } => {
                let key = record.table_key();
                let result = match self.store.put(record) {
                    Ok(()) => {
                        self.apply_changes();
                        let version = self.publish();
                        info!(record = %key, revision = self.store.revision(), version, "record admitted");
                        Ok(version)
                    }
                    Err(e) => {
                        warn!(record = %key, error = %e, "record rejected");
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Command::Delete { key, reply } => {
                let result = match self.store.delete(&key) {
                    Ok(record) => {
                        self.apply_changes();
                        let version = self.publish();
                        info!(record = %key, version, "record deleted");
                        Ok(record)
                    }
                    Err(e @ StateError::NotFound(_)) => {
                        debug!(record = %key, "delete of unknown record");
                        Err(e.into())
                    }
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Command::List { reply } => {
                let _ = reply.send(self.store.list());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Feed queued store changes through the engine.
    fn apply_changes(&mut self) {
        for change in self.store.take_changes() {
            match change {
                RecordChange::Upserted(key) => {
                    if let Some(record) = self.store.get(&key) {
                        self.engine.upsert(record.clone());
                    }
                }
                RecordChange::Removed(key) => {
                    self.engine.remove(&key);
                }
            }
        }
    }

    /// Build and swap in a new snapshot; returns its version.
    fn publish(&mut self) -> u64 {
        self.version += 1;
        let snapshot = Snapshot::build(self.version, self.engine.views());
        let records = snapshot.len();
        self.published.store(Arc::new(snapshot));
        self.version_tx.send_replace(self.version);
        debug!(version = self.version, records, "snapshot published");
        self.version
    }
}
