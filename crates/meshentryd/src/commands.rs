//! Subcommand implementations.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use meshentry_registry::{Registry, ResolutionState, RouteMatch, Snapshot, SystemResolver};

use crate::config::DaemonConfig;

/// JSON printed by `meshentryd lookup`.
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LookupOutput {
    Found(RouteMatch),
    NotFound,
}

/// What to look up.
#[derive(Debug, Clone)]
pub struct LookupQuery {
    pub ip: Option<IpAddr>,
    pub host: Option<String>,
    pub port: u16,
}

/// Spawn a registry for `config` and admit its records. Rejected records
/// are logged and skipped.
pub async fn start(config: &DaemonConfig) -> anyhow::Result<Registry> {
    let resolver = SystemResolver::from_config(&config.registry.dns)?;
    let registry = Registry::spawn(config.registry.clone(), Arc::new(resolver));

    let mut admitted = 0usize;
    for record in &config.records {
        match registry.put(record.clone()).await {
            Ok(_) => admitted += 1,
            Err(e) => warn!(record = %record.table_key(), error = %e, "skipping record"),
        }
    }
    info!(admitted, total = config.records.len(), "records loaded");
    Ok(registry)
}

/// Run until Ctrl-C, logging a summary of every published snapshot.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("meshentryd starting");
    let registry = start(&config).await?;
    let mut changes = registry.changes();
    log_summary(&registry.snapshot());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                log_summary(&registry.snapshot());
            }
        }
    }

    registry.shutdown().await;
    let (hits, misses, evictions) = registry.cache_stats();
    info!(
        cache_hits = hits,
        cache_misses = misses,
        cache_evictions = evictions,
        "meshentryd stopped"
    );
    Ok(())
}

/// Validate every record offline. Returns the report lines and whether
/// everything was admitted.
pub fn check(config: &DaemonConfig) -> (Vec<String>, bool) {
    let rejected = config.check();
    let mut lines: Vec<String> = rejected
        .iter()
        .map(|(key, e)| format!("{key}: {e}"))
        .collect();
    lines.push(format!(
        "{} of {} records admitted",
        config.records.len() - rejected.len(),
        config.records.len()
    ));
    (lines, rejected.is_empty())
}

/// Answer one lookup, first waiting up to `wait` for DNS-mode records to
/// leave `DnsPending`.
pub async fn lookup(config: &DaemonConfig, query: &LookupQuery, wait: Duration) -> anyhow::Result<LookupOutput> {
    let registry = start(config).await?;
    let settled = registry.wait_for(|s| {
        s.views().all(|v| v.state != ResolutionState::DnsPending)
    });
    if tokio::time::timeout(wait, settled).await.is_err() {
        warn!(wait_ms = wait.as_millis() as u64, "answering before dns settled");
    }

    let found = match (query.ip, query.host.as_deref()) {
        (Some(ip), host) => registry.lookup_connection(ip, query.port, host),
        (None, Some(host)) => registry.lookup_by_host(host, query.port),
        (None, None) => anyhow::bail!("lookup needs --ip or --host"),
    };
    registry.shutdown().await;

    Ok(match found {
        Some(m) => LookupOutput::Found(m),
        None => LookupOutput::NotFound,
    })
}

fn log_summary(snapshot: &Snapshot) {
    let mut states: BTreeMap<String, usize> = BTreeMap::new();
    for view in snapshot.views() {
        *states.entry(format!("{:?}", view.state)).or_default() += 1;
    }
    info!(
        version = snapshot.version(),
        records = snapshot.len(),
        states = ?states,
        "registry snapshot"
    );
}
