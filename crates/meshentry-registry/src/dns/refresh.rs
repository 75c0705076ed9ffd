//! Background refresh of watched hostnames.
//!
//! One task per watched name. After a successful lookup the task sleeps
//! for the remaining TTL. After a failure it retries with exponential
//! backoff, doubling the delay up to a cap and resetting it on the next
//! success. Every result is published to the resolution engine.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dns::cache::{CacheLookup, DnsCache, DnsUpdate};

/// Handle to a running refresh task.
pub(crate) struct RefreshSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RefreshSlot {
    pub(crate) fn new(handle: JoinHandle<()>, shutdown_tx: watch::Sender<bool>) -> Self {
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub(crate) fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

/// Capped exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next retry; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

pub(crate) async fn run_refresh_loop(
    cache: DnsCache,
    hostname: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = cache.backoff();
    debug!(%hostname, "dns refresh loop starting");

    loop {
        let lookup = tokio::select! {
            lookup = cache.resolve(&hostname) => lookup,
            _ = shutdown.changed() => break,
        };

        let delay = match &lookup {
            CacheLookup::Resolved { ttl, addresses } => {
                backoff.reset();
                debug!(%hostname, count = addresses.len(), refresh_in = ?ttl, "dns refresh succeeded");
                *ttl
            }
            CacheLookup::Failed { error, last_good } => {
                let delay = backoff.next_delay();
                warn!(
                    %hostname,
                    error = %error,
                    retry_in = ?delay,
                    serving_last_good = last_good.is_some(),
                    "dns refresh failed"
                );
                delay
            }
        };

        cache.publish(DnsUpdate {
            hostname: hostname.clone(),
            lookup,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(%hostname, "dns refresh loop stopped");
}
