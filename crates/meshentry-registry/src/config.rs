//! Registry configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hard lower bound on any cache TTL, whatever `min_ttl_secs` says.
pub const TTL_FLOOR: Duration = Duration::from_secs(1);

/// Top-level registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// DNS cache and refresh settings.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Depth of the writer command queue.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

/// DNS cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsConfig {
    /// TTL used when the resolver reports none.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Lower bound applied to resolver TTLs.
    #[serde(default = "default_min_ttl_secs")]
    pub min_ttl_secs: u64,

    /// Upper bound applied to resolver TTLs.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// First retry delay after a failed lookup.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Retry delay cap.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Maximum number of cached hostnames.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Optional `/etc/hosts`-format file consulted before system DNS.
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dns: DnsConfig::default(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            min_ttl_secs: default_min_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            max_entries: default_max_entries(),
            hosts_file: None,
        }
    }
}

impl DnsConfig {
    /// Clamp a resolver-reported TTL into the configured bounds, never
    /// below [`TTL_FLOOR`].
    pub fn effective_ttl(&self, reported: Option<Duration>) -> Duration {
        let min = Duration::from_secs(self.min_ttl_secs).max(TTL_FLOOR);
        let max = Duration::from_secs(self.max_ttl_secs).max(min);
        reported
            .unwrap_or(Duration::from_secs(self.default_ttl_secs))
            .clamp(min, max)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs).max(self.backoff_initial())
    }
}

fn default_command_buffer() -> usize {
    256
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_min_ttl_secs() -> u64 {
    5
}

fn default_max_ttl_secs() -> u64 {
    300
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_max_entries() -> usize {
    1024
}
