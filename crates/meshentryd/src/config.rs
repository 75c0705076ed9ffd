//! meshentry.toml configuration parser.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use meshentry_registry::RegistryConfig;
use meshentry_state::{RecordStore, ServiceRecord, StateError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub records: Vec<ServiceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info,meshentry=debug".to_string()
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Admit every record, in file order, into a scratch store and return
    /// the ones that would be rejected.
    pub fn check(&self) -> Vec<(String, StateError)> {
        let mut store = RecordStore::new();
        self.records
            .iter()
            .filter_map(|record| {
                store
                    .put(record.clone())
                    .err()
                    .map(|e| (record.table_key(), e))
            })
            .collect()
    }
}
