//! RecordStore — the authoritative set of service records.
//!
//! The store is a plain owned structure: it is handed to the registry's
//! writer pipeline, which is its only mutator. Every successful mutation
//! queues a [`RecordChange`] that the pipeline drains to drive resolution.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;
use crate::validate::{check_conflicts, validate_record};

/// A mutation the resolution engine must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    Upserted(RecordKey),
    Removed(RecordKey),
}

impl RecordChange {
    pub fn key(&self) -> &str {
        match self {
            RecordChange::Upserted(key) | RecordChange::Removed(key) => key,
        }
    }
}

/// In-memory record store with admission validation.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: BTreeMap<RecordKey, ServiceRecord>,
    changes: VecDeque<RecordChange>,
    /// Incremented on every successful mutation.
    revision: u64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert (or fully replace) a record.
    ///
    /// On error the store is unchanged, including any previous record
    /// stored under the same key.
    pub fn put(&mut self, record: ServiceRecord) -> StateResult<()> {
        validate_record(&record)?;
        check_conflicts(&record, self.records.values())?;

        let key = record.table_key();
        let replaced = self.records.insert(key.clone(), record).is_some();
        self.revision += 1;
        debug!(%key, replaced, revision = self.revision, "record stored");
        self.changes.push_back(RecordChange::Upserted(key));
        Ok(())
    }

    /// Remove a record by key.
    pub fn delete(&mut self, key: &str) -> StateResult<ServiceRecord> {
        let record = self
            .records
            .remove(key)
            .ok_or_else(|| StateError::NotFound(key.to_string()))?;
        self.revision += 1;
        debug!(%key, revision = self.revision, "record deleted");
        self.changes.push_back(RecordChange::Removed(key.to_string()));
        Ok(record)
    }

    /// Get a record by key.
    pub fn get(&self, key: &str) -> Option<&ServiceRecord> {
        self.records.get(key)
    }

    /// Point-in-time copy of all records, ordered by key.
    pub fn list(&self) -> Vec<ServiceRecord> {
        self.records.values().cloned().collect()
    }

    /// Take every change queued since the last call, oldest first.
    pub fn take_changes(&mut self) -> Vec<RecordChange> {
        self.changes.drain(..).collect()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
