//! Error types for the record store.

use thiserror::Error;

/// Result type alias for record store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors returned by the admission (write) path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("address {address} port {port} already claimed by {existing}")]
    AddressConflict {
        address: String,
        port: u16,
        existing: String,
    },

    #[error("not found: {0}")]
    NotFound(String),
}

impl StateError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        StateError::InvalidRecord {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
