//! Registry error types.

use thiserror::Error;

use meshentry_state::StateError;

/// Name-resolution failures. These are absorbed into per-record state and
/// never reach query callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("host cannot be resolved: {0}")]
    UnresolvableHost(String),

    #[error("resolution of {host} failed: {reason}")]
    ResolutionFailed { host: String, reason: String },
}

/// Errors returned by registry write operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("registry writer has stopped")]
    Closed,
}

pub type RegistryResult<T> = Result<T, RegistryError>;
