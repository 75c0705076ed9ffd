//! meshentry-registry — resolves service records into a queryable registry.
//!
//! # Architecture
//!
//! A single writer task owns the record store and the resolution engine.
//! Every accepted write runs through the pipeline
//!
//! ```text
//! RecordStore → RecordMatcher → ResolutionEngine → Snapshot → ArcSwap
//! ```
//!
//! and ends with an atomic swap of the published snapshot. DNS-mode records
//! depend on the [`DnsCache`], whose background refresh tasks feed results
//! back to the writer over a channel. Readers query the current snapshot
//! lock-free through the [`Registry`] handle.
//!
//! # Components
//!
//! - **`matcher`**: host patterns (exact and `*.suffix`) and CIDR matchers
//! - **`dns`**: resolver chain, TTL cache with request coalescing, refresh
//! - **`engine`**: per-record resolution state machine
//! - **`snapshot`**: immutable indexes and the query API
//! - **`registry`**: the handle and the writer pipeline

pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod registry;
pub mod snapshot;

pub use config::{DnsConfig, RegistryConfig};
pub use dns::{CacheLookup, DnsAnswer, DnsCache, DnsUpdate, EtcHosts, Resolve, SystemResolver};
pub use engine::{EndpointSet, ResolutionEngine, ResolutionState, ResolvedEndpoint, ResolvedView};
pub use error::{DnsError, RegistryError, RegistryResult};
pub use matcher::{HostPattern, RecordMatcher, normalize_host};
pub use registry::Registry;
pub use snapshot::{Destination, Destinations, RecordStatus, RouteMatch, Snapshot};
