//! meshentry-state — service records and their admission rules.
//!
//! # Architecture
//!
//! A [`ServiceRecord`] is the unit of configuration. The [`RecordStore`]
//! keeps the live set keyed by `{namespace}/{name}`, validates every write
//! against the structural invariants and the cross-record address
//! uniqueness rule, and queues a [`RecordChange`] for each successful
//! mutation. The store never resolves anything itself.

pub mod error;
pub mod store;
pub mod types;
pub mod validate;

pub use error::{StateError, StateResult};
pub use store::{RecordChange, RecordStore};
pub use types::*;
pub use validate::{AddressClaim, ClaimAddress, address_claims, parse_address};
