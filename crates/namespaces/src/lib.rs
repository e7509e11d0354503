//! Namespace state per environment, coalesced recipe fetches and
//! auto-bucketing of `namespaceSample` filters.

#![forbid(unsafe_code)]

mod cache;
pub mod coordinator;
pub mod state;

pub use coordinator::{AllocationError, NamespaceCoordinator};
pub use state::{NamespaceAction, NamespaceState};

/// Separator between the segments of a fetch cache key.
pub const KEY_SEPARATOR: &str = "::";
