//! Error taxonomy for the collection core: argument-domain failures at
//! construction/call entry, lookup-miss for the non-nullable accessor form,
//! and ephemeral resource failures surfaced from the resize path.

use thiserror::Error;

/// The largest capacity a table may be constructed or grown to: `2^26`.
pub const MAX_CAPACITY: usize = 1 << 26;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    /// A requested capacity fell outside `[1, 2^26]`.
    #[error("capacity {requested} is out of range (must be in [1, {MAX_CAPACITY}])")]
    CapacityOutOfRange { requested: usize },

    /// The non-nullable indexer-style accessor found no live binding for the key.
    #[error("key not found")]
    KeyNotFound,

    /// A successor table could not be allocated during a resize.
    #[error("failed to allocate a resize table of capacity {requested_capacity}")]
    ResizeAllocationFailed { requested_capacity: usize },
}

pub type Result<T> = std::result::Result<T, CollectionError>;
