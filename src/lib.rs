//! A lock-free concurrent dictionary and set sharing one open-addressed
//! hash-table core.
//!
//! No API in this crate ever blocks on a lock. Insert, lookup, remove, and
//! the table's own growth all make progress purely through single-word CAS
//! on the table's slot array, with any number of readers and writers (and,
//! during a resize, the resize's own helpers) running concurrently over the
//! same slots. Reclamation of retired memory is deferred through
//! [`crossbeam_epoch`] rather than through reference counting or a global
//! stop-the-world pause.
//!
//! The two public surfaces, [`ConcurrentDict`] and [`ConcurrentSet`], are
//! both thin façades over [`table::Table`]; the set is the dictionary with
//! its value parameter elided.

mod entry;
mod hash;
mod iter;
mod map;
mod set;
mod table;

pub mod error;

pub use error::{CollectionError, Result};
pub use hash::DefaultHashBuilder;
pub use iter::Iter;
pub use map::ConcurrentDict;
pub use set::{ConcurrentSet, StableIdentity};
