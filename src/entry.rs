//! The tagged entry variant stored behind each slot's payload pointer.
//!
//! The four states form the partial order described by the table's
//! invariants: `null -> Live/Tombstone -> (Live <-> Tombstone)* -> Prime ->
//! Dead`. One `enum` carries the whole state machine rather than a family of
//! node types behind a common trait object.

/// The value resident at a claimed slot.
pub(crate) enum Entry<K, V> {
    /// A live binding. Replacement always installs a brand new `Live`, never
    /// mutates one in place.
    Live(K, V),
    /// A logically deleted binding. Carries the key so a slot's key identity
    /// survives deletion (and, transitively, a resize).
    Tombstone(K),
    /// Mid-copy to the successor table. Readers that observe this must
    /// consult `next` rather than trust the value carried here, since the
    /// successor may already hold a newer write for this key.
    Prime(K, V),
    /// Terminal state once this slot's migration has completed. The slot is
    /// retired; only the successor table is authoritative from here on.
    Dead,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn key(&self) -> Option<&K> {
        match self {
            Entry::Live(k, _) | Entry::Tombstone(k) | Entry::Prime(k, _) => Some(k),
            Entry::Dead => None,
        }
    }

    pub(crate) fn value(&self) -> Option<&V> {
        match self {
            Entry::Live(_, v) | Entry::Prime(_, v) => Some(v),
            Entry::Tombstone(_) | Entry::Dead => None,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self, Entry::Live(..))
    }

    pub(crate) fn is_prime(&self) -> bool {
        matches!(self, Entry::Prime(..))
    }

    pub(crate) fn is_dead(&self) -> bool {
        matches!(self, Entry::Dead)
    }
}

impl<K: Clone, V: Clone> Entry<K, V> {
    /// Clones the key/value pair of a `Live` or `Prime` entry, for migrating
    /// it into a successor table without taking ownership away from the
    /// (possibly still-read) original.
    pub(crate) fn cloned_live_pair(&self) -> Option<(K, V)> {
        match self {
            Entry::Live(k, v) | Entry::Prime(k, v) => Some((k.clone(), v.clone())),
            Entry::Tombstone(_) | Entry::Dead => None,
        }
    }
}
