//! [`ConcurrentSet`]: the dictionary with its value elided, plus the
//! identity-preserving `find_or_store` operation.

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crossbeam_epoch as epoch;

use crate::entry::Entry;
use crate::error::Result;
use crate::hash::{spread, DefaultHashBuilder};
use crate::map::{ConcurrentDict, WriteResult};

/// Marks key types whose `Clone` preserves object identity, not merely
/// equality. `find_or_store` only makes sense for such keys: for a
/// value-typed key, "the instance that won the race" and "a fresh equal
/// clone" are indistinguishable, so the operation would be pointless.
pub trait StableIdentity {}

impl<T: ?Sized> StableIdentity for Arc<T> {}
impl<T: ?Sized> StableIdentity for std::rc::Rc<T> {}

/// A lock-free concurrent set: a dictionary with the value parameter
/// elided. `ConditionalReplace` has no counterpart here — membership is
/// binary, so `insert` is already idempotent.
pub struct ConcurrentSet<K, S = DefaultHashBuilder> {
    inner: ConcurrentDict<K, (), S>,
}

impl<K> ConcurrentSet<K, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: ConcurrentDict::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: ConcurrentDict::with_capacity(capacity)?,
        })
    }
}

impl<K> Default for ConcurrentSet<K, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> ConcurrentSet<K, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            inner: ConcurrentDict::with_hasher(hasher),
        }
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Result<Self> {
        Ok(Self {
            inner: ConcurrentDict::with_capacity_and_hasher(capacity, hasher)?,
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Adds `key`. Returns `true` when no live binding existed for it
    /// beforehand (a tombstoned or never-seen key both count as absent).
    pub fn insert(&self, key: K) -> bool {
        let guard = &epoch::pin();
        let h = spread(self.inner.hasher(), &key);
        let k_for_entry = key.clone();
        let make_entry = move || Entry::Live(k_for_entry.clone(), ());
        let predicate = |resident: Option<&Entry<K, ()>>| !matches!(resident, Some(e) if e.is_live());
        matches!(
            self.inner.execute_write(h, &key, false, make_entry, predicate, guard),
            WriteResult::Installed(_)
        )
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.inner.iter().map(|(k, _)| k)
    }
}

impl<K, S> ConcurrentSet<K, S>
where
    K: Hash + Eq + Clone + Send + Sync + StableIdentity + 'static,
    S: BuildHasher + Clone,
{
    /// Returns the canonical stored instance for a key equal to `key`,
    /// inserting `key` itself as that instance if none exists yet. Two
    /// concurrent calls with distinct-but-equal key objects always agree on
    /// which one becomes canonical.
    pub fn find_or_store(&self, key: K) -> K {
        let guard = &epoch::pin();
        let h = spread(self.inner.hasher(), &key);
        let found = std::rc::Rc::new(std::cell::Cell::new(None::<K>));
        let found_for_predicate = found.clone();
        let k_for_entry = key.clone();
        let make_entry = move || Entry::Live(k_for_entry.clone(), ());
        let predicate = move |resident: Option<&Entry<K, ()>>| match resident {
            Some(e) if e.is_live() => {
                found_for_predicate.set(e.key().cloned());
                false
            }
            _ => true,
        };
        match self.inner.execute_write(h, &key, false, make_entry, predicate, guard) {
            WriteResult::Installed(_) => key,
            WriteResult::Rejected(_) => found.take().unwrap_or(key),
        }
    }
}
