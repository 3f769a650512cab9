//! [`ConcurrentDict`]: the public-facing lock-free dictionary built on top of
//! [`Table`].

use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

use crate::entry::Entry;
use crate::error::{CollectionError, Result, MAX_CAPACITY};
use crate::hash::{spread, DefaultHashBuilder};
use crate::iter::Iter;
use crate::table::{Resolution, Table, WriteOutcome};

fn normalize_capacity(requested: usize) -> Result<usize> {
    if requested > MAX_CAPACITY {
        return Err(CollectionError::CapacityOutOfRange { requested });
    }
    let capacity = if requested == 0 { 16 } else { requested.next_power_of_two() };
    if capacity > MAX_CAPACITY {
        return Err(CollectionError::CapacityOutOfRange { requested });
    }
    Ok(capacity)
}

/// Result of driving a write through the table chain, one level up from
/// [`WriteOutcome`]: by the time a caller sees this, the chain has been
/// fully walked.
pub(crate) enum WriteResult<V> {
    Installed(Option<V>),
    Rejected(Option<V>),
}

/// A lock-free concurrent dictionary.
///
/// Reads, writes, and an in-progress resize may all run concurrently on the
/// same key without any thread ever blocking on a lock; the only
/// synchronization primitive used internally is single-word CAS.
pub struct ConcurrentDict<K, V, S = DefaultHashBuilder> {
    current: Atomic<Table<K, V>>,
    initial_capacity: usize,
    hasher: S,
}

impl<K, V> ConcurrentDict<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(16).expect("default capacity is always in range")
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V> Default for ConcurrentDict<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentDict<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(16, hasher).expect("default capacity is always in range")
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Result<Self> {
        let capacity = normalize_capacity(capacity)?;
        let table = Table::try_fresh(capacity)
            .map_err(|_| CollectionError::ResizeAllocationFailed { requested_capacity: capacity })?;
        Ok(Self {
            current: Atomic::new(table),
            initial_capacity: capacity,
            hasher,
        })
    }

    pub(crate) fn hasher(&self) -> &S {
        &self.hasher
    }

    fn pin_current<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        unsafe { self.current.load(Ordering::Acquire, guard).deref() }
    }

    /// Looks up `key`, following the table chain and helping along any
    /// in-progress resize it crosses.
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        let h = spread(&self.hasher, key);
        let mut table = self.pin_current(guard);
        loop {
            match table.lookup(h, key, guard) {
                Resolution::Value(v) => return Some(v),
                Resolution::Absent => return None,
                Resolution::GoTo(next) => {
                    self.drive_resize(table, guard);
                    table = unsafe { next.deref() };
                }
            }
        }
    }

    /// Same as [`Self::get`], but returns `Err(KeyNotFound)` instead of
    /// `None` for callers that want a non-nullable accessor form.
    pub fn get_or_err(&self, key: &K) -> Result<V> {
        self.get(key).ok_or(CollectionError::KeyNotFound)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn execute_write<F, P>(
        &self,
        hash: u32,
        key: &K,
        is_delete: bool,
        make_entry: F,
        predicate: P,
        guard: &Guard,
    ) -> WriteResult<V>
    where
        F: Fn() -> Entry<K, V>,
        P: Fn(Option<&Entry<K, V>>) -> bool,
    {
        let mut table = self.pin_current(guard);
        loop {
            match table.write(hash, key, is_delete, &make_entry, &predicate, guard) {
                WriteOutcome::Done(prior) => {
                    return WriteResult::Installed(prior);
                }
                WriteOutcome::Rejected(resident) => {
                    return WriteResult::Rejected(resident);
                }
                WriteOutcome::GoTo(next) => {
                    self.drive_resize(table, guard);
                    table = unsafe { next.deref() };
                }
                WriteOutcome::Resize => {
                    let next = Table::resize(table, guard);
                    table = unsafe { next.deref() };
                }
            }
        }
    }

    /// Unconditionally sets `key` to `value`, returning the prior value if
    /// one was live.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let h = spread(&self.hasher, &key);
        let k_for_entry = key.clone();
        let v_for_entry = value;
        let make_entry = move || Entry::Live(k_for_entry.clone(), v_for_entry.clone());
        let predicate = |_resident: Option<&Entry<K, V>>| true;
        match self.execute_write(h, &key, false, make_entry, predicate, guard) {
            WriteResult::Installed(prior) => prior,
            WriteResult::Rejected(prior) => prior,
        }
    }

    /// Sets `key` to `value` only if no live binding exists. Returns the
    /// binding now resident for `key`, whichever call produced it.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let h = spread(&self.hasher, &key);
        let k_for_entry = key.clone();
        let v_for_entry = value.clone();
        let make_entry = move || Entry::Live(k_for_entry.clone(), v_for_entry.clone());
        let predicate = |resident: Option<&Entry<K, V>>| !matches!(resident, Some(e) if e.is_live());
        match self.execute_write(h, &key, false, make_entry, predicate, guard) {
            WriteResult::Installed(_) => Some(value),
            WriteResult::Rejected(resident) => resident,
        }
    }

    /// Replaces `key`'s live value with `new_value` only if the resident
    /// value satisfies `matches_expected`.
    pub fn conditional_replace(
        &self,
        key: K,
        new_value: V,
        matches_expected: impl Fn(&V) -> bool,
    ) -> bool {
        let guard = &epoch::pin();
        let h = spread(&self.hasher, &key);
        let k_for_entry = key.clone();
        let v_for_entry = new_value;
        let make_entry = move || Entry::Live(k_for_entry.clone(), v_for_entry.clone());
        let predicate = move |resident: Option<&Entry<K, V>>| {
            matches!(resident, Some(e) if e.is_live() && e.value().map(&matches_expected).unwrap_or(false))
        };
        matches!(
            self.execute_write(h, &key, false, make_entry, predicate, guard),
            WriteResult::Installed(_)
        )
    }

    /// Removes `key`'s live binding, returning its value if one existed.
    /// A miss never allocates a slot.
    pub fn remove(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        let h = spread(&self.hasher, key);
        let key_owned = key.clone();
        let make_entry = move || Entry::Tombstone(key_owned.clone());
        let predicate = |resident: Option<&Entry<K, V>>| matches!(resident, Some(e) if e.is_live());
        match self.execute_write(h, key, true, make_entry, predicate, guard) {
            WriteResult::Installed(prior) => prior,
            WriteResult::Rejected(_) => None,
        }
    }

    /// Removes every live binding whose value satisfies `predicate`, walking
    /// the full table chain. If the removed fraction is large, triggers a
    /// shrinking resize afterward.
    pub fn remove_where(&self, mut predicate: impl FnMut(&V) -> bool) {
        let guard = &epoch::pin();
        let mut table = self.pin_current(guard);
        let mut removed = 0usize;
        loop {
            for idx in 0..table.slot_count() {
                if table.sweep_remove_if(idx, &mut predicate, guard) {
                    removed += 1;
                }
            }
            match table.next_or_none(guard) {
                Some(next) => {
                    self.drive_resize(table, guard);
                    table = unsafe { next.deref() };
                }
                None => break,
            }
        }
        let capacity = table.slot_count();
        let size = table.size.load(Ordering::Acquire).max(0) as usize;
        if removed * 16 > capacity || (size > 0 && removed * 4 > size) {
            Table::resize(table, guard);
        }
    }

    /// Replaces the dictionary's contents with an empty table at the
    /// original construction capacity.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let fresh = Owned::new(Table::fresh(self.initial_capacity));
        // The replacement table must be fully initialized before it becomes
        // reachable to concurrent readers.
        std::sync::atomic::fence(Ordering::SeqCst);
        let old = self.current.swap(fresh, Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }

    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        self.pin_current(guard).size.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        let guard = &epoch::pin();
        self.pin_current(guard).slot_count()
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        let guard = epoch::pin();
        let table = self.current.load(Ordering::Acquire, &guard).as_raw();
        Iter {
            guard,
            table,
            idx: 0,
            marker: PhantomData,
        }
    }

    /// Helps one chunk of an in-progress resize along and promotes the
    /// façade's current table pointer once migration completes. A no-op if
    /// `table` has no successor.
    pub(crate) fn drive_resize(&self, table: &Table<K, V>, guard: &Guard) {
        if table.next_or_none(guard).is_none() {
            return;
        }
        table.help_copy_chunk(guard);
        self.try_promote(table, guard);
    }

    fn try_promote(&self, table: &Table<K, V>, guard: &Guard) {
        let mut table = table;
        loop {
            if !table.fully_copied() {
                return;
            }
            let next = match table.next_or_none(guard) {
                Some(n) => n,
                None => return,
            };
            let current_shared = self.current.load(Ordering::Acquire, guard);
            if current_shared.as_raw() != table as *const Table<K, V> {
                return;
            }
            match self.current.compare_exchange(
                current_shared,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(old) => {
                    tracing::debug!(new_capacity = unsafe { next.deref() }.slot_count(), "table promoted");
                    unsafe { guard.defer_destroy(old) };
                    table = unsafe { next.deref() };
                }
                Err(_) => return,
            }
        }
    }
}

impl<K, V, S> std::fmt::Debug for ConcurrentDict<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentDict").finish_non_exhaustive()
    }
}

impl<K, V, S> Drop for ConcurrentDict<K, V, S> {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let old = self.current.swap(crossbeam_epoch::Shared::null(), Ordering::Relaxed, guard);
        if !old.is_null() {
            unsafe { drop(old.into_owned()) };
        }
    }
}
