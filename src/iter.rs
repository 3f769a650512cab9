//! The forward cursor iterator over a dictionary's live bindings.

use std::marker::PhantomData;

use crossbeam_epoch::Guard;

use crate::entry::Entry;
use crate::table::Table;

/// A forward cursor over live bindings, with no snapshot guarantee against
/// concurrent writers: it helps along any Prime entries it crosses and
/// descends into successor tables as resizes are promoted underneath it.
pub struct Iter<'m, K, V> {
    pub(crate) guard: Guard,
    pub(crate) table: *const Table<K, V>,
    pub(crate) idx: usize,
    pub(crate) marker: PhantomData<&'m ()>,
}

impl<'m, K, V> Iterator for Iter<'m, K, V>
where
    K: Eq + Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // SAFETY: `self.guard` has been pinned continuously since every
            // table pointer held here was read, so nothing reachable from
            // them has been reclaimed yet.
            let table = unsafe { &*self.table };
            if self.idx >= table.slot_count() {
                match table.next_or_none(&self.guard) {
                    Some(next) => {
                        self.table = next.as_raw();
                        self.idx = 0;
                        continue;
                    }
                    None => return None,
                }
            }
            let idx = self.idx;
            self.idx += 1;
            let entry = table.slot_entry(idx, &self.guard);
            if entry.is_null() {
                continue;
            }
            let entry_ref = unsafe { entry.deref() };
            match entry_ref {
                Entry::Live(k, v) => return Some((k.clone(), v.clone())),
                Entry::Tombstone(_) | Entry::Dead => continue,
                Entry::Prime(..) => {
                    table.help_copy_slot(idx, &self.guard);
                    continue;
                }
            }
        }
    }
}
