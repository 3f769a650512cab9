//! The lock-free, open-addressed hash table and its cooperative incremental
//! resize protocol. Everything above this module (the dictionary and set
//! façades) is a thin wrapper around [`Table`].

use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use tracing::{debug, trace, warn};

use crate::entry::Entry;
use crate::error::MAX_CAPACITY;
use crate::hash::UNWRITTEN;

/// Number of slots a single `help_copy_chunk` call reserves and migrates.
pub(crate) const HELP_COPY_CHUNK: usize = 1024;

/// One record: an atomic hash word and an atomic payload pointer.
pub(crate) struct Slot<K, V> {
    hash: AtomicU32,
    entry: Atomic<Entry<K, V>>,
}

impl<K, V> Slot<K, V> {
    fn new() -> Self {
        Self {
            hash: AtomicU32::new(UNWRITTEN),
            entry: Atomic::null(),
        }
    }
}

/// Outcome of a single-table lookup.
pub(crate) enum Resolution<'g, K, V> {
    Value(V),
    Absent,
    GoTo(Shared<'g, Table<K, V>>),
}

/// Outcome of a single-table write (insert / replace / tombstone).
pub(crate) enum WriteOutcome<'g, K, V> {
    /// The write committed; carries the value previously resident, if any.
    Done(Option<V>),
    /// The match predicate rejected the write; carries the resident value.
    Rejected(Option<V>),
    /// Reprobe budget exhausted or a Prime/Dead entry was found; a successor
    /// table already exists and the operation should restart there.
    GoTo(Shared<'g, Table<K, V>>),
    /// Reprobe budget exhausted and no successor exists yet; the caller must
    /// call [`Table::resize`] and restart on the result.
    Resize,
}

pub(crate) struct Table<K, V> {
    slots: Box<[Slot<K, V>]>,
    mask: usize,
    pub(crate) capacity: usize,
    reprobe_limit: usize,
    /// Shared with the predecessor/successor table so cardinality survives a
    /// resize without a reconciliation pass (the "aliased counter").
    pub(crate) size: Arc<AtomicIsize>,
    /// Count of claimed (non-empty) slots in *this* table: Live + Tombstone +
    /// in-flight claims. Not aliased; each table starts this at zero.
    claimed_slots: AtomicUsize,
    /// Snapshot of the predecessor's `size` at this table's birth.
    prev_size: isize,
    next: Atomic<Table<K, V>>,
    copy_idx: AtomicUsize,
    copy_done: AtomicUsize,
    resizers: AtomicUsize,
}

fn reprobe_limit_for(capacity: usize) -> usize {
    // max(capacity, (capacity >> 5) + 5), then clamped to capacity. The two
    // steps cancel out arithmetically; both are kept so the computation
    // reads the same way the invariant is stated.
    let candidate = capacity.max((capacity >> 5) + 5);
    candidate.min(capacity)
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(capacity: usize, prev_size: isize, size: Arc<AtomicIsize>) -> Self {
        let capacity = capacity.max(1).next_power_of_two().min(MAX_CAPACITY);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::new);
        Table {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            capacity,
            reprobe_limit: reprobe_limit_for(capacity),
            size,
            claimed_slots: AtomicUsize::new(0),
            prev_size,
            next: Atomic::null(),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
            resizers: AtomicUsize::new(0),
        }
    }

    /// A brand-new, resize-free table with its own fresh aliased counter.
    pub(crate) fn fresh(capacity: usize) -> Self {
        Table::new(capacity, 0, Arc::new(AtomicIsize::new(0)))
    }

    /// Same as [`Self::fresh`], but reports allocation failure as an `Err`
    /// instead of letting the global allocator abort the process. Used at
    /// the dictionary's constructor boundary, where callers can still be
    /// handed a `Result`.
    pub(crate) fn try_fresh(capacity: usize) -> std::result::Result<Self, ()> {
        let capacity = capacity.max(1).next_power_of_two().min(MAX_CAPACITY);
        let mut slots: Vec<Slot<K, V>> = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| ())?;
        slots.resize_with(capacity, Slot::new);
        Ok(Table {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            capacity,
            reprobe_limit: reprobe_limit_for(capacity),
            size: Arc::new(AtomicIsize::new(0)),
            claimed_slots: AtomicUsize::new(0),
            prev_size: 0,
            next: Atomic::null(),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
            resizers: AtomicUsize::new(0),
        })
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.capacity
    }

    pub(crate) fn slot_entry<'g>(&self, idx: usize, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        self.slots[idx].entry.load(Ordering::Acquire, guard)
    }

    pub(crate) fn next_or_none<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, Table<K, V>>> {
        let n = self.next.load(Ordering::Acquire, guard);
        if n.is_null() { None } else { Some(n) }
    }

    pub(crate) fn fully_copied(&self) -> bool {
        self.copy_done.load(Ordering::Acquire) >= self.capacity
    }

    /// Spins until a claimed slot's payload becomes visible. The window
    /// between claiming `hash[i]` and installing `entry[i]` is two
    /// back-to-back atomic ops performed by the same thread, so this is
    /// always brief absent a stalled writer.
    fn wait_for_entry<'g>(&self, slot: &Slot<K, V>, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        loop {
            let e = slot.entry.load(Ordering::Acquire, guard);
            if !e.is_null() {
                return e;
            }
            std::hint::spin_loop();
        }
    }

    fn descend<'g>(&self, guard: &'g Guard) -> Resolution<'g, K, V> {
        match self.next_or_none(guard) {
            Some(next) => Resolution::GoTo(next),
            None => Resolution::Absent,
        }
    }

    fn go_to_next_or_resize<'g>(&self, guard: &'g Guard) -> WriteOutcome<'g, K, V> {
        match self.next_or_none(guard) {
            Some(next) => WriteOutcome::GoTo(next),
            None => WriteOutcome::Resize,
        }
    }

    /// Looks up `key` within this table only. Caller follows `GoTo` into the
    /// successor; `Absent` is final only when there is no successor.
    pub(crate) fn lookup<'g>(&self, hash: u32, key: &K, guard: &'g Guard) -> Resolution<'g, K, V>
    where
        K: Eq + Clone,
        V: Clone,
    {
        let idx0 = (hash as usize) & self.mask;
        for probe in 0..self.reprobe_limit {
            let idx = (idx0 + probe) & self.mask;
            let slot = &self.slots[idx];
            let h_word = slot.hash.load(Ordering::Acquire);
            if h_word == UNWRITTEN {
                return self.descend(guard);
            }
            if h_word != hash {
                continue;
            }
            let entry_shared = self.wait_for_entry(slot, guard);
            let entry_ref = unsafe { entry_shared.deref() };
            if entry_ref.key() != Some(key) {
                continue;
            }
            return match entry_ref {
                Entry::Live(_, v) => Resolution::Value(v.clone()),
                Entry::Tombstone(_) => Resolution::Absent,
                Entry::Prime(..) => {
                    self.help_copy_slot(idx, guard);
                    self.descend(guard)
                }
                Entry::Dead => self.descend(guard),
            };
        }
        self.descend(guard)
    }

    /// Drives a write (insert / conditional-replace / tombstone) against
    /// this table only. `is_delete` selects the no-allocate-on-miss path
    /// described for `Remove`.
    pub(crate) fn write<'g, F, P>(
        &self,
        hash: u32,
        key: &K,
        is_delete: bool,
        make_entry: &F,
        predicate: &P,
        guard: &'g Guard,
    ) -> WriteOutcome<'g, K, V>
    where
        K: Eq + Clone,
        V: Clone,
        F: Fn() -> Entry<K, V>,
        P: Fn(Option<&Entry<K, V>>) -> bool,
    {
        let idx0 = (hash as usize) & self.mask;
        'probe: for probe in 0..self.reprobe_limit {
            let idx = (idx0 + probe) & self.mask;
            let slot = &self.slots[idx];
            let mut h_word = slot.hash.load(Ordering::Acquire);
            if h_word == UNWRITTEN {
                if is_delete {
                    // Never allocate a slot just to record an absence.
                    return WriteOutcome::Rejected(None);
                }
                match slot
                    .hash
                    .compare_exchange(UNWRITTEN, hash, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => h_word = hash,
                    Err(actual) => {
                        if actual != hash {
                            continue 'probe;
                        }
                        h_word = actual;
                    }
                }
            } else if h_word != hash {
                continue 'probe;
            }
            debug_assert_eq!(h_word, hash);

            let current = slot.entry.load(Ordering::Acquire, guard);
            if current.is_null() {
                if is_delete {
                    return WriteOutcome::Rejected(None);
                }
                if !predicate(None) {
                    return WriteOutcome::Rejected(None);
                }
                let desired = Owned::new(make_entry());
                match slot.entry.compare_exchange(
                    Shared::null(),
                    desired,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        self.claimed_slots.fetch_add(1, Ordering::AcqRel);
                        self.size.fetch_add(1, Ordering::AcqRel);
                        return WriteOutcome::Done(None);
                    }
                    Err(e) => {
                        let actual = e.current;
                        let actual_ref = unsafe { actual.deref() };
                        if actual_ref.key() != Some(key) {
                            continue 'probe;
                        }
                        return self.resolve_candidate(
                            slot, idx, actual, actual_ref, make_entry, predicate, is_delete, guard,
                        );
                    }
                }
            }
            let current_ref = unsafe { current.deref() };
            if current_ref.key() != Some(key) {
                continue 'probe;
            }
            return self.resolve_candidate(
                slot, idx, current, current_ref, make_entry, predicate, is_delete, guard,
            );
        }
        self.go_to_next_or_resize(guard)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_candidate<'g, F, P>(
        &self,
        slot: &Slot<K, V>,
        idx: usize,
        mut resident: Shared<'g, Entry<K, V>>,
        mut resident_ref: &'g Entry<K, V>,
        make_entry: &F,
        predicate: &P,
        is_delete: bool,
        guard: &'g Guard,
    ) -> WriteOutcome<'g, K, V>
    where
        K: Eq + Clone,
        V: Clone,
        F: Fn() -> Entry<K, V>,
        P: Fn(Option<&Entry<K, V>>) -> bool,
    {
        // Once this table has a successor, every write against an already-
        // claimed slot funnels through migration instead of continuing to
        // mutate the old table, so the resize makes bounded progress.
        if self.next_or_none(guard).is_some() {
            self.help_copy_slot(idx, guard);
            return self.go_to_next_or_resize(guard);
        }
        loop {
            if resident_ref.is_prime() {
                self.help_copy_slot(idx, guard);
                return self.go_to_next_or_resize(guard);
            }
            if resident_ref.is_dead() {
                return self.go_to_next_or_resize(guard);
            }
            if !predicate(Some(resident_ref)) {
                return WriteOutcome::Rejected(resident_ref.value().cloned());
            }
            let owned = Owned::new(make_entry());
            match slot
                .entry
                .compare_exchange(resident, owned, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(prev) => {
                    let was_live = resident_ref.is_live();
                    let now_live = !is_delete;
                    if !was_live && now_live {
                        self.size.fetch_add(1, Ordering::AcqRel);
                    } else if was_live && !now_live {
                        self.size.fetch_sub(1, Ordering::AcqRel);
                    }
                    let prior = resident_ref.value().cloned();
                    unsafe { guard.defer_destroy(prev) };
                    return WriteOutcome::Done(prior);
                }
                Err(e) => {
                    resident = e.current;
                    resident_ref = unsafe { resident.deref() };
                }
            }
        }
    }

    /// Drives the slot at `idx` to completion of migration. Returns
    /// `true` if *this call* performed the successor installation.
    pub(crate) fn help_copy_slot(&self, idx: usize, guard: &Guard) -> bool
    where
        K: Eq + Clone,
        V: Clone,
    {
        let next_shared = match self.next_or_none(guard) {
            Some(n) => n,
            None => return false,
        };
        let next_table = unsafe { next_shared.deref() };
        let slot = &self.slots[idx];
        let hash_val = slot.hash.load(Ordering::Acquire);

        if hash_val == UNWRITTEN {
            match slot.entry.compare_exchange(
                Shared::null(),
                Owned::new(Entry::Dead),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return false,
                Err(_) => {} // raced with a claim; fall through to the general loop below
            }
        }

        loop {
            let current = slot.entry.load(Ordering::Acquire, guard);
            if current.is_null() {
                std::hint::spin_loop();
                continue;
            }
            let current_ref = unsafe { current.deref() };
            match current_ref {
                Entry::Tombstone(_) => {
                    match slot.entry.compare_exchange(
                        current,
                        Owned::new(Entry::Dead),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(prev) => unsafe { guard.defer_destroy(prev) },
                        Err(_) => continue,
                    }
                    return false;
                }
                Entry::Live(k, v) => {
                    let prime = Owned::new(Entry::Prime(k.clone(), v.clone()));
                    match slot.entry.compare_exchange(
                        current,
                        prime,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(prev) => {
                            unsafe { guard.defer_destroy(prev) };
                            break;
                        }
                        Err(_) => continue,
                    }
                }
                Entry::Prime(..) => break,
                Entry::Dead => return false,
            }
        }

        let prime_shared = slot.entry.load(Ordering::Acquire, guard);
        let prime_ref = unsafe { prime_shared.deref() };
        let performed_install = match prime_ref.cloned_live_pair() {
            Some((k, v)) => migrate_value(next_table, hash_val, k, v, guard),
            None => false,
        };

        loop {
            let current = slot.entry.load(Ordering::Acquire, guard);
            if current_is_dead(current) {
                break;
            }
            match slot.entry.compare_exchange(
                current,
                Owned::new(Entry::Dead),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(prev) => {
                    unsafe { guard.defer_destroy(prev) };
                    break;
                }
                Err(_) => continue,
            }
        }
        performed_install
    }

    /// Reserves and migrates up to one chunk of this table's slots.
    pub(crate) fn help_copy_chunk(&self, guard: &Guard) -> usize
    where
        K: Eq + Clone,
        V: Clone,
    {
        if self.next_or_none(guard).is_none() {
            return 0;
        }
        let start = self.copy_idx.fetch_add(HELP_COPY_CHUNK, Ordering::AcqRel);
        if start >= self.capacity {
            return 0;
        }
        let end = (start + HELP_COPY_CHUNK).min(self.capacity);
        let mut done = 0usize;
        for idx in start..end {
            self.help_copy_slot(idx, guard);
            done += 1;
        }
        trace!(start, end, "helped copy chunk");
        self.copy_done.fetch_add(done, Ordering::AcqRel);
        done
    }

    /// Removes the Live entry at `idx` if its value satisfies `predicate`.
    /// Returns `true` if this call performed the removal.
    pub(crate) fn sweep_remove_if(
        &self,
        idx: usize,
        predicate: &mut dyn FnMut(&V) -> bool,
        guard: &Guard,
    ) -> bool
    where
        K: Eq + Clone,
        V: Clone,
    {
        let slot = &self.slots[idx];
        loop {
            let current = slot.entry.load(Ordering::Acquire, guard);
            if current.is_null() {
                return false;
            }
            let current_ref = unsafe { current.deref() };
            match current_ref {
                Entry::Live(k, v) => {
                    if !predicate(v) {
                        return false;
                    }
                    let tombstone = Owned::new(Entry::Tombstone(k.clone()));
                    match slot.entry.compare_exchange(
                        current,
                        tombstone,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(prev) => {
                            self.size.fetch_sub(1, Ordering::AcqRel);
                            unsafe { guard.defer_destroy(prev) };
                            return true;
                        }
                        Err(_) => continue,
                    }
                }
                Entry::Prime(..) => {
                    self.help_copy_slot(idx, guard);
                    return false;
                }
                Entry::Tombstone(_) | Entry::Dead => return false,
            }
        }
    }

    /// Computes (and, if needed, installs) this table's successor per the
    /// sizing heuristic and back-pressure scheme. Returns the
    /// (possibly already-existing) successor.
    pub(crate) fn resize<'g>(current: &Table<K, V>, guard: &'g Guard) -> Shared<'g, Table<K, V>>
    where
        K: Eq,
    {
        if let Some(next) = current.next_or_none(guard) {
            return next;
        }

        let live = current.size.load(Ordering::Acquire).max(0) as usize;
        let cap = current.capacity;
        let mut new_cap = if live >= (cap / 4) * 3 {
            live * 8
        } else if live >= cap / 2 {
            live * 4
        } else if live >= cap / 4 {
            live * 2
        } else {
            live
        };
        if current.claimed_slots.load(Ordering::Acquire) >= 2 * live {
            new_cap = 2 * cap;
        }
        if new_cap < cap {
            new_cap = cap;
        }
        if live as isize == current.prev_size {
            new_cap *= 2;
        }
        let new_cap = new_cap.max(1).next_power_of_two().min(MAX_CAPACITY);

        let resizers = current.resizers.fetch_add(1, Ordering::AcqRel) + 1;
        if (new_cap >> 18) > 0 && resizers > 2 {
            for _ in 0..32 {
                if let Some(next) = current.next_or_none(guard) {
                    return next;
                }
                std::hint::spin_loop();
            }
            if let Some(next) = current.next_or_none(guard) {
                return next;
            }
            let sleep_ms = ((new_cap as u64 * resizers as u64) >> 20).clamp(1, 100);
            if resizers > 4 {
                warn!(resizers, sleep_ms, "repeated resize back-pressure, possible thrash");
            }
            std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            if let Some(next) = current.next_or_none(guard) {
                return next;
            }
        }

        let successor = Owned::new(Table::new(new_cap, live as isize, current.size.clone()));
        match current.next.compare_exchange(
            Shared::null(),
            successor,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(installed) => {
                debug!(from = cap, to = new_cap, "resize installed");
                installed
            }
            Err(e) => e.current,
        }
    }
}

fn current_is_dead<K, V>(shared: Shared<'_, Entry<K, V>>) -> bool {
    if shared.is_null() {
        return false;
    }
    unsafe { shared.deref() }.is_dead()
}

/// Installs `(k, v)` into `table` (or its successor, recursively), refusing
/// if a later writer already populated the target slot. Used only by the
/// per-slot copy protocol.
fn migrate_value<'a, K, V>(
    mut table: &'a Table<K, V>,
    hash: u32,
    k: K,
    v: V,
    guard: &'a Guard,
) -> bool
where
    K: Eq + Clone,
    V: Clone,
{
    loop {
        let predicate = |resident: Option<&Entry<K, V>>| resident.is_none();
        let make_entry = || Entry::Live(k.clone(), v.clone());
        match table.write(hash, &k, false, &make_entry, &predicate, guard) {
            WriteOutcome::Done(_) => return true,
            WriteOutcome::Rejected(_) => return false,
            WriteOutcome::GoTo(next) => table = unsafe { next.deref() },
            WriteOutcome::Resize => {
                let next = Table::resize(table, guard);
                table = unsafe { next.deref() };
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // SAFETY: `Table` is being dropped, so nothing else can be
        // concurrently traversing its slots or `next` pointer.
        let guard = unsafe { epoch::unprotected() };
        for slot in self.slots.iter() {
            let entry = slot.entry.swap(Shared::null(), Ordering::Relaxed, guard);
            if !entry.is_null() {
                unsafe { drop(entry.into_owned()) };
            }
        }
        let next = self.next.swap(Shared::null(), Ordering::Relaxed, guard);
        if !next.is_null() {
            unsafe { drop(next.into_owned()) };
        }
    }
}
