//! Hash normalization and the key-equality capability.
//!
//! The core never deals in raw hash values: it only ever sees the 32-bit
//! normalized form produced by [`spread`]. A raw hash of zero is remapped to a
//! fixed nonzero constant so that a slot's `hash` word can use `0` to mean
//! "never written" (see `Slot` in `table.rs`).

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// Reserved for "hash slot never written". No normalized hash is ever zero.
pub(crate) const UNWRITTEN: u32 = 0;

/// Substituted whenever a user's hash function produces zero.
const ZERO_HASH_SUBSTITUTE: u32 = 0x5555_5555;

/// Computes the caller-visible hash for `key` via `hasher`, folding a 64-bit
/// hash into 32 bits by XORing the high half into the low half rather than
/// simply truncating, and remaps zero into the nonzero space.
pub(crate) fn spread<K: Hash + ?Sized, S: BuildHasher>(hasher: &S, key: &K) -> u32 {
    let raw = hasher.hash_one(key);
    let folded = (raw ^ (raw >> 32)) as u32;
    if folded == UNWRITTEN {
        ZERO_HASH_SUBSTITUTE
    } else {
        folded
    }
}

/// Default hasher used when a collection is constructed without one supplied.
pub type DefaultHashBuilder = RandomState;
