//! A small probabilistic membership filter, used by every [`crate::block::Block`]
//! to reject lookups for a locator it cannot possibly contain without
//! touching the revision log (spec §4.2 "probabilistic filter").

use std::hash::{Hash, Hasher};
use rustc_hash::FxHasher;

/// A Bloom filter over `u64` hash codes. Sized up front from an expected
/// item count; false positives are possible, false negatives are not.
#[derive(Debug, Clone)]
pub struct Filter {
    bits: Vec<u64>,
    num_hashes: u32,
}

impl Filter {
    /// Build a filter sized for `expected_items`, targeting roughly a 1%
    /// false-positive rate.
    pub fn new(expected_items: usize) -> Self {
        let expected_items = expected_items.max(1);
        let num_bits = (expected_items as f64 * 9.6).ceil() as usize;
        let num_words = (num_bits / 64).max(1) + 1;
        let num_hashes = 7;
        Filter {
            bits: vec![0u64; num_words],
            num_hashes,
        }
    }

    fn hash_pair<T: Hash>(item: &T) -> (u64, u64) {
        let mut h1 = FxHasher::default();
        item.hash(&mut h1);
        let a = h1.finish();
        let mut h2 = FxHasher::default();
        (a, 0x9e3779b97f4a7c15u64).hash(&mut h2);
        let b = h2.finish();
        (a, b | 1)
    }

    fn positions<T: Hash>(&self, item: &T) -> impl Iterator<Item = usize> + '_ {
        let (a, b) = Self::hash_pair(item);
        let total_bits = self.bits.len() * 64;
        (0..self.num_hashes).map(move |i| {
            (a.wrapping_add((i as u64).wrapping_mul(b)) as usize) % total_bits
        })
    }

    /// Record `item` as present.
    pub fn insert<T: Hash>(&mut self, item: &T) {
        for pos in self.positions(item).collect::<Vec<_>>() {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    /// `false` means `item` is definitely absent. `true` means it might be
    /// present (subject to the filter's false-positive rate).
    pub fn might_contain<T: Hash>(&self, item: &T) -> bool {
        self.positions(item)
            .all(|pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
    }
}
