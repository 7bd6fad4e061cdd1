//! The generic block skeleton shared by the table, secondary, and search
//! index families (spec §4.2): a revision log plus an in-memory index from
//! locator to revision positions and a probabilistic membership filter.
//!
//! A `Locator` is whatever each family addresses revisions by: a record id
//! for the table block, a field key for the secondary block, a
//! `(key, token)` pair for the search block.

use crate::filter::Filter;
use concourse_core::Write as CWrite;
use std::collections::BTreeMap;
use std::hash::Hash;

/// One entry in a block: the locator it is filed under, alongside the
/// underlying write. Kept together because the search block's token
/// locator cannot be re-derived from the write alone.
#[derive(Debug, Clone)]
pub struct Revision<L> {
    /// The key this revision is indexed by.
    pub locator: L,
    /// The underlying write.
    pub write: CWrite,
}

/// A growable, eventually-sealed collection of revisions indexed by
/// locator. One active block accepts new revisions; once sealed (by
/// `Database::sync`) a block is immutable and safe to query concurrently
/// from any number of readers.
pub struct Block<L: Ord + Hash + Clone> {
    revisions: Vec<Revision<L>>,
    index: BTreeMap<L, Vec<usize>>,
    filter: Filter,
    sealed: bool,
}

impl<L: Ord + Hash + Clone> Block<L> {
    /// An empty, unsealed block sized for roughly `expected_items`
    /// distinct locators.
    pub fn new(expected_items: usize) -> Self {
        Block {
            revisions: Vec::new(),
            index: BTreeMap::new(),
            filter: Filter::new(expected_items),
            sealed: false,
        }
    }

    /// Append one revision. Panics if the block is sealed — callers must
    /// check [`Block::is_sealed`] first; a sealed block is only ever
    /// mutated by reconstruction during load.
    pub fn insert(&mut self, locator: L, write: CWrite) {
        assert!(!self.sealed, "cannot insert into a sealed block");
        self.filter.insert(&locator);
        let position = self.revisions.len();
        self.index.entry(locator.clone()).or_default().push(position);
        self.revisions.push(Revision { locator, write });
    }

    /// Mark this block read-only.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether this block accepts no further inserts.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Total revisions stored, across all locators.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Whether this block holds any revisions.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Fast negative membership test: `false` means `locator` definitely
    /// has no revisions in this block.
    pub fn might_contain(&self, locator: &L) -> bool {
        self.filter.might_contain(locator)
    }

    /// Every write filed under `locator`, in insertion (version) order.
    pub fn writes_for(&self, locator: &L) -> impl Iterator<Item = &CWrite> {
        let positions = self.index.get(locator);
        positions
            .into_iter()
            .flatten()
            .map(move |&i| &self.revisions[i].write)
    }

    /// Every revision stored in this block, in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &Revision<L>> {
        self.revisions.iter()
    }

    /// Every distinct locator this block has at least one revision for.
    pub fn locators(&self) -> impl Iterator<Item = &L> {
        self.index.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::Write;
    use concourse_core::Value;

    #[test]
    fn insert_and_lookup_by_locator() {
        let mut block: Block<u64> = Block::new(16);
        block.insert(1, Write::add("name", Value::String("jeff".into()), 1, 10));
        block.insert(2, Write::add("name", Value::String("ann".into()), 2, 11));
        assert_eq!(block.writes_for(&1).count(), 1);
        assert_eq!(block.writes_for(&2).count(), 1);
        assert_eq!(block.writes_for(&3).count(), 0);
        assert!(block.might_contain(&1));
    }

    #[test]
    #[should_panic(expected = "sealed")]
    fn insert_after_seal_panics() {
        let mut block: Block<u64> = Block::new(4);
        block.seal();
        block.insert(1, Write::add("k", Value::Integer(1), 1, 1));
    }
}
