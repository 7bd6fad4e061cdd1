//! The search index: locator = `(field key, substring token)`, answers
//! `search(key, query)` (spec §4.3).
//!
//! Every `String` value indexed under `key` is split into whitespace
//! tokens, stopwords dropped, and every substring up to
//! `max_search_substring_length` is filed as its own locator so a query
//! token resolves to its matching records in a single index lookup
//! instead of a per-key scan.

use crate::block::Block;
use concourse_core::search::index_tokens;
use concourse_core::{Value, Write as CWrite};
use std::collections::HashSet;

/// Revisions keyed by `(key, token)`. One write may be filed under many
/// tokens (every substring of every word in its string value).
pub struct SearchBlock {
    inner: Block<(String, String)>,
    max_substring_length: usize,
    /// The original writes fed to `insert`, independent of the token fan
    /// out, so the Database can persist a compact revision file instead of
    /// one row per substring.
    raw_writes: Vec<CWrite>,
}

impl SearchBlock {
    /// An empty, unsealed search block.
    pub fn new(expected_tokens: usize, max_substring_length: usize) -> Self {
        SearchBlock {
            inner: Block::new(expected_tokens),
            max_substring_length,
            raw_writes: Vec::new(),
        }
    }

    /// File `write` under every substring token of its value, if the value
    /// is search-indexable (`String`, not `Tag`/numeric — spec §4.3).
    pub fn insert(&mut self, write: CWrite) {
        if !write.value.is_search_indexable() {
            return;
        }
        let Value::String(text) = &write.value else {
            return;
        };
        let mut seen = HashSet::new();
        for token in index_tokens(text, self.max_substring_length) {
            if seen.insert(token.substring.clone()) {
                self.inner
                    .insert((write.key.clone(), token.substring), write.clone());
            }
        }
        self.raw_writes.push(write);
    }

    /// Drain the raw writes fed to this block since the last drain, in
    /// insertion order. Used by `Database::sync` to persist one compact
    /// revision file per search block instead of one row per substring.
    pub fn take_raw_writes(&mut self) -> Vec<CWrite> {
        std::mem::take(&mut self.raw_writes)
    }

    /// Seal the block against further inserts.
    pub fn seal(&mut self) {
        self.inner.seal();
    }

    /// Whether this block is sealed.
    pub fn is_sealed(&self) -> bool {
        self.inner.is_sealed()
    }

    /// Fast negative test for whether `(key, token)` has any revisions.
    pub fn might_contain(&self, key: &str, token: &str) -> bool {
        self.inner
            .might_contain(&(key.to_string(), token.to_string()))
    }

    /// Every write filed under `(key, token)`, in insertion order.
    pub fn writes_for(&self, key: &str, token: &str) -> impl Iterator<Item = &CWrite> {
        self.inner
            .writes_for(&(key.to_string(), token.to_string()))
    }

    /// Total revisions (token filings, not distinct writes) in this block.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether this block holds any revisions.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
