//! The secondary index: locator = field key, answers `browse`/`find`.

use crate::block::Block;
use concourse_core::Write as CWrite;

/// Revisions keyed by field key. Backs `browse(key)`/`find(key, op, …)`.
pub struct SecondaryBlock {
    inner: Block<String>,
}

impl SecondaryBlock {
    /// An empty, unsealed secondary block.
    pub fn new(expected_keys: usize) -> Self {
        SecondaryBlock {
            inner: Block::new(expected_keys),
        }
    }

    /// File one write under its field key.
    pub fn insert(&mut self, write: CWrite) {
        let key = write.key.clone();
        self.inner.insert(key, write);
    }

    /// Seal the block against further inserts.
    pub fn seal(&mut self) {
        self.inner.seal();
    }

    /// Whether this block is sealed.
    pub fn is_sealed(&self) -> bool {
        self.inner.is_sealed()
    }

    /// Fast negative test for whether `key` has any revisions here.
    pub fn might_contain(&self, key: &str) -> bool {
        self.inner.might_contain(&key.to_string())
    }

    /// Every write filed under `key`, in insertion order.
    pub fn writes_for(&self, key: &str) -> impl Iterator<Item = &CWrite> {
        self.inner.writes_for(&key.to_string())
    }

    /// Every distinct field key this block holds revisions for.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.locators()
    }

    /// Total revisions in this block.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether this block holds any revisions.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::Value;

    #[test]
    fn files_by_key() {
        let mut block = SecondaryBlock::new(8);
        block.insert(CWrite::add("score", Value::Integer(10), 1, 1));
        block.insert(CWrite::add("score", Value::Integer(20), 2, 2));
        block.insert(CWrite::add("name", Value::String("x".into()), 3, 3));
        assert_eq!(block.writes_for("score").count(), 2);
        assert_eq!(block.writes_for("name").count(), 1);
    }
}
