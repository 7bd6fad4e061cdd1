//! The shared `Store` read/write contract (spec §4.4).
//!
//! Every layer — Buffer, Database, BufferedStore, AtomicOperation,
//! Transaction — implements the same surface rather than a deep class
//! hierarchy (spec §9 "Polymorphic Store layers"). Each read operation has
//! a timestamp-qualified variant (`_at`) that reports historical state.

use crate::error::Result;
use crate::value::{Operator, RecordId, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A field's current (or historical) value-set view of one record.
pub type RecordView = HashMap<String, BTreeSet<Value>>;

/// The shared read/write contract implemented by every layer of the store.
///
/// Implementors must be safe to call concurrently from multiple threads.
pub trait Store: Send + Sync {
    /// All fields of `record` and their current value-sets.
    fn select(&self, record: RecordId) -> Result<RecordView>;

    /// `select`, but as of historical version `t`.
    fn select_at(&self, record: RecordId, t: u64) -> Result<RecordView>;

    /// The current value-set of `(key, record)`.
    fn select_key(&self, key: &str, record: RecordId) -> Result<BTreeSet<Value>>;

    /// `select_key`, but as of historical version `t`.
    fn select_key_at(&self, key: &str, record: RecordId, t: u64) -> Result<BTreeSet<Value>>;

    /// All records that currently hold each distinct value of `key`,
    /// keyed by value.
    fn browse(&self, key: &str) -> Result<BTreeMap<Value, HashSet<RecordId>>>;

    /// `browse`, but as of historical version `t`.
    fn browse_at(&self, key: &str, t: u64) -> Result<BTreeMap<Value, HashSet<RecordId>>>;

    /// Records whose `key` field satisfies `operator` against `values`.
    fn find(&self, key: &str, operator: Operator, values: &[Value]) -> Result<HashSet<RecordId>>;

    /// `find`, but as of historical version `t`.
    fn find_at(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        t: u64,
    ) -> Result<HashSet<RecordId>>;

    /// Full-text search of `key`'s string values for `query`.
    fn search(&self, key: &str, query: &str) -> Result<HashSet<RecordId>>;

    /// For every version where `(key, record)`'s value-set changed, the
    /// snapshot at that version, restricted to
    /// `[t_start, t_end]` inclusive (§11 SPEC_FULL.md).
    fn chronologize(
        &self,
        key: &str,
        record: RecordId,
        t_start: u64,
        t_end: u64,
    ) -> Result<BTreeMap<u64, BTreeSet<Value>>>;

    /// Human-readable change log for every field of `record`.
    fn audit(&self, record: RecordId) -> Result<BTreeMap<u64, String>>;

    /// Human-readable change log for `(key, record)` only.
    fn audit_key(&self, key: &str, record: RecordId) -> Result<BTreeMap<u64, String>>;

    /// Keys with a non-empty current value-set.
    fn describe(&self, record: RecordId) -> Result<HashSet<String>>;

    /// `describe`, but as of historical version `t`.
    fn describe_at(&self, record: RecordId, t: u64) -> Result<HashSet<String>>;

    /// Whether `value` is currently in `(key, record)`'s value-set.
    fn verify(&self, key: &str, value: &Value, record: RecordId) -> Result<bool>;

    /// `verify`, but as of historical version `t`.
    fn verify_at(&self, key: &str, value: &Value, record: RecordId, t: u64) -> Result<bool>;

    /// Whether `record` has ever received an ADD (spec §3 invariant 5).
    fn contains(&self, record: RecordId) -> Result<bool>;

    /// Every record id currently in the Inventory.
    fn get_all_records(&self) -> Result<Vec<RecordId>>;
}

/// A pre-parsed criteria AST node, produced by the (out-of-scope) CCL
/// parser. The engine only consumes its evaluation against a `Store`
/// (spec §1 "Out of scope: Query-language parser").
pub trait Criteria: Send + Sync {
    /// Evaluate this criteria against `store`, optionally as of historical
    /// version `at`, returning the matching record ids.
    fn evaluate(&self, store: &dyn Store, at: Option<u64>) -> Result<HashSet<RecordId>>;
}

/// A `Criteria` leaf: `key operator values`, the most common case and the
/// one every `find` call ultimately reduces to.
pub struct KeyOperatorCriteria {
    /// Field key to filter on.
    pub key: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Operand values (`Between` expects exactly two).
    pub values: Vec<Value>,
}

impl Criteria for KeyOperatorCriteria {
    fn evaluate(&self, store: &dyn Store, at: Option<u64>) -> Result<HashSet<RecordId>> {
        match at {
            Some(t) => store.find_at(&self.key, self.operator, &self.values, t),
            None => store.find(&self.key, self.operator, &self.values),
        }
    }
}
