//! [`LockScope`]: the small sum type the lock manager keys its locks by
//! (spec §5, §9 "Lock identity").

use concourse_core::value::{RecordId, Value};
use std::cmp::Ordering;

/// What a lock guards: a whole record, one field, a range predicate over a
/// key's values, or a wildcard over a whole key (browse/scan).
///
/// `Range` and `Wildcard` do not carry a record id — they block writers
/// whose value falls in (or whose key matches) the guarded predicate,
/// regardless of which record the write lands on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// Whole-record operations.
    Record(RecordId),
    /// Single-field operations: `(record, key)`.
    Field(RecordId, String),
    /// A range predicate over one key's values: `[lo, hi)`.
    Range(String, Value, Value),
    /// A browse/wildcard scan over every value of one key.
    Wildcard(String),
}

impl LockScope {
    fn record_rank(&self) -> RecordId {
        match self {
            LockScope::Record(r) | LockScope::Field(r, _) => *r,
            LockScope::Range(..) | LockScope::Wildcard(_) => 0,
        }
    }

    fn key_rank(&self) -> &str {
        match self {
            LockScope::Record(_) => "",
            LockScope::Field(_, k) | LockScope::Range(k, _, _) | LockScope::Wildcard(k) => k,
        }
    }

    fn range_start_rank(&self) -> Option<&Value> {
        match self {
            LockScope::Range(_, lo, _) => Some(lo),
            _ => None,
        }
    }

    /// Discriminant tiebreaker for scopes that otherwise compare equal on
    /// record/key/range-start (e.g. `Field(1, "k")` vs. a hypothetical
    /// zero-range `Range("k", ..)` sharing the same key).
    fn kind_rank(&self) -> u8 {
        match self {
            LockScope::Record(_) => 0,
            LockScope::Field(_, _) => 1,
            LockScope::Wildcard(_) => 2,
            LockScope::Range(..) => 3,
        }
    }

    /// Whether a write to `(key, value)` on `record` must wait on this
    /// scope, i.e. whether the two scopes overlap. Used by callers that
    /// need to compute which locks a `find` predicate implies, and by
    /// tests asserting the "concurrent write into the interval must wait"
    /// rule (spec §5).
    pub fn covers(&self, record: RecordId, key: &str, value: &Value) -> bool {
        match self {
            LockScope::Record(r) => *r == record,
            LockScope::Field(r, k) => *r == record && k == key,
            LockScope::Wildcard(k) => k == key,
            LockScope::Range(k, lo, hi) => k == key && value >= lo && value < hi,
        }
    }
}

impl PartialOrd for LockScope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Canonical acquisition order: record ascending, then key ascending, then
/// range-start ascending (spec §5). Sorting any batch of scopes with this
/// order before acquiring them all as writes is the engine's deadlock
/// avoidance strategy.
impl Ord for LockScope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record_rank()
            .cmp(&other.record_rank())
            .then_with(|| self.key_rank().cmp(other.key_rank()))
            .then_with(|| self.range_start_rank().cmp(&other.range_start_rank()))
            .then_with(|| self.kind_rank().cmp(&other.kind_rank()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_record_then_key_then_range() {
        let mut scopes = vec![
            LockScope::Field(2, "b".into()),
            LockScope::Record(1),
            LockScope::Field(1, "a".into()),
            LockScope::Range("a".into(), Value::Integer(10), Value::Integer(20)),
        ];
        scopes.sort();
        assert_eq!(scopes[0], LockScope::Record(1));
        assert_eq!(scopes[1], LockScope::Field(1, "a".into()));
    }

    #[test]
    fn range_covers_half_open_interval() {
        let scope = LockScope::Range("score".into(), Value::Integer(10), Value::Integer(20));
        assert!(scope.covers(1, "score", &Value::Integer(10)));
        assert!(!scope.covers(1, "score", &Value::Integer(20)));
        assert!(!scope.covers(1, "other", &Value::Integer(15)));
    }

    #[test]
    fn wildcard_covers_any_record_for_key() {
        let scope = LockScope::Wildcard("name".into());
        assert!(scope.covers(1, "name", &Value::Integer(1)));
        assert!(scope.covers(999, "name", &Value::Integer(1)));
        assert!(!scope.covers(1, "age", &Value::Integer(1)));
    }
}
