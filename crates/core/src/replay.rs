//! Fold a stream of `Write`s into effective state (spec §3 invariant 2).
//!
//! Shared by every layer that must replay writes rather than look them up
//! in an index: the Buffer (always), and any layer reconstructing a
//! historical snapshot.

use crate::value::{RecordId, Value};
use crate::write::{Action, Write};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Apply one write to a `key -> value-set` map: ADD inserts, REMOVE
/// deletes. A REMOVE of an absent value is a no-op (spec §3 invariant 2
/// tolerates this during recovery).
pub fn apply_to_field_map(state: &mut BTreeMap<String, BTreeSet<Value>>, write: &Write) {
    let set = state.entry(write.key.clone()).or_default();
    match write.action {
        Action::Add => {
            set.insert(write.value.clone());
        }
        Action::Remove => {
            set.remove(&write.value);
        }
    }
}

/// Fold `writes` (assumed already in version order) into the per-record
/// field map, restricted to writes with `version <= upto` if given.
pub fn fold_record<'a>(
    writes: impl Iterator<Item = &'a Write>,
    record: RecordId,
    upto: Option<u64>,
) -> BTreeMap<String, BTreeSet<Value>> {
    let mut state = BTreeMap::new();
    for write in writes {
        if write.record != record {
            continue;
        }
        if let Some(t) = upto {
            if write.version > t {
                continue;
            }
        }
        apply_to_field_map(&mut state, write);
    }
    state.retain(|_, set| !set.is_empty());
    state
}

/// Fold `writes` into the value-set of one `(key, record)` field.
pub fn fold_field<'a>(
    writes: impl Iterator<Item = &'a Write>,
    key: &str,
    record: RecordId,
    upto: Option<u64>,
) -> BTreeSet<Value> {
    let mut set = BTreeSet::new();
    for write in writes {
        if write.record != record || write.key != key {
            continue;
        }
        if let Some(t) = upto {
            if write.version > t {
                continue;
            }
        }
        match write.action {
            Action::Add => {
                set.insert(write.value.clone());
            }
            Action::Remove => {
                set.remove(&write.value);
            }
        }
    }
    set
}

/// Fold `writes` into `browse(key)`'s `value -> set<record>` view.
pub fn fold_browse<'a>(
    writes: impl Iterator<Item = &'a Write>,
    key: &str,
    upto: Option<u64>,
) -> BTreeMap<Value, HashSet<RecordId>> {
    let mut state: BTreeMap<Value, HashSet<RecordId>> = BTreeMap::new();
    for write in writes {
        if write.key != key {
            continue;
        }
        if let Some(t) = upto {
            if write.version > t {
                continue;
            }
        }
        let entry = state.entry(write.value.clone()).or_default();
        match write.action {
            Action::Add => {
                entry.insert(write.record);
            }
            Action::Remove => {
                entry.remove(&write.record);
            }
        }
    }
    state.retain(|_, set| !set.is_empty());
    state
}

/// Every record id that has received at least one ADD anywhere in
/// `writes` and still exists (i.e. is not fully erased) — approximation
/// used by scan-only layers; the Inventory (storage crate) is the
/// authoritative source once writes are transported.
pub fn inventory_from_writes<'a>(writes: impl Iterator<Item = &'a Write>) -> HashSet<RecordId> {
    let mut ever_added: HashMap<RecordId, bool> = HashMap::new();
    for write in writes {
        match write.action {
            Action::Add => {
                ever_added.insert(write.record, true);
            }
            Action::Remove => {
                ever_added.entry(write.record).or_insert(false);
            }
        }
    }
    ever_added
        .into_iter()
        .filter_map(|(r, added)| if added { Some(r) } else { None })
        .collect()
}

/// Human-readable audit line formatter, matching `Write::describe`
/// ordering rules (ties broken by insertion order — spec §9 Open
/// Question (a)).
pub fn audit_lines<'a>(
    writes: impl Iterator<Item = &'a Write>,
) -> BTreeMap<u64, String> {
    let mut out = BTreeMap::new();
    for write in writes {
        out.insert(write.version, write.describe());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn w(action: Action, key: &str, value: Value, record: RecordId, version: u64) -> Write {
        Write {
            action,
            key: key.to_string(),
            value,
            record,
            version,
        }
    }

    #[test]
    fn add_remove_duality() {
        let writes = vec![
            w(Action::Add, "name", Value::String("jeff".into()), 1, 1),
            w(Action::Remove, "name", Value::String("jeff".into()), 1, 2),
        ];
        let set = fold_field(writes.iter(), "name", 1, None);
        assert!(set.is_empty());
    }

    #[test]
    fn historical_fold_respects_upto() {
        let writes = vec![
            w(Action::Add, "age", Value::Integer(30), 1, 10),
            w(Action::Remove, "age", Value::Integer(30), 1, 20),
            w(Action::Add, "age", Value::Integer(31), 1, 30),
        ];
        let at_15 = fold_field(writes.iter(), "age", 1, Some(15));
        assert_eq!(at_15, BTreeSet::from([Value::Integer(30)]));
        let at_30 = fold_field(writes.iter(), "age", 1, Some(30));
        assert_eq!(at_30, BTreeSet::from([Value::Integer(31)]));
    }

    #[test]
    fn browse_groups_by_value() {
        let writes = vec![
            w(Action::Add, "score", Value::Integer(10), 1, 1),
            w(Action::Add, "score", Value::Integer(20), 2, 2),
        ];
        let browse = fold_browse(writes.iter(), "score", None);
        assert_eq!(browse.len(), 2);
        assert!(browse[&Value::Integer(10)].contains(&1));
        assert!(browse[&Value::Integer(20)].contains(&2));
    }
}
