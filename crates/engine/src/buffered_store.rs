//! `BufferedStore`: Buffer composed over Database (spec §2, §4.4).
//!
//! Every read merges the two layers at the *write* level — gather the
//! relevant raw `Write`s from both the Database (indexed lookup) and the
//! Buffer (scan), concatenate, then fold once in version order. This is
//! equivalent to "compute the Database result, then replay Buffer writes
//! on top" (the wording spec §4.4 uses) but avoids re-deriving per-type
//! merge logic for every operation.

use concourse_buffer::Buffer;
use concourse_core::error::Result;
use concourse_core::replay;
use concourse_core::search::matches_search;
use concourse_core::value::{Operator, RecordId, Value};
use concourse_core::{operators, Action, RecordView, Store, Write as CWrite};
use concourse_storage::Database;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Composes a [`Buffer`] over a [`Database`]: writes go to the Buffer,
/// reads merge both (spec §2 row "BufferedStore").
pub struct BufferedStore {
    buffer: Buffer,
    database: Database,
}

impl BufferedStore {
    /// Compose `buffer` over `database`.
    pub fn new(buffer: Buffer, database: Database) -> Self {
        BufferedStore { buffer, database }
    }

    /// The underlying Buffer, for the Transporter and diagnostics.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The underlying Database, for the Transporter and diagnostics.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Write `write` straight to the Buffer (spec §4.1 `insert`/`accept`).
    /// `BufferedStore` itself never writes to the Database directly — only
    /// the Transporter does, once a page is sealed.
    pub fn accept(&self, write: CWrite, sync: bool) -> Result<()> {
        self.buffer.accept(write, sync)
    }

    fn merged_writes_for_record(&self, record: RecordId, upto: Option<u64>) -> Vec<CWrite> {
        let mut writes = self.database.writes_for_record(record);
        writes.extend(
            self.buffer
                .all_writes(upto)
                .into_iter()
                .filter(|w| w.record == record),
        );
        if let Some(t) = upto {
            writes.retain(|w| w.version <= t);
        }
        writes.sort_by_key(|w| w.version);
        writes
    }

    fn merged_writes_for_key(&self, key: &str, upto: Option<u64>) -> Vec<CWrite> {
        let mut writes = self.database.writes_for_key(key);
        writes.extend(
            self.buffer
                .all_writes(upto)
                .into_iter()
                .filter(|w| w.key == key),
        );
        if let Some(t) = upto {
            writes.retain(|w| w.version <= t);
        }
        writes.sort_by_key(|w| w.version);
        writes
    }
}

impl Store for BufferedStore {
    fn select(&self, record: RecordId) -> Result<RecordView> {
        self.select_at(record, u64::MAX)
    }

    fn select_at(&self, record: RecordId, t: u64) -> Result<RecordView> {
        let writes = self.merged_writes_for_record(record, Some(t));
        Ok(replay::fold_record(writes.iter(), record, Some(t))
            .into_iter()
            .collect())
    }

    fn select_key(&self, key: &str, record: RecordId) -> Result<BTreeSet<Value>> {
        self.select_key_at(key, record, u64::MAX)
    }

    fn select_key_at(&self, key: &str, record: RecordId, t: u64) -> Result<BTreeSet<Value>> {
        let writes = self.merged_writes_for_record(record, Some(t));
        Ok(replay::fold_field(writes.iter(), key, record, Some(t)))
    }

    fn browse(&self, key: &str) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        self.browse_at(key, u64::MAX)
    }

    fn browse_at(&self, key: &str, t: u64) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        let writes = self.merged_writes_for_key(key, Some(t));
        Ok(replay::fold_browse(writes.iter(), key, Some(t)))
    }

    fn find(&self, key: &str, operator: Operator, values: &[Value]) -> Result<HashSet<RecordId>> {
        self.find_at(key, operator, values, u64::MAX)
    }

    fn find_at(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        t: u64,
    ) -> Result<HashSet<RecordId>> {
        let browse = self.browse_at(key, t)?;
        operators::evaluate(&browse, operator, values)
    }

    fn search(&self, key: &str, query: &str) -> Result<HashSet<RecordId>> {
        let db_hits = self.database.search(key, query)?;
        let buffer_hits = self.buffer.search(key, query)?;
        let candidates: HashSet<RecordId> = db_hits.union(&buffer_hits).copied().collect();
        let mut out = HashSet::new();
        for record in candidates {
            let values = self.select_key(key, record)?;
            if values
                .iter()
                .any(|v| matches!(v, Value::String(s) if matches_search(s, query)))
            {
                out.insert(record);
            }
        }
        Ok(out)
    }

    fn chronologize(
        &self,
        key: &str,
        record: RecordId,
        t_start: u64,
        t_end: u64,
    ) -> Result<BTreeMap<u64, BTreeSet<Value>>> {
        let mut writes = self.merged_writes_for_record(record, Some(t_end));
        writes.retain(|w| w.key == key);
        let mut out = BTreeMap::new();
        let mut running = BTreeSet::new();
        for w in &writes {
            match w.action {
                Action::Add => {
                    running.insert(w.value.clone());
                }
                Action::Remove => {
                    running.remove(&w.value);
                }
            }
            if w.version >= t_start && w.version <= t_end {
                out.insert(w.version, running.clone());
            }
        }
        Ok(out)
    }

    fn audit(&self, record: RecordId) -> Result<BTreeMap<u64, String>> {
        let writes = self.merged_writes_for_record(record, None);
        Ok(replay::audit_lines(writes.iter()))
    }

    fn audit_key(&self, key: &str, record: RecordId) -> Result<BTreeMap<u64, String>> {
        let writes = self.merged_writes_for_record(record, None);
        Ok(replay::audit_lines(writes.iter().filter(|w| w.key == key)))
    }

    fn describe(&self, record: RecordId) -> Result<HashSet<String>> {
        self.describe_at(record, u64::MAX)
    }

    fn describe_at(&self, record: RecordId, t: u64) -> Result<HashSet<String>> {
        Ok(self.select_at(record, t)?.into_keys().collect())
    }

    fn verify(&self, key: &str, value: &Value, record: RecordId) -> Result<bool> {
        Ok(self.select_key(key, record)?.contains(value))
    }

    fn verify_at(&self, key: &str, value: &Value, record: RecordId, t: u64) -> Result<bool> {
        Ok(self.select_key_at(key, record, t)?.contains(value))
    }

    fn contains(&self, record: RecordId) -> Result<bool> {
        if self.database.contains(record)? {
            return Ok(true);
        }
        Ok(self.buffer.contains_write_for(record))
    }

    fn get_all_records(&self) -> Result<Vec<RecordId>> {
        let mut records: BTreeSet<RecordId> = self.database.get_all_records()?.into_iter().collect();
        records.extend(
            replay::inventory_from_writes(self.buffer.all_writes(None).iter()).into_iter(),
        );
        Ok(records.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::Write as W;
    use tempfile::tempdir;

    fn store() -> BufferedStore {
        let dir = tempdir().unwrap();
        let buffer = Buffer::open(&dir.path().join("buffer"), [1; 16], 8192).unwrap();
        let database = Database::open(&dir.path().join("db"), 40).unwrap();
        std::mem::forget(dir); // keep the tempdir alive for the test's duration
        BufferedStore::new(buffer, database)
    }

    #[test]
    fn write_lands_in_buffer_and_reads_merge() {
        let store = store();
        store
            .accept(W::add("name", Value::String("jeff".into()), 17, 1), true)
            .unwrap();
        assert_eq!(
            store.select_key("name", 17).unwrap(),
            BTreeSet::from([Value::String("jeff".into())])
        );
    }

    #[test]
    fn database_and_buffer_writes_both_contribute() {
        let store = store();
        store
            .database
            .accept(W::add("age", Value::Integer(30), 1, 1), true)
            .unwrap();
        store
            .accept(W::add("age", Value::Integer(31), 1, 2), true)
            .unwrap();
        assert_eq!(
            store.select_key("age", 1).unwrap(),
            BTreeSet::from([Value::Integer(30), Value::Integer(31)])
        );
    }

    #[test]
    fn buffer_removal_overrides_database_add() {
        let store = store();
        store
            .database
            .accept(W::add("x", Value::Integer(1), 1, 1), true)
            .unwrap();
        store
            .accept(W::remove("x", Value::Integer(1), 1, 2), true)
            .unwrap();
        assert!(store.select_key("x", 1).unwrap().is_empty());
    }

    #[test]
    fn search_recall_across_both_layers() {
        let store = store();
        store
            .database
            .accept(
                W::add("bio", Value::String("the quick brown fox".into()), 1, 1),
                true,
            )
            .unwrap();
        store
            .accept(
                W::add("bio", Value::String("lazy dog".into()), 2, 2),
                true,
            )
            .unwrap();
        let hits = store.search("bio", "quick").unwrap();
        assert_eq!(hits, HashSet::from([1]));
        let hits = store.search("bio", "dog").unwrap();
        assert_eq!(hits, HashSet::from([2]));
    }
}
