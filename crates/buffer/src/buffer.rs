//! Limbo: the durable, ordered, scan-able write-ahead buffer (spec §4.1).
//!
//! `Buffer` owns an ordered list of [`Page`]s. Writes always land in the
//! newest (current) page; reads mirror the `Store` interface by folding
//! every page's writes in version order (spec §4.4).

use crate::page::{estimated_frame_len, Page};
use concourse_core::error::{Error, Result};
use concourse_core::replay;
use concourse_core::search::matches_search;
use concourse_core::value::{Operator, RecordId, Value};
use concourse_core::{Action, Store, Write as CWrite};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The write-ahead buffer: an ordered, durable log of recent `Write`s
/// partitioned into fixed-size pages.
pub struct Buffer {
    dir: PathBuf,
    page_size: usize,
    pages: RwLock<VecDeque<Page>>,
}

impl Buffer {
    /// Open (or create) the buffer rooted at `dir`. `system_id` must match
    /// the one recorded in the Database's own directory (spec §6); pages
    /// created fresh by this call are stamped with it.
    pub fn open(dir: &Path, system_id: [u8; 16], page_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        let mut entries: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)
            .map_err(Error::Io)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                if !name.starts_with("page") {
                    return None;
                }
                name.trim_start_matches("page").parse::<u64>().ok().map(|n| (n, e.path()))
            })
            .collect();
        entries.sort_by_key(|(n, _)| *n);

        let mut pages = VecDeque::new();
        for (number, _) in &entries {
            let (mut page, _writes) = Page::open(dir, *number).map_err(Error::Io)?;
            if page.size() as usize >= page_size {
                page.seal();
            }
            pages.push_back(page);
        }
        if pages.is_empty() {
            pages.push_back(Page::create(dir, 0, system_id).map_err(Error::Io)?);
        } else if pages.back().map(|p| p.is_sealed()).unwrap_or(false) {
            let next = pages.back().unwrap().page_number() + 1;
            pages.push_back(Page::create(dir, next, system_id).map_err(Error::Io)?);
        }

        Ok(Buffer {
            dir: dir.to_path_buf(),
            page_size,
            pages: RwLock::new(pages),
        })
    }

    /// Append `write`, deferring fsync (spec §4.1 `insert`). Fails only
    /// when the underlying disk is exhausted, surfaced as `Error::Fatal`
    /// per spec §7.
    pub fn insert(&self, write: CWrite) -> Result<()> {
        self.accept(write, false)
    }

    /// Append `write`, optionally forcing an immediate fsync. All explicit
    /// transaction commits call this with `sync = true` on their last
    /// write (spec §4.1 group-sync).
    pub fn accept(&self, write: CWrite, sync: bool) -> Result<()> {
        let mut pages = self.pages.write();
        let needed = estimated_frame_len(&write);
        let rotate = pages
            .back()
            .map(|p| p.is_sealed() || p.would_overflow(needed, self.page_size))
            .unwrap_or(true);
        if rotate {
            if let Some(last) = pages.back_mut() {
                last.seal();
            }
            let next_number = pages.back().map(|p| p.page_number() + 1).unwrap_or(0);
            let system_id = pages.back().map(|p| p.system_id()).unwrap_or([0u8; 16]);
            let fresh = Page::create(&self.dir, next_number, system_id).map_err(|e| {
                Error::Fatal(format!("buffer disk exhausted creating new page: {e}"))
            })?;
            pages.push_back(fresh);
        }
        let page = pages.back_mut().expect("buffer always has a current page");
        page.append(&write, sync)
            .map_err(|e| Error::Fatal(format!("buffer write failed: {e}")))?;
        debug!(record = write.record, key = %write.key, version = write.version, "buffer accept");
        Ok(())
    }

    /// Force all pending frames of the current page to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut pages = self.pages.write();
        if let Some(last) = pages.back_mut() {
            last.sync().map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Whether `record` appears anywhere in the buffer's pages.
    pub fn contains_write_for(&self, record: RecordId) -> bool {
        self.all_writes(None).iter().any(|w| w.record == record)
    }

    /// The oldest page, if it is sealed and therefore eligible for
    /// transport, together with its writes in append order (spec §4.7).
    pub fn oldest_transportable(&self) -> Option<(u64, Vec<CWrite>)> {
        let mut pages = self.pages.write();
        let is_transportable = pages
            .front()
            .map(|p| p.is_sealed())
            .unwrap_or(false)
            && pages.len() > 1; // never transport the single live page
        if !is_transportable {
            return None;
        }
        let front = pages.front_mut().unwrap();
        let number = front.page_number();
        match front.scan() {
            Ok(writes) => Some((number, writes)),
            Err(e) => {
                warn!("failed to scan oldest buffer page {number}: {e}");
                None
            }
        }
    }

    /// Remove the oldest page's file from disk and drop it from the
    /// in-memory list. Called by the Transporter after the Database has
    /// durably indexed every write in the page (spec §4.7 step 4) — this
    /// is the instant the Buffer⊕Database partitioning invariant flips for
    /// that page's writes.
    pub fn retire_oldest(&self, expected_page_number: u64) -> Result<()> {
        let mut pages = self.pages.write();
        match pages.front() {
            Some(p) if p.page_number() == expected_page_number && p.is_sealed() => {
                let page = pages.pop_front().unwrap();
                page.remove_file().map_err(Error::Io)?;
                Ok(())
            }
            Some(p) => Err(Error::InvalidArgument(format!(
                "expected oldest page {expected_page_number}, found {} (sealed={})",
                p.page_number(),
                p.is_sealed()
            ))),
            None => Err(Error::InvalidArgument("buffer has no pages".into())),
        }
    }

    /// Every write currently held by the buffer, in append (version)
    /// order, optionally bounded to `version <= upto`.
    pub fn all_writes(&self, upto: Option<u64>) -> Vec<CWrite> {
        let mut pages = self.pages.write();
        let mut out = Vec::new();
        for page in pages.iter_mut() {
            match page.scan() {
                Ok(writes) => out.extend(writes),
                Err(e) => warn!("failed to scan buffer page {}: {e}", page.page_number()),
            }
        }
        if let Some(t) = upto {
            out.retain(|w| w.version <= t);
        }
        out
    }

    /// Number of pages currently held (including the live, unsealed one).
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}

impl Store for Buffer {
    fn select(&self, record: RecordId) -> Result<concourse_core::RecordView> {
        self.select_at(record, u64::MAX)
    }

    fn select_at(&self, record: RecordId, t: u64) -> Result<concourse_core::RecordView> {
        let writes = self.all_writes(Some(t));
        Ok(replay::fold_record(writes.iter(), record, Some(t))
            .into_iter()
            .collect())
    }

    fn select_key(&self, key: &str, record: RecordId) -> Result<BTreeSet<Value>> {
        self.select_key_at(key, record, u64::MAX)
    }

    fn select_key_at(&self, key: &str, record: RecordId, t: u64) -> Result<BTreeSet<Value>> {
        let writes = self.all_writes(Some(t));
        Ok(replay::fold_field(writes.iter(), key, record, Some(t)))
    }

    fn browse(&self, key: &str) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        self.browse_at(key, u64::MAX)
    }

    fn browse_at(&self, key: &str, t: u64) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        let writes = self.all_writes(Some(t));
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
        concourse_core::operators::evaluate(&browse, operator, values)
    }

    fn search(&self, key: &str, query: &str) -> Result<HashSet<RecordId>> {
        let writes = self.all_writes(None);
        let mut state: std::collections::HashMap<RecordId, BTreeSet<Value>> =
            std::collections::HashMap::new();
        for w in &writes {
            if w.key != key {
                continue;
            }
            let set = state.entry(w.record).or_default();
            match w.action {
                Action::Add => {
                    set.insert(w.value.clone());
                }
                Action::Remove => {
                    set.remove(&w.value);
                }
            }
        }
        let mut matches = HashSet::new();
        for (record, values) in state {
            for v in values {
                if let Value::String(s) = &v {
                    if matches_search(s, query) {
                        matches.insert(record);
                        break;
                    }
                }
            }
        }
        Ok(matches)
    }

    fn chronologize(
        &self,
        key: &str,
        record: RecordId,
        t_start: u64,
        t_end: u64,
    ) -> Result<BTreeMap<u64, BTreeSet<Value>>> {
        let writes = self.all_writes(Some(t_end));
        let mut out = BTreeMap::new();
        let mut running = BTreeSet::new();
        for w in writes.iter().filter(|w| w.record == record && w.key == key) {
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
        let writes = self.all_writes(None);
        Ok(replay::audit_lines(
            writes.iter().filter(|w| w.record == record),
        ))
    }

    fn audit_key(&self, key: &str, record: RecordId) -> Result<BTreeMap<u64, String>> {
        let writes = self.all_writes(None);
        Ok(replay::audit_lines(
            writes.iter().filter(|w| w.record == record && w.key == key),
        ))
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
        let writes = self.all_writes(None);
        Ok(replay::inventory_from_writes(writes.iter()).contains(&record))
    }

    fn get_all_records(&self) -> Result<Vec<RecordId>> {
        let writes = self.all_writes(None);
        let mut records: Vec<RecordId> = replay::inventory_from_writes(writes.iter())
            .into_iter()
            .collect();
        records.sort_unstable();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn add(key: &str, value: Value, record: RecordId, version: u64) -> CWrite {
        CWrite::add(key, value, record, version)
    }

    #[test]
    fn insert_then_select() {
        let dir = tempdir().unwrap();
        let buf = Buffer::open(dir.path(), [1; 16], 8192).unwrap();
        buf.insert(add("name", Value::String("jeff".into()), 17, 1))
            .unwrap();
        let values = buf.select_key("name", 17).unwrap();
        assert_eq!(values, BTreeSet::from([Value::String("jeff".into())]));
    }

    #[test]
    fn reopen_preserves_writes() {
        let dir = tempdir().unwrap();
        {
            let buf = Buffer::open(dir.path(), [1; 16], 8192).unwrap();
            buf.insert(add("age", Value::Integer(30), 1, 1)).unwrap();
            buf.sync().unwrap();
        }
        let buf = Buffer::open(dir.path(), [1; 16], 8192).unwrap();
        assert_eq!(
            buf.select_key("age", 1).unwrap(),
            BTreeSet::from([Value::Integer(30)])
        );
    }

    #[test]
    fn page_rotation_on_overflow() {
        let dir = tempdir().unwrap();
        // A tiny page size forces rotation after the first write.
        let buf = Buffer::open(dir.path(), [1; 16], 64).unwrap();
        for i in 0..20u64 {
            buf.insert(add("k", Value::Integer(i as i32), i, i + 1))
                .unwrap();
        }
        assert!(buf.page_count() > 1);
        assert_eq!(buf.get_all_records().unwrap().len(), 20);
    }

    #[test]
    fn transport_removes_oldest_sealed_page() {
        let dir = tempdir().unwrap();
        let buf = Buffer::open(dir.path(), [1; 16], 48).unwrap();
        for i in 0..10u64 {
            buf.insert(add("k", Value::Integer(i as i32), i, i + 1))
                .unwrap();
        }
        let before = buf.page_count();
        assert!(before > 1);
        if let Some((number, writes)) = buf.oldest_transportable() {
            assert!(!writes.is_empty());
            buf.retire_oldest(number).unwrap();
            assert_eq!(buf.page_count(), before - 1);
        } else {
            panic!("expected a transportable page");
        }
    }
}
