//! The Database (`PermanentStore`): durable, indexed, read-optimized
//! storage of every transported write (spec §4.2).
//!
//! Writes are fanned out into three index families that share the
//! [`crate::block::Block`] skeleton. `sync()` seals the active blocks and
//! opens fresh ones — the only moment a block becomes immutable and
//! safe to persist.

use crate::cache::RecordCache;
use crate::inventory::Inventory;
use crate::search_index::SearchBlock;
use crate::secondary::SecondaryBlock;
use crate::table::TableBlock;
use concourse_core::error::{Error, Result};
use concourse_core::value::{Operator, RecordId, Value};
use concourse_core::{operators, replay, Action, Store, Write as CWrite};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const TABLE_DIR: &str = "table";
const SECONDARY_DIR: &str = "secondary";
const SEARCH_DIR: &str = "search";
const INVENTORY_FILE: &str = "inventory";

/// Durable, indexed storage of every write the Transporter has accepted.
pub struct Database {
    dir: PathBuf,
    max_search_substring_length: usize,
    next_block_id: AtomicU64,
    table_active: RwLock<TableBlock>,
    table_sealed: RwLock<Vec<(u64, TableBlock)>>,
    secondary_active: RwLock<SecondaryBlock>,
    secondary_sealed: RwLock<Vec<(u64, SecondaryBlock)>>,
    search_active: RwLock<SearchBlock>,
    search_sealed: RwLock<Vec<(u64, SearchBlock)>>,
    /// Writes fed into the current (unsealed) active blocks, mirrored here
    /// purely so `sync()` has something contiguous to persist as each
    /// family's revision file without re-deriving it from the block index.
    pending: RwLock<Vec<CWrite>>,
    inventory: Inventory,
    cache: RecordCache,
}

impl Database {
    /// Open (or create) the database rooted at `dir`, reloading any
    /// previously sealed blocks and the inventory file.
    pub fn open(dir: &Path, max_search_substring_length: usize) -> Result<Self> {
        for sub in [TABLE_DIR, SECONDARY_DIR, SEARCH_DIR] {
            std::fs::create_dir_all(dir.join(sub)).map_err(Error::Io)?;
        }

        let mut table_sealed = Vec::new();
        let mut next_block_id = 0u64;
        for (id, writes) in load_revision_files(dir, TABLE_DIR)? {
            let mut block = TableBlock::new(writes.len().max(1));
            for w in writes {
                block.insert(w);
            }
            block.seal();
            next_block_id = next_block_id.max(id + 1);
            table_sealed.push((id, block));
        }

        let mut secondary_sealed = Vec::new();
        for (id, writes) in load_revision_files(dir, SECONDARY_DIR)? {
            let mut block = SecondaryBlock::new(writes.len().max(1));
            for w in writes {
                block.insert(w);
            }
            block.seal();
            next_block_id = next_block_id.max(id + 1);
            secondary_sealed.push((id, block));
        }

        let mut search_sealed = Vec::new();
        for (id, writes) in load_revision_files(dir, SEARCH_DIR)? {
            let mut block = SearchBlock::new(writes.len().max(1), max_search_substring_length);
            for w in writes {
                block.insert(w);
            }
            block.seal();
            next_block_id = next_block_id.max(id + 1);
            search_sealed.push((id, block));
        }

        let inventory_path = dir.join(INVENTORY_FILE);
        let inventory = if inventory_path.exists() {
            let bytes = std::fs::read(&inventory_path).map_err(Error::Io)?;
            Inventory::decode(&bytes)
        } else {
            Inventory::new()
        };

        Ok(Database {
            dir: dir.to_path_buf(),
            max_search_substring_length,
            next_block_id: AtomicU64::new(next_block_id),
            table_active: RwLock::new(TableBlock::new(1024)),
            table_sealed: RwLock::new(table_sealed),
            secondary_active: RwLock::new(SecondaryBlock::new(1024)),
            secondary_sealed: RwLock::new(secondary_sealed),
            search_active: RwLock::new(SearchBlock::new(1024, max_search_substring_length)),
            search_sealed: RwLock::new(search_sealed),
            pending: RwLock::new(Vec::new()),
            inventory,
            cache: RecordCache::new(4096),
        })
    }

    /// Fan one write out into the three active index blocks, updating the
    /// inventory. `sync` additionally seals and persists the active blocks
    /// (spec §4.2 `accept(write, sync)`).
    pub fn accept(&self, write: CWrite, sync: bool) -> Result<()> {
        if write.action == Action::Add {
            self.inventory.add(write.record);
        }
        self.table_active.write().insert(write.clone());
        self.secondary_active.write().insert(write.clone());
        self.search_active.write().insert(write.clone());
        self.pending.write().push(write);
        self.cache.invalidate_all();
        if sync {
            self.sync()?;
        }
        Ok(())
    }

    /// Seal every active block, persist it, and open a fresh active block
    /// in its place. Called by the Transporter between indexing batches.
    pub fn sync(&self) -> Result<()> {
        self.seal_and_persist_table()?;
        self.seal_and_persist_secondary()?;
        self.seal_and_persist_search()?;
        self.persist_inventory()?;
        debug!("database sync: active blocks sealed and persisted");
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_block_id.fetch_add(1, Ordering::SeqCst)
    }

    fn seal_and_persist_table(&self) -> Result<()> {
        let mut active = self.table_active.write();
        if active.is_empty() {
            return Ok(());
        }
        let id = self.next_id();
        let writes: Vec<CWrite> = active.records().flat_map(|r| active.writes_for(r).cloned().collect::<Vec<_>>()).collect();
        write_revision_file(&self.dir, TABLE_DIR, id, &writes)?;
        active.seal();
        let sealed = std::mem::replace(&mut *active, TableBlock::new(1024));
        drop(active);
        self.table_sealed.write().push((id, sealed));
        Ok(())
    }

    fn seal_and_persist_secondary(&self) -> Result<()> {
        let mut active = self.secondary_active.write();
        if active.is_empty() {
            return Ok(());
        }
        let id = self.next_id();
        let writes: Vec<CWrite> = active.keys().cloned().collect::<Vec<_>>().into_iter().flat_map(|k| {
            active.writes_for(&k).cloned().collect::<Vec<_>>()
        }).collect();
        write_revision_file(&self.dir, SECONDARY_DIR, id, &writes)?;
        active.seal();
        let sealed = std::mem::replace(&mut *active, SecondaryBlock::new(1024));
        drop(active);
        self.secondary_sealed.write().push((id, sealed));
        Ok(())
    }

    fn seal_and_persist_search(&self) -> Result<()> {
        let mut active = self.search_active.write();
        if active.is_empty() {
            return Ok(());
        }
        let id = self.next_id();
        // The search block has no public locator iterator (locators are
        // (key, token) pairs synthesized from indexed values); persist by
        // re-deriving the original writes from the sealed secondary family
        // is unnecessary here since we keep the raw writes that were fed
        // in, tracked separately below.
        let writes = active.take_raw_writes();
        write_revision_file(&self.dir, SEARCH_DIR, id, &writes)?;
        active.seal();
        let sealed = std::mem::replace(
            &mut *active,
            SearchBlock::new(1024, self.max_search_substring_length),
        );
        drop(active);
        self.search_sealed.write().push((id, sealed));
        Ok(())
    }

    fn persist_inventory(&self) -> Result<()> {
        std::fs::write(self.dir.join(INVENTORY_FILE), self.inventory.encode()).map_err(Error::Io)
    }

    fn all_table_writes(&self, record: RecordId) -> Vec<CWrite> {
        let mut out = Vec::new();
        for (_, block) in self.table_sealed.read().iter() {
            if block.might_contain(record) {
                out.extend(block.writes_for(record).cloned());
            }
        }
        out.extend(self.table_active.read().writes_for(record).cloned());
        out
    }

    fn all_secondary_writes(&self, key: &str) -> Vec<CWrite> {
        let mut out = Vec::new();
        for (_, block) in self.secondary_sealed.read().iter() {
            if block.might_contain(key) {
                out.extend(block.writes_for(key).cloned());
            }
        }
        out.extend(self.secondary_active.read().writes_for(key).cloned());
        out
    }

    fn all_search_writes(&self, key: &str, token: &str) -> Vec<CWrite> {
        let mut out = Vec::new();
        for (_, block) in self.search_sealed.read().iter() {
            if block.might_contain(key, token) {
                out.extend(block.writes_for(key, token).cloned());
            }
        }
        out.extend(self.search_active.read().writes_for(key, token).cloned());
        out
    }

    /// Every write ever accepted for `record`, across sealed and active
    /// table blocks, in no particular order. `BufferedStore` uses this to
    /// merge Database state with Buffer writes at the write level rather
    /// than the folded-state level (spec §4.4).
    pub fn writes_for_record(&self, record: RecordId) -> Vec<CWrite> {
        self.all_table_writes(record)
    }

    /// Every write ever accepted for `key`, across sealed and active
    /// secondary blocks.
    pub fn writes_for_key(&self, key: &str) -> Vec<CWrite> {
        self.all_secondary_writes(key)
    }

    /// Verify-by-lookup fast path (spec §4.2): reconstruct only the
    /// matching field by scanning revisions for `(key, record)` in
    /// reverse version order and stopping at the first hit, instead of
    /// folding the full history.
    pub fn verify_by_lookup(&self, key: &str, value: &Value, record: RecordId) -> Result<bool> {
        let mut writes = self.all_table_writes(record);
        writes.retain(|w| w.key == key);
        writes.sort_by_key(|w| w.version);
        for w in writes.iter().rev() {
            if &w.value == value {
                return Ok(w.action == Action::Add);
            }
        }
        Ok(false)
    }

    /// A human-readable dump of one block's contents, for operator
    /// introspection (spec §4.2 `dump(blockId)`).
    pub fn dump(&self, block_id: u64) -> Option<String> {
        if let Some((_, block)) = self.table_sealed.read().iter().find(|(id, _)| *id == block_id) {
            return Some(format!("table block {block_id}: {} revisions", block.len()));
        }
        if let Some((_, block)) = self
            .secondary_sealed
            .read()
            .iter()
            .find(|(id, _)| *id == block_id)
        {
            return Some(format!("secondary block {block_id}: {} revisions", block.len()));
        }
        if let Some((_, block)) = self.search_sealed.read().iter().find(|(id, _)| *id == block_id) {
            return Some(format!("search block {block_id}: {} revisions", block.len()));
        }
        None
    }

    /// Every sealed block id currently on disk, across all three index
    /// families (spec §4.2 `getDumpList()`).
    pub fn get_dump_list(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .table_sealed
            .read()
            .iter()
            .map(|(id, _)| *id)
            .chain(self.secondary_sealed.read().iter().map(|(id, _)| *id))
            .chain(self.search_sealed.read().iter().map(|(id, _)| *id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

fn write_revision_file(dir: &Path, family: &str, id: u64, writes: &[CWrite]) -> Result<()> {
    let path = dir.join(family).join(format!("{id:020}.revision"));
    let encoded = bincode::serialize(writes)
        .map_err(|e| Error::Corruption(format!("failed to encode revision file: {e}")))?;
    std::fs::write(path, encoded).map_err(Error::Io)
}

fn load_revision_files(dir: &Path, family: &str) -> Result<Vec<(u64, Vec<CWrite>)>> {
    let family_dir = dir.join(family);
    let mut entries: Vec<(u64, PathBuf)> = std::fs::read_dir(&family_dir)
        .map_err(Error::Io)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            let stem = name.strip_suffix(".revision")?;
            stem.parse::<u64>().ok().map(|id| (id, e.path()))
        })
        .collect();
    entries.sort_by_key(|(id, _)| *id);

    let mut out = Vec::new();
    for (id, path) in entries {
        let bytes = std::fs::read(&path).map_err(Error::Io)?;
        let writes: Vec<CWrite> = bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("revision file {id} is corrupt: {e}")))?;
        out.push((id, writes));
    }
    Ok(out)
}

impl Store for Database {
    fn select(&self, record: RecordId) -> Result<concourse_core::RecordView> {
        self.select_at(record, u64::MAX)
    }

    fn select_at(&self, record: RecordId, t: u64) -> Result<concourse_core::RecordView> {
        // Only the current-state view is cacheable: a historical read's
        // result depends on `t`, and the cache holds one slot per record.
        if t == u64::MAX {
            if let Some(cached) = self.cache.get("select", record) {
                return Ok((*cached).clone());
            }
        }
        let writes = self.all_table_writes(record);
        let view: concourse_core::RecordView =
            replay::fold_record(writes.iter(), record, Some(t))
                .into_iter()
                .collect();
        if t == u64::MAX {
            self.cache.put("select", record, view.clone());
        }
        Ok(view)
    }

    fn select_key(&self, key: &str, record: RecordId) -> Result<BTreeSet<Value>> {
        self.select_key_at(key, record, u64::MAX)
    }

    fn select_key_at(&self, key: &str, record: RecordId, t: u64) -> Result<BTreeSet<Value>> {
        let writes = self.all_table_writes(record);
        Ok(replay::fold_field(writes.iter(), key, record, Some(t)))
    }

    fn browse(&self, key: &str) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        self.browse_at(key, u64::MAX)
    }

    fn browse_at(&self, key: &str, t: u64) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        let writes = self.all_secondary_writes(key);
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
        let tokens = concourse_core::search::query_tokens(query);
        if tokens.is_empty() {
            return Ok(HashSet::new());
        }
        let mut result: Option<HashSet<RecordId>> = None;
        for token in tokens {
            let writes = self.all_search_writes(key, &token);
            let matching: HashSet<RecordId> =
                replay::inventory_from_writes(writes.iter().filter(|w| w.action == Action::Add))
                    .into_iter()
                    .filter(|record| {
                        // A string can be overwritten; only trust tokens
                        // still present after folding ADD/REMOVE.
                        let relevant: Vec<&CWrite> =
                            writes.iter().filter(|w| w.record == *record).collect();
                        let mut active = false;
                        let mut ordered = relevant.clone();
                        ordered.sort_by_key(|w| w.version);
                        for w in ordered {
                            active = match w.action {
                                Action::Add => true,
                                Action::Remove => false,
                            };
                        }
                        active
                    })
                    .collect();
            result = Some(match result {
                Some(acc) => acc.intersection(&matching).copied().collect(),
                None => matching,
            });
        }
        Ok(result.unwrap_or_default())
    }

    fn chronologize(
        &self,
        key: &str,
        record: RecordId,
        t_start: u64,
        t_end: u64,
    ) -> Result<BTreeMap<u64, BTreeSet<Value>>> {
        let mut writes = self.all_table_writes(record);
        writes.retain(|w| w.key == key && w.version <= t_end);
        writes.sort_by_key(|w| w.version);
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
            if w.version >= t_start {
                out.insert(w.version, running.clone());
            }
        }
        Ok(out)
    }

    fn audit(&self, record: RecordId) -> Result<BTreeMap<u64, String>> {
        let writes = self.all_table_writes(record);
        Ok(replay::audit_lines(writes.iter()))
    }

    fn audit_key(&self, key: &str, record: RecordId) -> Result<BTreeMap<u64, String>> {
        let writes = self.all_table_writes(record);
        Ok(replay::audit_lines(writes.iter().filter(|w| w.key == key)))
    }

    fn describe(&self, record: RecordId) -> Result<HashSet<String>> {
        self.describe_at(record, u64::MAX)
    }

    fn describe_at(&self, record: RecordId, t: u64) -> Result<HashSet<String>> {
        Ok(self.select_at(record, t)?.into_keys().collect())
    }

    fn verify(&self, key: &str, value: &Value, record: RecordId) -> Result<bool> {
        self.verify_by_lookup(key, value, record)
    }

    fn verify_at(&self, key: &str, value: &Value, record: RecordId, t: u64) -> Result<bool> {
        Ok(self.select_key_at(key, record, t)?.contains(value))
    }

    fn contains(&self, record: RecordId) -> Result<bool> {
        Ok(self.inventory.contains(record))
    }

    fn get_all_records(&self) -> Result<Vec<RecordId>> {
        Ok(self.inventory.all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn accept_then_select() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), 40).unwrap();
        db.accept(CWrite::add("name", Value::String("jeff".into()), 1, 1), false)
            .unwrap();
        assert_eq!(
            db.select_key("name", 1).unwrap(),
            BTreeSet::from([Value::String("jeff".into())])
        );
        assert!(db.contains(1).unwrap());
    }

    #[test]
    fn sync_persists_and_reload_preserves_reads() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path(), 40).unwrap();
            db.accept(CWrite::add("age", Value::Integer(30), 1, 1), true)
                .unwrap();
        }
        let db = Database::open(dir.path(), 40).unwrap();
        assert_eq!(
            db.select_key("age", 1).unwrap(),
            BTreeSet::from([Value::Integer(30)])
        );
        assert!(db.contains(1).unwrap());
    }

    #[test]
    fn search_finds_substring_and_respects_removal() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), 40).unwrap();
        db.accept(
            CWrite::add("bio", Value::String("the quick brown fox".into()), 1, 1),
            false,
        )
        .unwrap();
        assert_eq!(db.search("bio", "quick").unwrap(), HashSet::from([1]));
        db.accept(
            CWrite::remove("bio", Value::String("the quick brown fox".into()), 1, 2),
            false,
        )
        .unwrap();
        assert!(db.search("bio", "quick").unwrap().is_empty());
    }

    #[test]
    fn verify_by_lookup_matches_current_state() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), 40).unwrap();
        db.accept(CWrite::add("k", Value::Integer(1), 1, 1), false)
            .unwrap();
        db.accept(CWrite::remove("k", Value::Integer(1), 1, 2), false)
            .unwrap();
        assert!(!db.verify_by_lookup("k", &Value::Integer(1), 1).unwrap());
    }
}
