//! `AtomicOperation`: optimistic, version-validated composition of staged
//! writes against a destination store (spec §4.5).
//!
//! Every read through an `AtomicOperation` records an *observation* — the
//! destination's state for that `(key, record)` (or key, for `browse`) at
//! the moment it was read, before any of this operation's own staged
//! writes (its *intentions*) are overlaid. `commit` re-reads the
//! destination fresh and aborts with `Error::Retry` the instant any
//! observation no longer matches, which is the operation's optimistic
//! concurrency check: nothing it read changed out from under it between
//! read and commit.

use concourse_concurrency::{LockManager, LockScope};
use concourse_core::error::{Error, Result};
use concourse_core::value::{Operator, RecordId, Value};
use concourse_core::{Action, Clock, RecordView, Store, Write as CWrite};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::buffered_store::BufferedStore;

/// One destination read, captured so `commit` can detect whether the
/// destination changed underneath this operation.
enum Observation {
    Record(RecordId, RecordView),
    Key(String, RecordId, BTreeSet<Value>),
    Browse(String, BTreeMap<Value, HashSet<RecordId>>),
    Contains(RecordId, bool),
}

impl Observation {
    fn record_touched(&self) -> Option<RecordId> {
        match self {
            Observation::Record(r, _) | Observation::Key(_, r, _) | Observation::Contains(r, _) => {
                Some(*r)
            }
            Observation::Browse(..) => None,
        }
    }

    fn revalidate(&self, destination: &BufferedStore) -> Result<bool> {
        Ok(match self {
            Observation::Record(record, expected) => &destination.select(*record)? == expected,
            Observation::Key(key, record, expected) => {
                &destination.select_key(key, *record)? == expected
            }
            Observation::Browse(key, expected) => &destination.browse(key)? == expected,
            Observation::Contains(record, expected) => &destination.contains(*record)? == expected,
        })
    }
}

/// A staged unit of optimistic work: reads observe destination state,
/// writes stage locally until `commit` (spec §4.5).
pub struct AtomicOperation {
    destination: Arc<BufferedStore>,
    locks: Arc<LockManager>,
    clock: Arc<Clock>,
    lock_timeout: Duration,
    intentions: Mutex<Vec<CWrite>>,
    observations: Mutex<Vec<Observation>>,
}

impl AtomicOperation {
    /// Start a new operation against `destination`.
    pub fn new(
        destination: Arc<BufferedStore>,
        locks: Arc<LockManager>,
        clock: Arc<Clock>,
        lock_timeout: Duration,
    ) -> Self {
        AtomicOperation {
            destination,
            locks,
            clock,
            lock_timeout,
            intentions: Mutex::new(Vec::new()),
            observations: Mutex::new(Vec::new()),
        }
    }

    /// Stage an ADD, versioned by this operation's clock tick.
    pub fn add(&self, key: impl Into<String>, value: Value, record: RecordId) {
        let version = self.clock.tick();
        self.intentions
            .lock()
            .push(CWrite::add(key, value, record, version));
    }

    /// Stage a REMOVE, versioned by this operation's clock tick.
    pub fn remove(&self, key: impl Into<String>, value: Value, record: RecordId) {
        let version = self.clock.tick();
        self.intentions
            .lock()
            .push(CWrite::remove(key, value, record, version));
    }

    /// Records touched by this operation's own staged writes, for use by
    /// callers (e.g. `insertJson`) that need a fresh id guaranteed not to
    /// collide with anything staged so far.
    pub fn staged_records(&self) -> HashSet<RecordId> {
        self.intentions.lock().iter().map(|w| w.record).collect()
    }

    fn overlay_record(&self, record: RecordId, mut view: RecordView) -> RecordView {
        for w in self.intentions.lock().iter().filter(|w| w.record == record) {
            let set = view.entry(w.key.clone()).or_default();
            match w.action {
                Action::Add => {
                    set.insert(w.value.clone());
                }
                Action::Remove => {
                    set.remove(&w.value);
                }
            }
        }
        view.retain(|_, set| !set.is_empty());
        view
    }

    fn overlay_field(&self, key: &str, record: RecordId, mut set: BTreeSet<Value>) -> BTreeSet<Value> {
        for w in self
            .intentions
            .lock()
            .iter()
            .filter(|w| w.key == key && w.record == record)
        {
            match w.action {
                Action::Add => {
                    set.insert(w.value.clone());
                }
                Action::Remove => {
                    set.remove(&w.value);
                }
            }
        }
        set
    }

    fn overlay_browse(
        &self,
        key: &str,
        mut map: BTreeMap<Value, HashSet<RecordId>>,
    ) -> BTreeMap<Value, HashSet<RecordId>> {
        for w in self.intentions.lock().iter().filter(|w| w.key == key) {
            let entry = map.entry(w.value.clone()).or_default();
            match w.action {
                Action::Add => {
                    entry.insert(w.record);
                }
                Action::Remove => {
                    entry.remove(&w.record);
                }
            }
        }
        map.retain(|_, set| !set.is_empty());
        map
    }

    /// Every scope this operation must hold a write lock on before commit
    /// validation: one `Record` scope per record touched by a staged write
    /// or a destination read, plus one `Wildcard` scope per key a `browse`
    /// observed *or* a staged write lands on. The `Wildcard` side is what
    /// makes a `find`/predicate read's observation actually guarded — a
    /// `Browse` observation covers every record for that key (spec §5's
    /// range lock), so a concurrent write to the same key must contend on
    /// the same scope for `revalidate` to be trustworthy; that only works
    /// if the write announces the identical `Wildcard(key)`, since the
    /// lock manager keys on scope equality rather than interval overlap.
    fn touched_scopes(&self) -> Vec<LockScope> {
        let intentions = self.intentions.lock();
        let observations = self.observations.lock();

        let mut records: BTreeSet<RecordId> = intentions.iter().map(|w| w.record).collect();
        records.extend(observations.iter().filter_map(Observation::record_touched));

        let mut keys: BTreeSet<String> = intentions.iter().map(|w| w.key.clone()).collect();
        keys.extend(observations.iter().filter_map(|o| match o {
            Observation::Browse(key, _) => Some(key.clone()),
            _ => None,
        }));

        let mut scopes: Vec<LockScope> = records.into_iter().map(LockScope::Record).collect();
        scopes.extend(keys.into_iter().map(LockScope::Wildcard));
        scopes
    }

    /// 4-step commit: acquire write locks on every touched record
    /// (canonical order avoids deadlock, spec §5), re-validate every
    /// observation against fresh destination reads, apply intentions in
    /// staging order, then release the locks (via guard drop).
    pub fn commit(&self) -> Result<()> {
        let scopes = self.touched_scopes();
        let _guards = self.locks.acquire_all_write(scopes, self.lock_timeout)?;

        for observation in self.observations.lock().iter() {
            if !observation.revalidate(&self.destination)? {
                trace!("atomic operation lost a version race, retrying");
                return Err(Error::Retry(
                    "observed destination state changed before commit".into(),
                ));
            }
        }

        let intentions = self.intentions.lock();
        let last = intentions.len().saturating_sub(1);
        for (i, write) in intentions.iter().enumerate() {
            self.destination.accept(write.clone(), i == last)?;
        }
        debug!(writes = intentions.len(), "atomic operation committed");
        Ok(())
    }
}

impl Store for AtomicOperation {
    fn select(&self, record: RecordId) -> Result<RecordView> {
        let base = self.destination.select(record)?;
        self.observations
            .lock()
            .push(Observation::Record(record, base.clone()));
        Ok(self.overlay_record(record, base))
    }

    fn select_at(&self, record: RecordId, t: u64) -> Result<RecordView> {
        self.destination.select_at(record, t)
    }

    fn select_key(&self, key: &str, record: RecordId) -> Result<BTreeSet<Value>> {
        let base = self.destination.select_key(key, record)?;
        self.observations
            .lock()
            .push(Observation::Key(key.to_string(), record, base.clone()));
        Ok(self.overlay_field(key, record, base))
    }

    fn select_key_at(&self, key: &str, record: RecordId, t: u64) -> Result<BTreeSet<Value>> {
        self.destination.select_key_at(key, record, t)
    }

    fn browse(&self, key: &str) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        let base = self.destination.browse(key)?;
        self.observations
            .lock()
            .push(Observation::Browse(key.to_string(), base.clone()));
        Ok(self.overlay_browse(key, base))
    }

    fn browse_at(&self, key: &str, t: u64) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        self.destination.browse_at(key, t)
    }

    fn find(&self, key: &str, operator: Operator, values: &[Value]) -> Result<HashSet<RecordId>> {
        let browse = self.browse(key)?;
        concourse_core::operators::evaluate(&browse, operator, values)
    }

    fn find_at(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        t: u64,
    ) -> Result<HashSet<RecordId>> {
        self.destination.find_at(key, operator, values, t)
    }

    fn search(&self, key: &str, query: &str) -> Result<HashSet<RecordId>> {
        self.destination.search(key, query)
    }

    fn chronologize(
        &self,
        key: &str,
        record: RecordId,
        t_start: u64,
        t_end: u64,
    ) -> Result<BTreeMap<u64, BTreeSet<Value>>> {
        self.destination.chronologize(key, record, t_start, t_end)
    }

    fn audit(&self, record: RecordId) -> Result<BTreeMap<u64, String>> {
        self.destination.audit(record)
    }

    fn audit_key(&self, key: &str, record: RecordId) -> Result<BTreeMap<u64, String>> {
        self.destination.audit_key(key, record)
    }

    fn describe(&self, record: RecordId) -> Result<HashSet<String>> {
        Ok(self.select(record)?.into_keys().collect())
    }

    fn describe_at(&self, record: RecordId, t: u64) -> Result<HashSet<String>> {
        self.destination.describe_at(record, t)
    }

    fn verify(&self, key: &str, value: &Value, record: RecordId) -> Result<bool> {
        Ok(self.select_key(key, record)?.contains(value))
    }

    fn verify_at(&self, key: &str, value: &Value, record: RecordId, t: u64) -> Result<bool> {
        self.destination.verify_at(key, value, record, t)
    }

    fn contains(&self, record: RecordId) -> Result<bool> {
        let base = self.destination.contains(record)?;
        self.observations
            .lock()
            .push(Observation::Contains(record, base));
        if base {
            return Ok(true);
        }
        Ok(self.intentions.lock().iter().any(|w| w.record == record && w.action == Action::Add))
    }

    fn get_all_records(&self) -> Result<Vec<RecordId>> {
        self.destination.get_all_records()
    }
}

/// Bounded exponential backoff for [`execute_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up and surfacing the last error.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Ceiling the doubling backoff never exceeds.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(250),
        }
    }
}

/// Run `body` against a fresh [`AtomicOperation`], committing on success.
/// If the commit (or `body` itself) returns `Error::Retry`, back off and
/// try again with a brand-new operation, up to `policy.max_attempts`
/// (spec §4.5 `executeWithRetry`). `body` may itself return `Error::Retry`
/// explicitly (e.g. on a record-id collision) to request an early retry
/// without attempting commit.
pub fn execute_with_retry<T>(
    destination: Arc<BufferedStore>,
    locks: Arc<LockManager>,
    clock: Arc<Clock>,
    lock_timeout: Duration,
    policy: RetryPolicy,
    mut body: impl FnMut(&AtomicOperation) -> Result<T>,
) -> Result<T> {
    let mut backoff = policy.base_backoff;
    for attempt in 0..policy.max_attempts {
        let op = AtomicOperation::new(
            Arc::clone(&destination),
            Arc::clone(&locks),
            Arc::clone(&clock),
            lock_timeout,
        );
        match body(&op) {
            Ok(value) => match op.commit() {
                Ok(()) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    trace!(attempt, "commit retry");
                }
                Err(e) => return Err(e),
            },
            Err(e) if e.is_retryable() => {
                trace!(attempt, "body retry");
            }
            Err(e) => return Err(e),
        }
        std::thread::sleep(full_jitter(backoff));
        backoff = (backoff * 2).min(policy.max_backoff);
    }
    Err(Error::Retry(format!(
        "gave up after {} attempts",
        policy.max_attempts
    )))
}

/// "Full jitter" backoff (a random delay in `[0, backoff]`) so that a burst
/// of operations that all lost the same race don't retry in lockstep and
/// collide again.
fn full_jitter(backoff: Duration) -> Duration {
    let millis = backoff.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_buffer::Buffer;
    use concourse_storage::Database;
    use tempfile::tempdir;

    fn fixture() -> (Arc<BufferedStore>, Arc<LockManager>, Arc<Clock>) {
        let dir = tempdir().unwrap();
        let buffer = Buffer::open(&dir.path().join("buffer"), [1; 16], 8192).unwrap();
        let database = Database::open(&dir.path().join("db"), 40).unwrap();
        std::mem::forget(dir);
        (
            Arc::new(BufferedStore::new(buffer, database)),
            Arc::new(LockManager::new()),
            Arc::new(Clock::new()),
        )
    }

    #[test]
    fn commit_applies_staged_writes() {
        let (store, locks, clock) = fixture();
        let op = AtomicOperation::new(store.clone(), locks, clock, Duration::from_millis(100));
        op.add("name", Value::String("jeff".into()), 1);
        op.commit().unwrap();
        assert_eq!(
            store.select_key("name", 1).unwrap(),
            BTreeSet::from([Value::String("jeff".into())])
        );
    }

    #[test]
    fn concurrent_write_between_read_and_commit_forces_retry() {
        let (store, locks, clock) = fixture();
        let op = AtomicOperation::new(store.clone(), locks.clone(), clock.clone(), Duration::from_millis(100));
        let seen = op.select_key("count", 1).unwrap();
        assert!(seen.is_empty());

        // Someone else writes to the same record before we commit.
        store.accept(CWrite::add("count", Value::Integer(5), 1, clock.tick()), true).unwrap();

        op.add("count", Value::Integer(6), 1);
        let err = op.commit().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn concurrent_write_to_browsed_key_on_other_record_forces_retry() {
        // A `find`/`browse` observation covers every record for a key, not
        // just the one this operation otherwise touches: a write landing
        // on an unrelated record under the same key must still invalidate
        // it (spec §5's range lock).
        let (store, locks, clock) = fixture();
        let op = AtomicOperation::new(store.clone(), locks.clone(), clock.clone(), Duration::from_millis(100));
        let seen = op.browse("tag").unwrap();
        assert!(seen.is_empty());

        store
            .accept(CWrite::add("tag", Value::String("new".into()), 99, clock.tick()), true)
            .unwrap();

        op.add("name", Value::String("jeff".into()), 1);
        let err = op.commit().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn browse_observation_acquires_a_wildcard_scope() {
        let (store, locks, clock) = fixture();
        let op = AtomicOperation::new(store, locks, clock, Duration::from_millis(100));
        op.browse("tag").unwrap();
        assert!(op
            .touched_scopes()
            .contains(&LockScope::Wildcard("tag".into())));
    }

    #[test]
    fn execute_with_retry_succeeds_once_contention_clears() {
        let (store, locks, clock) = fixture();
        store.accept(CWrite::add("count", Value::Integer(5), 1, clock.tick()), true).unwrap();

        let mut attempts = 0;
        let result = execute_with_retry(
            store.clone(),
            locks,
            clock,
            Duration::from_millis(100),
            RetryPolicy {
                max_attempts: 5,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            |op| {
                attempts += 1;
                let current = op.select_key("count", 1)?;
                let n = match current.iter().next() {
                    Some(Value::Integer(n)) => *n,
                    _ => 0,
                };
                op.remove("count", Value::Integer(n), 1);
                op.add("count", Value::Integer(n + 1), 1);
                Ok(n + 1)
            },
        )
        .unwrap();
        assert_eq!(result, 6);
        assert_eq!(
            store.select_key("count", 1).unwrap(),
            BTreeSet::from([Value::Integer(6)])
        );
    }
}
