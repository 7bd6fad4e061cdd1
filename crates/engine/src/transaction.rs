//! `Transaction`: a token-bearing, durable wrapper around repeated
//! [`AtomicOperation`]s, surviving separate client round-trips between
//! `stage` and `commit` (spec §4.6).
//!
//! Unlike a bare `AtomicOperation` (which is built, staged, and committed
//! within one call), a `Transaction` is handed a token the client holds
//! across network round-trips. Every `stage` call appends to the same
//! running intention/observation set; `commit` runs the same 4-step
//! protocol once, at the end, against everything staged so far.

use crate::buffered_store::BufferedStore;
use concourse_concurrency::LockManager;
use concourse_core::error::{Error, Result};
use concourse_core::value::{Operator, RecordId, Value};
use concourse_core::{Clock, RecordView, Store};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::atomic::AtomicOperation;

/// Opaque handle a client uses to refer to its open `Transaction` across
/// separate `stage`/`commit` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionToken(Uuid);

impl std::fmt::Display for TransactionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A durable, token-bearing sequence of staged writes that commits once,
/// as a whole, on request (spec §4.6). Reads through the transaction
/// observe its own prior writes plus the destination, exactly like
/// `AtomicOperation`; the transaction simply keeps one `AtomicOperation`
/// alive across calls instead of creating a fresh one per call.
pub struct Transaction {
    token: TransactionToken,
    op: AtomicOperation,
    last_activity: AtomicU64,
    idle_timeout: Duration,
    started_at: Instant,
    aborted: Mutex<bool>,
}

impl Transaction {
    /// Begin a new transaction against `destination`.
    pub(crate) fn new(
        destination: Arc<BufferedStore>,
        locks: Arc<LockManager>,
        clock: Arc<Clock>,
        lock_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Transaction {
            token: TransactionToken(Uuid::new_v4()),
            op: AtomicOperation::new(destination, locks, clock, lock_timeout),
            last_activity: AtomicU64::new(0),
            idle_timeout,
            started_at: Instant::now(),
            aborted: Mutex::new(false),
        }
    }

    /// This transaction's client-facing token.
    pub fn token(&self) -> TransactionToken {
        self.token
    }

    fn touch(&self) {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed_ms, Ordering::SeqCst);
    }

    /// Whether this transaction has been idle longer than its configured
    /// timeout, or was explicitly aborted (spec §4.6 idle-timeout expiry).
    pub fn is_expired(&self) -> bool {
        if *self.aborted.lock() {
            return true;
        }
        let last = self.last_activity.load(Ordering::SeqCst);
        let now = self.started_at.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last)) > self.idle_timeout
    }

    /// Stage an ADD within this transaction.
    pub fn add(&self, key: impl Into<String>, value: Value, record: RecordId) -> Result<()> {
        self.guard_live()?;
        self.op.add(key, value, record);
        self.touch();
        Ok(())
    }

    /// Stage a REMOVE within this transaction.
    pub fn remove(&self, key: impl Into<String>, value: Value, record: RecordId) -> Result<()> {
        self.guard_live()?;
        self.op.remove(key, value, record);
        self.touch();
        Ok(())
    }

    /// Records already touched by this transaction's own staged writes.
    pub fn staged_records(&self) -> HashSet<RecordId> {
        self.op.staged_records()
    }

    fn guard_live(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::TransactionAborted(format!(
                "transaction {} expired or was aborted",
                self.token
            )));
        }
        Ok(())
    }

    /// Commit everything staged so far. On success the transaction is
    /// done and should be forgotten by the `Engine`; on `Error::Retry` the
    /// client may re-stage and try again, per spec §4.6.
    pub fn commit(&self) -> Result<()> {
        self.guard_live()?;
        self.op.commit()
    }

    /// Explicitly abandon this transaction without committing.
    pub fn abort(&self) {
        *self.aborted.lock() = true;
    }
}

impl Store for Transaction {
    fn select(&self, record: RecordId) -> Result<RecordView> {
        self.touch();
        self.op.select(record)
    }

    fn select_at(&self, record: RecordId, t: u64) -> Result<RecordView> {
        self.op.select_at(record, t)
    }

    fn select_key(&self, key: &str, record: RecordId) -> Result<BTreeSet<Value>> {
        self.touch();
        self.op.select_key(key, record)
    }

    fn select_key_at(&self, key: &str, record: RecordId, t: u64) -> Result<BTreeSet<Value>> {
        self.op.select_key_at(key, record, t)
    }

    fn browse(&self, key: &str) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        self.touch();
        self.op.browse(key)
    }

    fn browse_at(&self, key: &str, t: u64) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        self.op.browse_at(key, t)
    }

    fn find(&self, key: &str, operator: Operator, values: &[Value]) -> Result<HashSet<RecordId>> {
        self.touch();
        self.op.find(key, operator, values)
    }

    fn find_at(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        t: u64,
    ) -> Result<HashSet<RecordId>> {
        self.op.find_at(key, operator, values, t)
    }

    fn search(&self, key: &str, query: &str) -> Result<HashSet<RecordId>> {
        self.op.search(key, query)
    }

    fn chronologize(
        &self,
        key: &str,
        record: RecordId,
        t_start: u64,
        t_end: u64,
    ) -> Result<BTreeMap<u64, BTreeSet<Value>>> {
        self.op.chronologize(key, record, t_start, t_end)
    }

    fn audit(&self, record: RecordId) -> Result<BTreeMap<u64, String>> {
        self.op.audit(record)
    }

    fn audit_key(&self, key: &str, record: RecordId) -> Result<BTreeMap<u64, String>> {
        self.op.audit_key(key, record)
    }

    fn describe(&self, record: RecordId) -> Result<HashSet<String>> {
        self.op.describe(record)
    }

    fn describe_at(&self, record: RecordId, t: u64) -> Result<HashSet<String>> {
        self.op.describe_at(record, t)
    }

    fn verify(&self, key: &str, value: &Value, record: RecordId) -> Result<bool> {
        self.op.verify(key, value, record)
    }

    fn verify_at(&self, key: &str, value: &Value, record: RecordId, t: u64) -> Result<bool> {
        self.op.verify_at(key, value, record, t)
    }

    fn contains(&self, record: RecordId) -> Result<bool> {
        self.op.contains(record)
    }

    fn get_all_records(&self) -> Result<Vec<RecordId>> {
        self.op.get_all_records()
    }
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
    fn stage_then_commit_across_separate_calls() {
        let (store, locks, clock) = fixture();
        let txn = Transaction::new(
            store.clone(),
            locks,
            clock,
            Duration::from_millis(100),
            Duration::from_secs(60),
        );
        txn.add("name", Value::String("jeff".into()), 1).unwrap();
        // A second, separate "round trip" stages another write.
        txn.add("age", Value::Integer(30), 1).unwrap();
        txn.commit().unwrap();
        assert_eq!(
            store.select_key("name", 1).unwrap(),
            BTreeSet::from([Value::String("jeff".into())])
        );
        assert_eq!(
            store.select_key("age", 1).unwrap(),
            BTreeSet::from([Value::Integer(30)])
        );
    }

    #[test]
    fn aborted_transaction_rejects_further_staging() {
        let (store, locks, clock) = fixture();
        let txn = Transaction::new(
            store,
            locks,
            clock,
            Duration::from_millis(100),
            Duration::from_secs(60),
        );
        txn.abort();
        let err = txn.add("x", Value::Integer(1), 1).unwrap_err();
        assert!(matches!(err, Error::TransactionAborted(_)));
    }

    #[test]
    fn idle_transaction_is_expired() {
        let (store, locks, clock) = fixture();
        let txn = Transaction::new(
            store,
            locks,
            clock,
            Duration::from_millis(100),
            Duration::from_millis(1),
        );
        txn.add("x", Value::Integer(1), 1).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(txn.is_expired());
    }
}
