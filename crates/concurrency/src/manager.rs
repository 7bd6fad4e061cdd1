//! Ref-counted reader/writer locks keyed by [`LockScope`] (spec §5).
//!
//! Locks are created lazily and removed once unreferenced. Creation and
//! removal both go through [`dashmap::DashMap::entry`] for the same key,
//! which serializes them on the map's internal shard lock — the mechanism
//! spec §9 calls out as "creation and deletion must be atomic (compare-
//! and-set on the ref-count transition to/from zero)".
//!
//! `LockManager` is meant to live behind an `Arc` (one per `Engine`,
//! shared by every `AtomicOperation`/`Transaction` against that
//! environment): guards borrow the manager via `Arc` rather than a
//! lifetime so a `Transaction` can hold its locks across the separate
//! client round-trips `stage`/`commit` implies (spec §4.6), not just for
//! the duration of one call.

use crate::lock::LockScope;
use concourse_core::error::{Error, Result};
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

struct LockEntry {
    lock: Arc<RwLock<()>>,
    refs: AtomicUsize,
}

impl LockEntry {
    fn new() -> Self {
        LockEntry {
            lock: Arc::new(RwLock::new(())),
            refs: AtomicUsize::new(0),
        }
    }
}

/// The per-`Engine` registry of live locks.
#[derive(Default)]
pub struct LockManager {
    locks: DashMap<LockScope, Arc<LockEntry>>,
}

/// Default spin-backoff step while waiting on a contended lock.
const BACKOFF: Duration = Duration::from_micros(200);

impl LockManager {
    /// An empty lock manager.
    pub fn new() -> Self {
        LockManager {
            locks: DashMap::new(),
        }
    }

    /// Number of distinct scopes currently holding at least one reference.
    /// Exposed for tests and operator introspection.
    pub fn live_scope_count(&self) -> usize {
        self.locks.len()
    }

    fn try_read(&self, scope: &LockScope) -> Option<(Arc<LockEntry>, ArcRwLockReadGuard<RawRwLock, ()>)> {
        match self.locks.entry(scope.clone()) {
            DashEntry::Occupied(occ) => {
                let entry = occ.get().clone();
                let guard = entry.lock.try_read_arc()?;
                entry.refs.fetch_add(1, Ordering::SeqCst);
                Some((entry, guard))
            }
            DashEntry::Vacant(vac) => {
                let entry = Arc::new(LockEntry::new());
                let guard = entry
                    .lock
                    .try_read_arc()
                    .expect("a freshly created RwLock is never contended");
                entry.refs.store(1, Ordering::SeqCst);
                vac.insert(entry.clone());
                Some((entry, guard))
            }
        }
    }

    fn try_write(&self, scope: &LockScope) -> Option<(Arc<LockEntry>, ArcRwLockWriteGuard<RawRwLock, ()>)> {
        match self.locks.entry(scope.clone()) {
            DashEntry::Occupied(occ) => {
                let entry = occ.get().clone();
                let guard = entry.lock.try_write_arc()?;
                entry.refs.fetch_add(1, Ordering::SeqCst);
                Some((entry, guard))
            }
            DashEntry::Vacant(vac) => {
                let entry = Arc::new(LockEntry::new());
                let guard = entry
                    .lock
                    .try_write_arc()
                    .expect("a freshly created RwLock is never contended");
                entry.refs.store(1, Ordering::SeqCst);
                vac.insert(entry.clone());
                Some((entry, guard))
            }
        }
    }

    fn release(&self, scope: &LockScope) {
        if let DashEntry::Occupied(occ) = self.locks.entry(scope.clone()) {
            let remaining = occ.get().refs.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 {
                occ.remove();
                trace!(?scope, "lock scope garbage collected");
            }
        }
    }

    /// Acquire the read side of `scope`, blocking with a short spin-backoff
    /// until it becomes available. Never times out; callers that need
    /// bounded waiting should use [`LockManager::try_acquire_read`].
    pub fn acquire_read(self: &Arc<Self>, scope: LockScope) -> ReadGuard {
        loop {
            if let Some((entry, guard)) = self.try_read(&scope) {
                return ReadGuard {
                    manager: self.clone(),
                    scope,
                    entry,
                    guard: Some(guard),
                };
            }
            std::thread::sleep(BACKOFF);
        }
    }

    /// Acquire the write side of `scope`, blocking with a short spin-
    /// backoff until it becomes available.
    pub fn acquire_write(self: &Arc<Self>, scope: LockScope) -> WriteGuard {
        loop {
            if let Some((entry, guard)) = self.try_write(&scope) {
                return WriteGuard {
                    manager: self.clone(),
                    scope,
                    entry,
                    guard: Some(guard),
                };
            }
            std::thread::sleep(BACKOFF);
        }
    }

    /// Attempt to acquire the read side of `scope` within `timeout`.
    /// Timing out surfaces as `Error::Retry` per spec §5 "timeout-based
    /// breakaway is permitted and surfaced as RETRY to the AtomicOperation
    /// layer".
    pub fn try_acquire_read(self: &Arc<Self>, scope: LockScope, timeout: Duration) -> Result<ReadGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((entry, guard)) = self.try_read(&scope) {
                return Ok(ReadGuard {
                    manager: self.clone(),
                    scope,
                    entry,
                    guard: Some(guard),
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::Retry(format!("timed out acquiring read lock on {scope:?}")));
            }
            std::thread::sleep(BACKOFF);
        }
    }

    /// Attempt to acquire the write side of `scope` within `timeout`.
    pub fn try_acquire_write(self: &Arc<Self>, scope: LockScope, timeout: Duration) -> Result<WriteGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((entry, guard)) = self.try_write(&scope) {
                return Ok(WriteGuard {
                    manager: self.clone(),
                    scope,
                    entry,
                    guard: Some(guard),
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::Retry(format!("timed out acquiring write lock on {scope:?}")));
            }
            std::thread::sleep(BACKOFF);
        }
    }

    /// Acquire the write side of every scope in `scopes`, in the canonical
    /// order (spec §5 deadlock avoidance), each bounded by `timeout`. On
    /// any failure, already-acquired locks are released (via `Drop`) and
    /// the first error is returned — the caller (`AtomicOperation::commit`)
    /// turns this into `RETRY`.
    pub fn acquire_all_write(
        self: &Arc<Self>,
        mut scopes: Vec<LockScope>,
        timeout: Duration,
    ) -> Result<Vec<WriteGuard>> {
        scopes.sort();
        scopes.dedup();
        let mut guards = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let guard = self.try_acquire_write(scope, timeout)?;
            guards.push(guard);
        }
        Ok(guards)
    }
}

/// A held read lock on one [`LockScope`]. Releases (and, if it was the
/// last reference, garbage-collects the scope) on drop.
pub struct ReadGuard {
    manager: Arc<LockManager>,
    scope: LockScope,
    entry: Arc<LockEntry>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.guard.take();
        let _ = &self.entry;
        self.manager.release(&self.scope);
    }
}

/// A held write lock on one [`LockScope`]. Releases (and, if it was the
/// last reference, garbage-collects the scope) on drop.
pub struct WriteGuard {
    manager: Arc<LockManager>,
    scope: LockScope,
    entry: Arc<LockEntry>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.guard.take();
        let _ = &self.entry;
        self.manager.release(&self.scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_locks_do_not_exclude_each_other() {
        let mgr = Arc::new(LockManager::new());
        let a = mgr.acquire_read(LockScope::Record(1));
        let b = mgr.acquire_read(LockScope::Record(1));
        assert_eq!(mgr.live_scope_count(), 1);
        drop(a);
        drop(b);
        assert_eq!(mgr.live_scope_count(), 0);
    }

    #[test]
    fn write_lock_excludes_read() {
        let mgr = Arc::new(LockManager::new());
        let _w = mgr.acquire_write(LockScope::Record(1));
        let err = mgr
            .try_acquire_read(LockScope::Record(1), Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn distinct_scopes_do_not_contend() {
        let mgr = Arc::new(LockManager::new());
        let _a = mgr.acquire_write(LockScope::Record(1));
        let _b = mgr
            .try_acquire_write(LockScope::Record(2), Duration::from_millis(50))
            .unwrap();
        assert_eq!(mgr.live_scope_count(), 2);
    }

    #[test]
    fn scope_is_garbage_collected_after_last_release() {
        let mgr = Arc::new(LockManager::new());
        {
            let _g = mgr.acquire_write(LockScope::Record(1));
            assert_eq!(mgr.live_scope_count(), 1);
        }
        assert_eq!(mgr.live_scope_count(), 0);
    }

    #[test]
    fn acquire_all_write_sorts_and_acquires_distinct_scopes() {
        let mgr = Arc::new(LockManager::new());
        let scopes = vec![
            LockScope::Record(3),
            LockScope::Record(1),
            LockScope::Field(2, "k".into()),
        ];
        let guards = mgr.acquire_all_write(scopes, Duration::from_millis(50)).unwrap();
        assert_eq!(guards.len(), 3);
        assert_eq!(mgr.live_scope_count(), 3);
    }

    #[test]
    fn concurrent_writers_on_same_scope_serialize() {
        use std::sync::atomic::AtomicU64;
        let mgr = Arc::new(LockManager::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                let _g = mgr.acquire_write(LockScope::Record(42));
                let before = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(before, 0, "no other writer should be inside the critical section");
                std::thread::sleep(Duration::from_millis(2));
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
