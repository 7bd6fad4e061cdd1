//! `Transporter`: the background mover from Buffer to Database (spec
//! §4.7).
//!
//! Each round: identify the oldest sealed, not-yet-transported Buffer
//! page; index every one of its writes into the Database; force the
//! Database to durably persist them; only then retire the page from the
//! Buffer. Steps 2-4 must happen in that order — a crash between 3 and 4
//! just re-transports an already-indexed page (accept is idempotent per
//! write), but retiring before the Database has synced could lose writes
//! that were never on stable storage anywhere.
//!
//! [`Transporter::run_once`] is the unit of work; [`spawn`] wraps it in
//! `num_transporter_threads` (spec §6) named worker threads that poll for
//! transportable pages and idle on a condvar between rounds, matching the
//! teacher's `BackgroundScheduler` shape (`crates/engine/src/
//! background.rs`): an `Arc`-shared shutdown flag plus a paired
//! `Mutex`/`Condvar` so `stop()` wakes every idle worker instead of
//! waiting out its poll interval.

use crate::buffered_store::BufferedStore;
use concourse_core::error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Whether the Transporter moves one page per call (`Streaming`, suited to
/// a tight background loop) or drains every currently-transportable page
/// per call (`Batch`, suited to a coarser periodic sweep) — spec §4.7 and
/// `Config::enable_batch_transports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransporterMode {
    /// Transport at most one page per `run_once` call.
    Streaming,
    /// Transport every currently-transportable page per `run_once` call.
    Batch,
}

/// Moves sealed Buffer pages into the Database.
pub struct Transporter {
    store: Arc<BufferedStore>,
    mode: TransporterMode,
}

impl Transporter {
    /// Build a transporter for `store`, operating in `mode`.
    pub fn new(store: Arc<BufferedStore>, mode: TransporterMode) -> Self {
        Transporter { store, mode }
    }

    /// Run one round. Returns `true` if at least one page was
    /// transported. In `Batch` mode this drains every transportable page
    /// before returning; in `Streaming` mode it moves at most one.
    pub fn run_once(&self) -> Result<bool> {
        let mut moved_any = false;
        loop {
            if !self.transport_one_page()? {
                break;
            }
            moved_any = true;
            if self.mode == TransporterMode::Streaming {
                break;
            }
        }
        Ok(moved_any)
    }

    fn transport_one_page(&self) -> Result<bool> {
        let Some((number, writes)) = self.store.buffer().oldest_transportable() else {
            return Ok(false);
        };
        debug!(page = number, writes = writes.len(), "transporting buffer page");
        for write in writes {
            self.store.database().accept(write, false)?;
        }
        self.store.database().sync()?;
        self.store.buffer().retire_oldest(number)?;
        info!(page = number, "buffer page transported");
        Ok(true)
    }
}

/// Wakes an idle worker early (new page sealed, or shutdown requested)
/// without it having to poll on a busy loop.
struct Wake {
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// A running pool of transporter worker threads (spec §4.7 "Background
/// worker(s)"). Dropping the handle stops every worker and joins its
/// thread, same as the teacher's `BackgroundScheduler::shutdown`.
pub struct TransporterHandle {
    shutdown: Arc<AtomicBool>,
    wake: Arc<Wake>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransporterHandle {
    /// Spawn `thread_count` named worker threads (`concourse-transport-N`),
    /// each looping `transporter.run_once()` and idling on a condvar for
    /// `poll_interval` (or until woken) whenever a round moves nothing.
    pub fn spawn(environment: &str, transporter: Arc<Transporter>, thread_count: usize, poll_interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Wake {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(thread_count.max(1));
        for i in 0..thread_count.max(1) {
            let transporter = Arc::clone(&transporter);
            let shutdown = Arc::clone(&shutdown);
            let wake = Arc::clone(&wake);
            let handle = std::thread::Builder::new()
                .name(format!("concourse-transport-{environment}-{i}"))
                .spawn(move || worker_loop(&transporter, &shutdown, &wake, poll_interval))
                .expect("failed to spawn transporter worker thread");
            workers.push(handle);
        }
        TransporterHandle {
            shutdown,
            wake,
            workers: Mutex::new(workers),
        }
    }

    /// Signal every worker to stop after its current round and join them.
    /// Idempotent: a second call finds an already-empty worker list.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.wake.mutex.lock();
            self.wake.condvar.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TransporterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(transporter: &Transporter, shutdown: &AtomicBool, wake: &Wake, poll_interval: Duration) {
    while !shutdown.load(Ordering::Acquire) {
        match transporter.run_once() {
            Ok(true) => continue,
            Ok(false) => {
                let mut guard = wake.mutex.lock();
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                wake.condvar.wait_for(&mut guard, poll_interval);
            }
            Err(e) => {
                error!(error = %e, "transporter round failed, backing off");
                let mut guard = wake.mutex.lock();
                wake.condvar.wait_for(&mut guard, poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_buffer::Buffer;
    use concourse_core::value::Value;
    use concourse_core::{Store, Write as CWrite};
    use concourse_storage::Database;
    use tempfile::tempdir;

    fn store(page_size: usize) -> Arc<BufferedStore> {
        let dir = tempdir().unwrap();
        let buffer = Buffer::open(&dir.path().join("buffer"), [1; 16], page_size).unwrap();
        let database = Database::open(&dir.path().join("db"), 40).unwrap();
        std::mem::forget(dir);
        Arc::new(BufferedStore::new(buffer, database))
    }

    #[test]
    fn streaming_mode_moves_one_page_at_a_time() {
        let store = store(48);
        for i in 0..10u64 {
            store
                .accept(CWrite::add("k", Value::Integer(i as i32), i, i + 1), false)
                .unwrap();
        }
        let transporter = Transporter::new(store.clone(), TransporterMode::Streaming);
        let pages_before = store.buffer().page_count();
        assert!(transporter.run_once().unwrap());
        assert_eq!(store.buffer().page_count(), pages_before - 1);
    }

    #[test]
    fn batch_mode_drains_every_transportable_page() {
        let store = store(48);
        for i in 0..20u64 {
            store
                .accept(CWrite::add("k", Value::Integer(i as i32), i, i + 1), false)
                .unwrap();
        }
        let transporter = Transporter::new(store.clone(), TransporterMode::Batch);
        assert!(transporter.run_once().unwrap());
        // Only the single live (unsealed) page should remain untransported.
        assert_eq!(store.buffer().page_count(), 1);
    }

    #[test]
    fn transported_writes_remain_readable_through_database() {
        let store = store(48);
        for i in 0..10u64 {
            store
                .accept(CWrite::add("k", Value::Integer(i as i32), i, i + 1), false)
                .unwrap();
        }
        let transporter = Transporter::new(store.clone(), TransporterMode::Batch);
        transporter.run_once().unwrap();
        assert!(!store.database().get_all_records().unwrap().is_empty());
    }

    #[test]
    fn background_workers_drain_pages_without_manual_run_once() {
        let store = store(48);
        for i in 0..10u64 {
            store
                .accept(CWrite::add("k", Value::Integer(i as i32), i, i + 1), false)
                .unwrap();
        }
        let transporter = Arc::new(Transporter::new(store.clone(), TransporterMode::Batch));
        let handle = TransporterHandle::spawn("test", transporter, 2, Duration::from_millis(5));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.buffer().page_count() > 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.buffer().page_count(), 1);
        handle.stop();
    }

    #[test]
    fn stop_is_idempotent_and_joins_promptly() {
        let store = store(48);
        let transporter = Arc::new(Transporter::new(store, TransporterMode::Streaming));
        let handle = TransporterHandle::spawn("test", transporter, 1, Duration::from_millis(5));
        handle.stop();
        handle.stop();
    }
}
