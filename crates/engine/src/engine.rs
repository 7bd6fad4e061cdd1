//! `Engine`: owns one environment's Buffer, Database, lock manager, clock,
//! transporter, and the registry of open transactions (spec §4, §6).

use crate::buffered_store::BufferedStore;
use crate::transaction::{Transaction, TransactionToken};
use crate::transporter::{Transporter, TransporterHandle, TransporterMode};
use concourse_buffer::Buffer;
use concourse_concurrency::LockManager;
use concourse_core::error::{Error, Result};
use concourse_core::{Clock, Config};
use concourse_storage::Database;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const SYSTEM_ID_FILE: &str = ".id";

/// Per-environment settings an `Engine` needs beyond what's already in
/// [`Config`] — the pieces that vary by environment name rather than by
/// process (spec §6: one process may serve several named environments).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding this environment's Buffer pages.
    pub buffer_directory: PathBuf,
    /// Directory holding this environment's Database blocks.
    pub database_directory: PathBuf,
    /// Bytes per Buffer page.
    pub buffer_page_size: usize,
    /// Longest indexed search substring.
    pub max_search_substring_length: usize,
    /// Streaming vs batch transport.
    pub transporter_mode: TransporterMode,
    /// Number of background transporter worker threads (spec §6
    /// `num_transporter_threads`) `start_background_transport` spawns.
    pub transporter_thread_count: usize,
    /// How long an idle transporter worker sleeps between rounds that
    /// moved nothing, before checking again.
    pub transporter_poll_interval: Duration,
    /// How long commit/lock-acquisition waits before surfacing `RETRY`.
    pub lock_timeout: Duration,
    /// How long an idle `Transaction` may sit staged before it expires.
    pub transaction_idle_timeout: Duration,
}

impl EngineConfig {
    /// Derive per-environment directories and settings from the process's
    /// layered [`Config`] and an environment name (spec §6: each
    /// environment gets `<buffer_directory>/<name>` and
    /// `<database_directory>/<name>`).
    pub fn from_config(config: &Config, environment: &str) -> Self {
        let mode = if config.enable_batch_transports {
            TransporterMode::Batch
        } else {
            TransporterMode::Streaming
        };
        EngineConfig {
            buffer_directory: concourse_core::config::expand_home(&config.buffer_directory)
                .join(environment),
            database_directory: concourse_core::config::expand_home(&config.database_directory)
                .join(environment),
            buffer_page_size: config.buffer_page_size,
            max_search_substring_length: config.max_search_substring_length,
            transporter_mode: mode,
            transporter_thread_count: config.num_transporter_threads.max(1),
            transporter_poll_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(5),
            transaction_idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// One open environment: the composed store, lock manager, clock, and
/// live transaction registry clients interact with (spec §4 "Engine").
pub struct Engine {
    name: String,
    store: Arc<BufferedStore>,
    locks: Arc<LockManager>,
    clock: Arc<Clock>,
    transporter: Arc<Transporter>,
    transporter_threads: usize,
    transporter_poll_interval: Duration,
    background_transport: Mutex<Option<TransporterHandle>>,
    transactions: DashMap<TransactionToken, Arc<Transaction>>,
    lock_timeout: Duration,
    idle_timeout: Duration,
}

impl Engine {
    /// Open (or create) the named environment, performing the system-id
    /// handshake between its Buffer and Database directories (spec §6: a
    /// mismatch between the two stored ids is a fatal startup error — it
    /// means the directories were assembled from two different
    /// environments).
    pub fn open(name: &str, config: EngineConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.buffer_directory).map_err(Error::Io)?;
        std::fs::create_dir_all(&config.database_directory).map_err(Error::Io)?;

        let buffer_id = load_or_create_system_id(&config.buffer_directory)?;
        let database_id = load_or_create_system_id(&config.database_directory)?;
        if buffer_id != database_id {
            return Err(Error::Fatal(format!(
                "environment {name}: system id mismatch between buffer ({}) and database ({})",
                Uuid::from_bytes(buffer_id),
                Uuid::from_bytes(database_id)
            )));
        }

        let buffer = Buffer::open(&config.buffer_directory, buffer_id, config.buffer_page_size)?;
        let database = Database::open(&config.database_directory, config.max_search_substring_length)?;
        let store = Arc::new(BufferedStore::new(buffer, database));
        let locks = Arc::new(LockManager::new());
        let clock = Arc::new(Clock::new());
        let transporter = Arc::new(Transporter::new(store.clone(), config.transporter_mode));

        info!(environment = name, "engine opened");
        Ok(Arc::new(Engine {
            name: name.to_string(),
            store,
            locks,
            clock,
            transporter,
            transporter_threads: config.transporter_thread_count,
            transporter_poll_interval: config.transporter_poll_interval,
            background_transport: Mutex::new(None),
            transactions: DashMap::new(),
            lock_timeout: config.lock_timeout,
            idle_timeout: config.transaction_idle_timeout,
        }))
    }

    /// This environment's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The composed Buffer-over-Database store. Shared by
    /// `AtomicOperation`/`Transaction` as their validation/commit target.
    pub fn store(&self) -> &Arc<BufferedStore> {
        &self.store
    }

    /// The lock manager guarding this environment's records/fields/ranges.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The process-wide version clock used to stamp every write accepted
    /// through this environment.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// How long a lock acquisition (or commit validation) waits before an
    /// `AtomicOperation` gives up and surfaces `RETRY` (spec §5).
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Run one round of the Buffer → Database transport on the calling
    /// thread. Useful for tests and `fsck`-style admin tooling that want
    /// deterministic control over when a round runs, independent of
    /// whatever background workers (if any) are also active.
    pub fn transport_once(&self) -> Result<bool> {
        self.transporter.run_once()
    }

    /// Start `num_transporter_threads` (spec §6) named background workers
    /// that continuously move sealed Buffer pages into the Database
    /// (spec §4.7 "Background worker(s)"). A no-op if already started.
    /// Stopped by `stop_background_transport`, or automatically when the
    /// `Engine` is dropped.
    pub fn start_background_transport(&self) {
        let mut guard = self.background_transport.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(TransporterHandle::spawn(
            &self.name,
            Arc::clone(&self.transporter),
            self.transporter_threads,
            self.transporter_poll_interval,
        ));
    }

    /// Stop this environment's background transporter workers, if
    /// running, and join their threads.
    pub fn stop_background_transport(&self) {
        if let Some(handle) = self.background_transport.lock().take() {
            handle.stop();
        }
    }

    /// Begin a new token-bearing [`Transaction`] (spec §4.6).
    pub fn begin_transaction(self: &Arc<Self>) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            Arc::clone(&self.clock),
            self.lock_timeout,
            self.idle_timeout,
        ));
        self.transactions.insert(txn.token(), Arc::clone(&txn));
        txn
    }

    /// Look up a live transaction by its token.
    pub fn transaction(&self, token: TransactionToken) -> Option<Arc<Transaction>> {
        self.transactions.get(&token).map(|e| Arc::clone(e.value()))
    }

    /// Drop a transaction from the registry once it has committed,
    /// aborted, or expired.
    pub fn forget_transaction(&self, token: TransactionToken) {
        self.transactions.remove(&token);
    }

    /// Sweep and forget every transaction that has been idle longer than
    /// its configured timeout (spec §4.6). Returns the number reaped.
    pub fn reap_expired_transactions(&self) -> usize {
        let expired: Vec<TransactionToken> = self
            .transactions
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| *e.key())
            .collect();
        for token in &expired {
            self.transactions.remove(token);
            warn!(environment = %self.name, ?token, "transaction expired and was reaped");
        }
        expired.len()
    }
}

fn load_or_create_system_id(dir: &Path) -> Result<[u8; 16]> {
    let path = dir.join(SYSTEM_ID_FILE);
    if path.exists() {
        let bytes = std::fs::read(&path).map_err(Error::Io)?;
        if bytes.len() != 16 {
            return Err(Error::Corruption(format!(
                "system id file {} is not 16 bytes",
                path.display()
            )));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Ok(id)
    } else {
        let id = *Uuid::new_v4().as_bytes();
        std::fs::write(&path, id).map_err(Error::Io)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            buffer_directory: dir.join("buffer"),
            database_directory: dir.join("db"),
            buffer_page_size: 8192,
            max_search_substring_length: 40,
            transporter_mode: TransporterMode::Streaming,
            transporter_thread_count: 2,
            transporter_poll_interval: Duration::from_millis(5),
            lock_timeout: Duration::from_millis(200),
            transaction_idle_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn open_creates_matching_system_ids() {
        let dir = tempdir().unwrap();
        let engine = Engine::open("default", config(dir.path())).unwrap();
        assert_eq!(engine.name(), "default");
        let buffer_id = std::fs::read(dir.path().join("buffer").join(SYSTEM_ID_FILE)).unwrap();
        let db_id = std::fs::read(dir.path().join("db").join(SYSTEM_ID_FILE)).unwrap();
        assert_eq!(buffer_id, db_id);
    }

    #[test]
    fn reopen_detects_mismatched_system_ids() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("buffer")).unwrap();
        std::fs::create_dir_all(dir.path().join("db")).unwrap();
        std::fs::write(
            dir.path().join("buffer").join(SYSTEM_ID_FILE),
            *Uuid::new_v4().as_bytes(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("db").join(SYSTEM_ID_FILE),
            *Uuid::new_v4().as_bytes(),
        )
        .unwrap();
        let err = Engine::open("default", config(dir.path())).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn background_transport_starts_stops_and_is_idempotent() {
        use concourse_core::value::Value;
        use concourse_core::{Store, Write as CWrite};

        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.buffer_page_size = 48;
        let engine = Engine::open("default", cfg).unwrap();

        for i in 0..20u64 {
            engine
                .store()
                .accept(CWrite::add("k", Value::Integer(i as i32), i, i + 1), false)
                .unwrap();
        }

        engine.start_background_transport();
        engine.start_background_transport(); // no-op second call

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while engine.store().buffer().page_count() > 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.store().buffer().page_count(), 1);

        engine.stop_background_transport();
        engine.stop_background_transport(); // idempotent
    }

    #[test]
    fn begin_transaction_registers_and_forgets() {
        let dir = tempdir().unwrap();
        let engine = Engine::open("default", config(dir.path())).unwrap();
        let txn = engine.begin_transaction();
        let token = txn.token();
        assert!(engine.transaction(token).is_some());
        engine.forget_transaction(token);
        assert!(engine.transaction(token).is_none());
    }
}
