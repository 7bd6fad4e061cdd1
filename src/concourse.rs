//! `Concourse`: the facade that maps environment names to [`Engine`]s and
//! exposes the data-plane API named by spec §6.
//!
//! Every write-shaped operation below (`add`, `set`, `reconcile`, `revert`,
//! …) is expressed as a tiny program run through
//! [`concourse_engine::execute_with_retry`] against a fresh
//! [`AtomicOperation`] — exactly the pattern spec §4.5 describes for
//! `insertJson`'s id-collision retry, generalized to every derived write.
//! `stage`/`commit`/`abort` instead hand the caller a durable
//! [`Transaction`] (spec §4.6) that can accumulate `add`/`remove` calls
//! across separate round-trips before a single commit validates and
//! applies all of them.

use crate::json::{self, LinkResolver};
use crate::session::{AccessToken, Session};
use concourse_core::error::{Error, Result};
use concourse_core::value::{Operator, RecordId, Value};
use concourse_core::{Config, Criteria, RecordView, Store};
use concourse_engine::{execute_with_retry, AtomicOperation, Engine, EngineConfig, RetryPolicy, Transaction, TransactionToken};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Maps environment names to live [`Engine`]s, opening each lazily on
/// first use (spec §2 "environments are just independent engine
/// instances").
pub struct Concourse {
    config: Config,
    environments: DashMap<String, Arc<Engine>>,
    sessions: DashMap<AccessToken, Session>,
    retry_policy: RetryPolicy,
}

impl Concourse {
    /// Build a facade over `config`. No environment is opened until first
    /// referenced.
    pub fn new(config: Config) -> Self {
        Concourse {
            config,
            environments: DashMap::new(),
            sessions: DashMap::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// The process-wide configuration this facade was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The named environment (or `default_environment` if `None`),
    /// opening it on first use (spec §6 System ID handshake happens
    /// inside `Engine::open`).
    pub fn environment(&self, name: Option<&str>) -> Result<Arc<Engine>> {
        let name = name.unwrap_or(&self.config.default_environment).to_string();
        if let Some(existing) = self.environments.get(&name) {
            return Ok(Arc::clone(existing.value()));
        }
        let engine_config = EngineConfig::from_config(&self.config, &name);
        let engine = Engine::open(&name, engine_config)?;
        self.environments.insert(name.clone(), Arc::clone(&engine));
        Ok(engine)
    }

    fn run<T>(
        &self,
        env: Option<&str>,
        body: impl FnMut(&AtomicOperation) -> Result<T>,
    ) -> Result<T> {
        let engine = self.environment(env)?;
        self.run_with_engine(&engine, body)
    }

    fn run_with_engine<T>(
        &self,
        engine: &Arc<Engine>,
        body: impl FnMut(&AtomicOperation) -> Result<T>,
    ) -> Result<T> {
        execute_with_retry(
            Arc::clone(engine.store()),
            Arc::clone(engine.locks()),
            Arc::clone(engine.clock()),
            engine.lock_timeout(),
            self.retry_policy,
            body,
        )
    }

    // ---- Session control (spec §6) -----------------------------------

    /// Begin a session. Authentication is an out-of-scope external
    /// collaborator (spec §1); this always succeeds (see `session` module
    /// docs).
    pub fn login(&self, _username: &str, _password: &str) -> AccessToken {
        let session = Session::new();
        let token = session.token();
        self.sessions.insert(token, session);
        token
    }

    /// End a session. A stale token simply stops being tracked; nothing
    /// it could still authorize exists in this crate.
    pub fn logout(&self, token: AccessToken) {
        if let Some(session) = self.sessions.get(&token) {
            session.end();
        }
        self.sessions.remove(&token);
    }

    /// Begin a new durable [`Transaction`] against `env` (spec §4.6).
    pub fn stage(&self, env: Option<&str>) -> Result<Arc<Transaction>> {
        let engine = self.environment(env)?;
        Ok(engine.begin_transaction())
    }

    /// Commit a staged transaction and drop it from `env`'s registry
    /// (spec §4.6).
    pub fn commit(&self, env: Option<&str>, txn: &Transaction) -> Result<()> {
        txn.commit()?;
        if let Ok(engine) = self.environment(env) {
            engine.forget_transaction(txn.token());
        }
        Ok(())
    }

    /// Abandon a staged transaction without committing.
    pub fn abort(&self, env: Option<&str>, txn: &Transaction) {
        txn.abort();
        if let Ok(engine) = self.environment(env) {
            engine.forget_transaction(txn.token());
        }
    }

    /// Look up a previously staged transaction by its token (e.g. after
    /// it was handed across a client round-trip).
    pub fn transaction(&self, env: Option<&str>, token: TransactionToken) -> Result<Option<Arc<Transaction>>> {
        Ok(self.environment(env)?.transaction(token))
    }

    // ---- Transport (spec §4.7) ----------------------------------------

    /// Start `env`'s background transporter workers, continuously moving
    /// sealed Buffer pages into the Database (spec §4.7, §6
    /// `num_transporter_threads`). A no-op if already running.
    pub fn start_background_transport(&self, env: Option<&str>) -> Result<()> {
        self.environment(env)?.start_background_transport();
        Ok(())
    }

    /// Stop `env`'s background transporter workers, if running.
    pub fn stop_background_transport(&self, env: Option<&str>) -> Result<()> {
        self.environment(env)?.stop_background_transport();
        Ok(())
    }

    /// Run one round of `env`'s Buffer → Database transport on the
    /// calling thread. Useful for tests and admin tooling that want a
    /// single deterministic round instead of the background workers.
    pub fn transport_once(&self, env: Option<&str>) -> Result<bool> {
        self.environment(env)?.transport_once()
    }

    // ---- Reads (spec §4.4, passthrough to the composed store) --------

    /// All of `record`'s current fields.
    pub fn select(&self, record: RecordId, env: Option<&str>) -> Result<RecordView> {
        self.environment(env)?.store().select(record)
    }

    /// `select`, as of historical version `t`.
    pub fn select_at(&self, record: RecordId, t: u64, env: Option<&str>) -> Result<RecordView> {
        self.environment(env)?.store().select_at(record, t)
    }

    /// The current value-set of `(key, record)`.
    pub fn select_key(&self, key: &str, record: RecordId, env: Option<&str>) -> Result<BTreeSet<Value>> {
        self.environment(env)?.store().select_key(key, record)
    }

    /// Every record currently holding each distinct value of `key`.
    pub fn browse(&self, key: &str, env: Option<&str>) -> Result<BTreeMap<Value, HashSet<RecordId>>> {
        self.environment(env)?.store().browse(key)
    }

    /// Records whose `key` field satisfies `operator` against `values`.
    pub fn find(&self, key: &str, operator: Operator, values: &[Value], env: Option<&str>) -> Result<HashSet<RecordId>> {
        self.environment(env)?.store().find(key, operator, values)
    }

    /// Full-text search of `key`'s string values for `query`.
    pub fn search(&self, key: &str, query: &str, env: Option<&str>) -> Result<HashSet<RecordId>> {
        self.environment(env)?.store().search(key, query)
    }

    /// For every version where `(key, record)` changed, the snapshot at
    /// that version, within `[t_start, t_end]` (spec §4.4, SPEC_FULL §11).
    pub fn chronologize(
        &self,
        key: &str,
        record: RecordId,
        t_start: u64,
        t_end: u64,
        env: Option<&str>,
    ) -> Result<BTreeMap<u64, BTreeSet<Value>>> {
        self.environment(env)?.store().chronologize(key, record, t_start, t_end)
    }

    /// Human-readable change log for every field of `record`.
    pub fn audit(&self, record: RecordId, env: Option<&str>) -> Result<BTreeMap<u64, String>> {
        self.environment(env)?.store().audit(record)
    }

    /// Keys with a non-empty current value-set.
    pub fn describe(&self, record: RecordId, env: Option<&str>) -> Result<HashSet<String>> {
        self.environment(env)?.store().describe(record)
    }

    /// Whether `value` is currently in `(key, record)`'s value-set.
    pub fn verify(&self, key: &str, value: &Value, record: RecordId, env: Option<&str>) -> Result<bool> {
        self.environment(env)?.store().verify(key, value, record)
    }

    /// Whether `record` has ever received an ADD.
    pub fn contains(&self, record: RecordId, env: Option<&str>) -> Result<bool> {
        self.environment(env)?.store().contains(record)
    }

    /// Every record id currently in the Inventory.
    pub fn get_all_records(&self, env: Option<&str>) -> Result<Vec<RecordId>> {
        self.environment(env)?.store().get_all_records()
    }

    /// Follow each dot-separated `key` path from `source`, returning the
    /// value-set reached at the end of each path (spec §6 `navigate`).
    /// Every non-final segment's values must be `Link`s; non-link values
    /// at a non-final segment are silently dropped from that path's
    /// traversal (they simply have nowhere to go).
    pub fn navigate(
        &self,
        paths: &[&str],
        source: RecordId,
        env: Option<&str>,
    ) -> Result<BTreeMap<String, BTreeSet<Value>>> {
        let store = self.environment(env)?;
        let store = store.store();
        let mut out = BTreeMap::new();
        for &path in paths {
            let segments: Vec<&str> = path.split('.').collect();
            let mut frontier: HashSet<RecordId> = HashSet::from([source]);
            let mut result = BTreeSet::new();
            for (i, segment) in segments.iter().enumerate() {
                let is_last = i + 1 == segments.len();
                let mut next_frontier = HashSet::new();
                for &record in &frontier {
                    let values = store.select_key(segment, record)?;
                    if is_last {
                        result.extend(values);
                    } else {
                        next_frontier.extend(values.iter().filter_map(Value::as_link));
                    }
                }
                frontier = next_frontier;
            }
            out.insert(path.to_string(), result);
        }
        Ok(out)
    }

    // ---- Writes (spec §6 "data-plane API: Writes") --------------------

    /// Add `value` to `(key, record)`. Returns `false` (and leaves the
    /// store unchanged) if `value` is already present, or if it would be
    /// a self-link (spec §3 invariant 7, §8 testable property 8).
    pub fn add(&self, key: &str, value: Value, record: RecordId, env: Option<&str>) -> Result<bool> {
        if value.as_link() == Some(record) {
            return Ok(false);
        }
        self.run(env, |op| {
            let current = op.select_key(key, record)?;
            if current.contains(&value) {
                return Ok(false);
            }
            op.add(key.to_string(), value.clone(), record);
            Ok(true)
        })
    }

    /// Remove `value` from `(key, record)`. Returns `false` if it was not
    /// present.
    pub fn remove(&self, key: &str, value: Value, record: RecordId, env: Option<&str>) -> Result<bool> {
        self.run(env, |op| {
            let current = op.select_key(key, record)?;
            if !current.contains(&value) {
                return Ok(false);
            }
            op.remove(key.to_string(), value.clone(), record);
            Ok(true)
        })
    }

    /// Replace `(key, record)`'s entire value-set with `{value}`.
    pub fn set(&self, key: &str, value: Value, record: RecordId, env: Option<&str>) -> Result<()> {
        self.replace_field(key, record, BTreeSet::from([value]), env)
    }

    /// If `(key, record)` is not already exactly `{value}`, make it so.
    /// Semantically identical to `set`: the check is implicit in
    /// `replace_field` only staging writes for values that actually
    /// differ.
    pub fn verify_or_set(&self, key: &str, value: Value, record: RecordId, env: Option<&str>) -> Result<()> {
        self.set(key, value, record, env)
    }

    /// Make `(key, record)`'s value-set exactly `values` (adds what's
    /// missing, removes what's extra).
    pub fn reconcile(&self, key: &str, record: RecordId, values: Vec<Value>, env: Option<&str>) -> Result<()> {
        self.replace_field(key, record, values.into_iter().collect(), env)
    }

    fn replace_field(
        &self,
        key: &str,
        record: RecordId,
        desired: BTreeSet<Value>,
        env: Option<&str>,
    ) -> Result<()> {
        for value in &desired {
            if value.as_link() == Some(record) {
                return Err(Error::InvalidArgument(format!(
                    "self-link rejected: {key} on record {record}"
                )));
            }
        }
        self.run(env, |op| {
            let current = op.select_key(key, record)?;
            for value in current.difference(&desired) {
                op.remove(key.to_string(), value.clone(), record);
            }
            for value in desired.difference(&current) {
                op.add(key.to_string(), value.clone(), record);
            }
            Ok(())
        })
    }

    /// If `(key, record)` currently holds exactly `expected` (among
    /// possibly other values) for the single value `expected`, replace it
    /// with `replacement` and return `true`; otherwise leave the store
    /// unchanged and return `false`.
    pub fn verify_and_swap(
        &self,
        key: &str,
        expected: Value,
        record: RecordId,
        replacement: Value,
        env: Option<&str>,
    ) -> Result<bool> {
        if replacement.as_link() == Some(record) {
            return Err(Error::InvalidArgument(format!(
                "self-link rejected: {key} on record {record}"
            )));
        }
        self.run(env, |op| {
            let current = op.select_key(key, record)?;
            if !current.contains(&expected) {
                return Ok(false);
            }
            op.remove(key.to_string(), expected.clone(), record);
            if replacement != expected {
                op.add(key.to_string(), replacement.clone(), record);
            }
            Ok(true)
        })
    }

    /// Roll `(key, record)` back to the value-set it held at version `t`
    /// (spec §6 `revert`; SPEC_FULL §11 — implemented as the ADD/REMOVE
    /// delta between the live state and the historical snapshot).
    pub fn revert(&self, key: &str, record: RecordId, t: u64, env: Option<&str>) -> Result<()> {
        self.run(env, |op| {
            let historical = op.select_key_at(key, record, t)?;
            let current = op.select_key(key, record)?;
            for value in current.difference(&historical) {
                op.remove(key.to_string(), value.clone(), record);
            }
            for value in historical.difference(&current) {
                if value.as_link() == Some(record) {
                    return Err(Error::InvalidArgument(format!(
                        "self-link rejected while reverting {key} on record {record}"
                    )));
                }
                op.add(key.to_string(), value.clone(), record);
            }
            Ok(())
        })
    }

    /// Remove every current value from every field of `record` (spec §6
    /// `clear`).
    pub fn clear(&self, record: RecordId, env: Option<&str>) -> Result<()> {
        self.run(env, |op| {
            let view = op.select(record)?;
            for (key, values) in view {
                for value in values {
                    op.remove(key.clone(), value, record);
                }
            }
            Ok(())
        })
    }

    /// Remove every current value from `(key, record)` only.
    pub fn clear_key(&self, key: &str, record: RecordId, env: Option<&str>) -> Result<()> {
        self.run(env, |op| {
            let values = op.select_key(key, record)?;
            for value in values {
                op.remove(key.to_string(), value, record);
            }
            Ok(())
        })
    }

    /// Find the one record whose `key` field contains `value`, or create
    /// one holding just that value if none matches (spec §6 `findOrAdd`).
    /// More than one match is `DuplicateEntry` (spec §7).
    pub fn find_or_add(&self, key: &str, value: Value, env: Option<&str>) -> Result<RecordId> {
        let engine = self.environment(env)?;
        let clock = Arc::clone(engine.clock());
        let key = key.to_string();
        self.run_with_engine(&engine, move |op| {
            let matches = op.find(&key, Operator::Equals, std::slice::from_ref(&value))?;
            match matches.len() {
                0 => {
                    let mut id = clock.tick();
                    while op.contains(id)? {
                        id = clock.tick();
                    }
                    op.add(key.clone(), value.clone(), id);
                    Ok(id)
                }
                1 => Ok(*matches.iter().next().unwrap()),
                n => Err(Error::DuplicateEntry(format!(
                    "findOrAdd: {n} records match {key} = {value}"
                ))),
            }
        })
    }

    /// Evaluate `criteria`; if it matches exactly one record, return it.
    /// If it matches none, insert `doc` as a new record and return its id.
    /// More than one match is `DuplicateEntry` (spec §6 `findOrInsert`).
    pub fn find_or_insert(
        &self,
        criteria: &dyn Criteria,
        doc: &str,
        resolver: Option<&LinkResolver>,
        env: Option<&str>,
    ) -> Result<RecordId> {
        let engine = self.environment(env)?;
        let matches = criteria.evaluate(engine.store().as_ref(), None)?;
        match matches.len() {
            1 => Ok(*matches.iter().next().unwrap()),
            0 => {
                let inserted = self.insert_json(doc, None, resolver, env)?;
                inserted.into_iter().next().ok_or_else(|| {
                    Error::Parse("findOrInsert: document produced no records".into())
                })
            }
            n => Err(Error::DuplicateEntry(format!(
                "findOrInsert: {n} records matched the criteria"
            ))),
        }
    }

    /// Parse `doc` (a JSON object or array of objects) and insert each
    /// object as a new record (spec §6 `insert`). `desired_record` pins
    /// the id of a single-object document; otherwise (or for each element
    /// of an array) a fresh id is generated from the environment's clock
    /// and retried on collision (spec §4.5, the `executeWithRetry`
    /// `insertJson` id-collision case).
    pub fn insert_json(
        &self,
        doc: &str,
        desired_record: Option<RecordId>,
        resolver: Option<&LinkResolver>,
        env: Option<&str>,
    ) -> Result<Vec<RecordId>> {
        let parsed = json::parse_insert_document(doc, resolver)?;
        let engine = self.environment(env)?;
        let clock = Arc::clone(engine.clock());
        let single = parsed.len() == 1;
        let mut ids = Vec::with_capacity(parsed.len());
        for record in parsed {
            let pinned = record.id.or(if single { desired_record } else { None });
            let clock = Arc::clone(&clock);
            let id = self.run_with_engine(&engine, move |op| {
                let id = match pinned {
                    Some(id) => id,
                    None => {
                        let mut candidate = clock.tick();
                        while op.contains(candidate)? {
                            candidate = clock.tick();
                        }
                        candidate
                    }
                };
                for (key, values) in &record.fields {
                    for value in values {
                        if value.as_link() == Some(id) {
                            continue; // self-link: dropped, not inserted (mirrors `add`'s false-return)
                        }
                        op.add(key.clone(), value.clone(), id);
                    }
                }
                Ok(id)
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Render each of `records` as a JSON object (array if more than one)
    /// with `$id$` set to the record id (spec §6 `jsonify`).
    pub fn jsonify(&self, records: &[RecordId], t: Option<u64>, env: Option<&str>) -> Result<String> {
        let engine = self.environment(env)?;
        let store = engine.store();
        let mut objects = Vec::with_capacity(records.len());
        for &record in records {
            let view = match t {
                Some(t) => store.select_at(record, t)?,
                None => store.select(record)?,
            };
            let fields: BTreeMap<String, Vec<Value>> = view
                .into_iter()
                .map(|(k, set)| (k, set.into_iter().collect()))
                .collect();
            objects.push(json::record_to_json(record, &fields));
        }
        let rendered = if objects.len() == 1 {
            objects.into_iter().next().unwrap()
        } else {
            serde_json::Value::Array(objects)
        };
        Ok(rendered.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn concourse(dir: &std::path::Path) -> Concourse {
        let mut config = Config::default();
        config.buffer_directory = dir.join("buffer").to_string_lossy().into_owned();
        config.database_directory = dir.join("db").to_string_lossy().into_owned();
        Concourse::new(config)
    }

    #[test]
    fn add_rejects_duplicate_and_self_link() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        assert!(db.add("name", Value::String("jeff".into()), 17, None).unwrap());
        assert!(!db.add("name", Value::String("jeff".into()), 17, None).unwrap());
        assert_eq!(
            db.select_key("name", 17, None).unwrap(),
            BTreeSet::from([Value::String("jeff".into())])
        );

        assert!(!db.add("friend", Value::Link(5), 5, None).unwrap());
        assert!(db.select_key("friend", 5, None).unwrap().is_empty());
    }

    #[test]
    fn set_replaces_whole_field() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        db.add("age", Value::Integer(30), 1, None).unwrap();
        db.set("age", Value::Integer(31), 1, None).unwrap();
        assert_eq!(
            db.select_key("age", 1, None).unwrap(),
            BTreeSet::from([Value::Integer(31)])
        );
        let audit = db.audit(1, None).unwrap();
        assert_eq!(audit.len(), 3); // ADD 30, REMOVE 30, ADD 31
    }

    #[test]
    fn find_matches_greater_than() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        db.add("score", Value::Integer(10), 1, None).unwrap();
        db.add("score", Value::Integer(20), 2, None).unwrap();
        let hits = db
            .find("score", Operator::GreaterThan, &[Value::Integer(15)], None)
            .unwrap();
        assert_eq!(hits, HashSet::from([2]));
    }

    #[test]
    fn revert_restores_historical_state() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        let t0 = db.environment(None).unwrap().clock().current();
        db.add("x", Value::String("a".into()), 1, None).unwrap();
        db.revert("x", 1, t0, None).unwrap();
        assert!(db.select_key("x", 1, None).unwrap().is_empty());
    }

    #[test]
    fn insert_and_jsonify_round_trip() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        let ids = db
            .insert_json(r#"{"name":"A","likes":["x","y"]}"#, None, None, None)
            .unwrap();
        assert_eq!(ids.len(), 1);
        let json = db.jsonify(&ids, None, None).unwrap();
        assert!(json.contains("\"name\":\"A\""));
        assert!(json.contains(&format!("\"$id$\":{}", ids[0])));
    }

    #[test]
    fn search_finds_substring() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        db.add("bio", Value::String("the quick brown fox".into()), 1, None)
            .unwrap();
        assert_eq!(db.search("bio", "quick", None).unwrap(), HashSet::from([1]));
        assert!(db.search("bio", "zz", None).unwrap().is_empty());
    }

    #[test]
    fn find_or_add_creates_then_reuses() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        let first = db
            .find_or_add("email", Value::String("a@example.com".into()), None)
            .unwrap();
        let second = db
            .find_or_add("email", Value::String("a@example.com".into()), None)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn navigate_follows_links() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        db.add("name", Value::String("bob".into()), 2, None).unwrap();
        db.add("friend", Value::Link(2), 1, None).unwrap();
        let result = db.navigate(&["friend.name"], 1, None).unwrap();
        assert_eq!(
            result["friend.name"],
            BTreeSet::from([Value::String("bob".into())])
        );
    }

    #[test]
    fn verify_and_swap_only_succeeds_on_expected_value() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        db.add("status", Value::Tag("open".into()), 1, None).unwrap();
        assert!(!db
            .verify_and_swap("status", Value::Tag("closed".into()), 1, Value::Tag("done".into()), None)
            .unwrap());
        assert!(db
            .verify_and_swap("status", Value::Tag("open".into()), 1, Value::Tag("closed".into()), None)
            .unwrap());
        assert_eq!(
            db.select_key("status", 1, None).unwrap(),
            BTreeSet::from([Value::Tag("closed".into())])
        );
    }

    #[test]
    fn background_transport_moves_sealed_pages() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.buffer_directory = dir.path().join("buffer").to_string_lossy().into_owned();
        config.database_directory = dir.path().join("db").to_string_lossy().into_owned();
        config.buffer_page_size = 48;
        let db = Concourse::new(config);

        for i in 0..20u64 {
            db.add("k", Value::Integer(i as i32), i, None).unwrap();
        }
        let engine = db.environment(None).unwrap();
        db.start_background_transport(None).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while engine.store().buffer().page_count() > 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(engine.store().buffer().page_count(), 1);
        assert_eq!(db.get_all_records(None).unwrap().len(), 20);
        db.stop_background_transport(None).unwrap();
    }

    #[test]
    fn transactions_commit_across_separate_calls() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        let txn = db.stage(None).unwrap();
        txn.add("name", Value::String("jeff".into()), 1).unwrap();
        txn.add("age", Value::Integer(30), 1).unwrap();
        db.commit(None, &txn).unwrap();
        assert_eq!(
            db.select_key("name", 1, None).unwrap(),
            BTreeSet::from([Value::String("jeff".into())])
        );
    }

    #[test]
    fn two_transactions_racing_on_the_same_field_one_aborts() {
        let dir = tempdir().unwrap();
        let db = concourse(dir.path());
        db.add("count", Value::Integer(5), 1, None).unwrap();

        let t1 = db.stage(None).unwrap();
        let t2 = db.stage(None).unwrap();
        let seen1 = t1.select_key("count", 1).unwrap();
        let seen2 = t2.select_key("count", 1).unwrap();
        assert_eq!(seen1, seen2);
        for v in &seen1 {
            t1.remove("count", v.clone(), 1).unwrap();
            t2.remove("count", v.clone(), 1).unwrap();
        }
        t1.add("count", Value::Integer(6), 1).unwrap();
        t2.add("count", Value::Integer(6), 1).unwrap();

        let first = db.commit(None, &t1);
        let second = db.commit(None, &t2);
        assert!(first.is_ok());
        assert!(second.is_err());
    }
}
