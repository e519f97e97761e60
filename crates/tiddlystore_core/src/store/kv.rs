//! Embedded key-value tiddler store backed by redb.
//!
//! # Responsibility
//! - Keep current values in the `tiddler` table as `<key>|1` (metadata) and
//!   `<key>|2` (body).
//! - Keep history in the `tiddler_history` table as `<key>#<revision>`.
//!
//! # Invariants
//! - A put reads the current revision and writes every record inside one
//!   write transaction; redb admits one writer at a time, so concurrent puts
//!   on a key never reuse a revision.
//! - History trimming runs in the same transaction as the write. A trim
//!   failure is logged and the write still commits.

use crate::error::{StoreError, StoreOp, StoreResult};
use crate::model::tiddler::{current_revision, is_macro_meta, is_system_key, Revision, Tiddler};
use crate::retention::{
    history_key, parse_history_key, records_history, trim_floor, HistoryLimit, RetentionSetting,
};
use crate::store::{
    log_close, log_open_error, log_open_ok, log_put_ok, log_trim_failure, log_trim_ok, OpContext,
    TiddlerStore, IN_MEMORY_SOURCE,
};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, StorageError, Table, TableDefinition};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

pub const BACKEND_NAME: &str = "kv";

const TIDDLER_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tiddler");
const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tiddler_history");

const META_SUFFIX: &str = "|1";
const BODY_SUFFIX: &str = "|2";

/// redb-backed store. `None` once closed.
#[derive(Debug)]
pub struct KvStore {
    db: RwLock<Option<Database>>,
    retention: RetentionSetting,
}

/// Registry constructor. `:memory:` selects a non-persistent database.
pub fn open_store(data_source: &str) -> StoreResult<Arc<dyn TiddlerStore>> {
    let store = if data_source == IN_MEMORY_SOURCE {
        KvStore::in_memory()?
    } else {
        KvStore::open(data_source)?
    };
    Ok(Arc::new(store))
}

fn meta_key(key: &str) -> String {
    format!("{key}{META_SUFFIX}")
}

fn body_key(key: &str) -> String {
    format!("{key}{BODY_SUFFIX}")
}

impl KvStore {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let started_at = Instant::now();
        let path = path.as_ref();
        let source = path.display().to_string();

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            if let Err(err) = std::fs::create_dir_all(parent) {
                log_open_error(BACKEND_NAME, &source, &err);
                return Err(StoreError::unavailable(BACKEND_NAME, &source, err));
            }
        }

        let db = match Database::builder().create(path) {
            Ok(db) => db,
            Err(err) => {
                log_open_error(BACKEND_NAME, &source, &err);
                return Err(StoreError::unavailable(BACKEND_NAME, &source, err));
            }
        };
        Self::from_database(db, &source, started_at)
    }

    pub fn in_memory() -> StoreResult<Self> {
        let started_at = Instant::now();
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|err| StoreError::unavailable(BACKEND_NAME, IN_MEMORY_SOURCE, err))?;
        Self::from_database(db, IN_MEMORY_SOURCE, started_at)
    }

    fn from_database(db: Database, source: &str, started_at: Instant) -> StoreResult<Self> {
        if let Err(err) = create_tables(&db) {
            log_open_error(BACKEND_NAME, source, &err);
            return Err(StoreError::Unavailable {
                backend: BACKEND_NAME,
                data_source: source.to_string(),
                source: err,
            });
        }
        log_open_ok(BACKEND_NAME, source, started_at);
        Ok(Self {
            db: RwLock::new(Some(db)),
            retention: RetentionSetting::default(),
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StoreError::Closed),
        }
    }
}

fn create_tables(db: &Database) -> Result<(), crate::error::BackendError> {
    let tx = db.begin_write()?;
    {
        let _current = tx.open_table(TIDDLER_TABLE)?;
        let _history = tx.open_table(HISTORY_TABLE)?;
    }
    tx.commit()?;
    Ok(())
}

impl TiddlerStore for KvStore {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn get(&self, key: &str) -> StoreResult<Tiddler> {
        self.with_db(|db| {
            let tx = db.begin_read().with_op(StoreOp::Get, key)?;
            let table = tx.open_table(TIDDLER_TABLE).with_op(StoreOp::Get, key)?;

            let Some(meta) = table
                .get(meta_key(key).as_str())
                .with_op(StoreOp::Get, key)?
                .map(|row| row.value().to_vec())
            else {
                return Err(StoreError::NotFound(key.to_string()));
            };
            let text = if is_system_key(key) {
                None
            } else {
                table
                    .get(body_key(key).as_str())
                    .with_op(StoreOp::Get, key)?
                    .map(|row| row.value().to_vec())
            };
            Tiddler::from_stored(key, meta, text).map_err(|err| StoreError::corrupt(key, err))
        })
    }

    fn all(&self) -> StoreResult<Vec<Tiddler>> {
        self.with_db(|db| {
            let tx = db
                .begin_read()
                .map_err(|err| StoreError::io_unkeyed(StoreOp::All, err))?;
            let table = tx
                .open_table(TIDDLER_TABLE)
                .map_err(|err| StoreError::io_unkeyed(StoreOp::All, err))?;

            let mut tiddlers = Vec::new();
            for entry in table
                .iter()
                .map_err(|err| StoreError::io_unkeyed(StoreOp::All, err))?
            {
                let (stored_key, meta) =
                    entry.map_err(|err| StoreError::io_unkeyed(StoreOp::All, err))?;
                let Some(key) = stored_key.value().strip_suffix(META_SUFFIX) else {
                    continue;
                };
                let meta = meta.value().to_vec();
                let text = if is_macro_meta(&meta) && !is_system_key(key) {
                    table
                        .get(body_key(key).as_str())
                        .with_op(StoreOp::All, key)?
                        .map(|row| row.value().to_vec())
                } else {
                    None
                };
                let tiddler = Tiddler::from_stored(key, meta, text)
                    .map_err(|err| StoreError::corrupt(key, err))?;
                tiddlers.push(tiddler);
            }
            Ok(tiddlers)
        })
    }

    fn put(&self, tiddler: &Tiddler) -> StoreResult<Revision> {
        let started_at = Instant::now();
        let key = tiddler.key();
        let limit = self.retention.get();
        let keep_history = records_history(limit, tiddler.is_draft(), tiddler.is_system());

        let revision = self.with_db(|db| {
            let tx = db.begin_write().with_op(StoreOp::Put, key)?;
            let revision = {
                let mut current = tx.open_table(TIDDLER_TABLE).with_op(StoreOp::Put, key)?;
                let last = current
                    .get(meta_key(key).as_str())
                    .with_op(StoreOp::Put, key)?
                    .map_or(0, |row| current_revision(row.value()));
                let revision = last + 1;
                let stamped = tiddler.stamp(revision)?;

                if tiddler.is_system() {
                    current
                        .insert(meta_key(key).as_str(), stamped.fat.as_bytes())
                        .with_op(StoreOp::Put, key)?;
                } else {
                    current
                        .insert(body_key(key).as_str(), stamped.text.as_bytes())
                        .with_op(StoreOp::Put, key)?;
                    current
                        .insert(meta_key(key).as_str(), stamped.meta.as_bytes())
                        .with_op(StoreOp::Put, key)?;
                }

                if keep_history {
                    let mut history = tx.open_table(HISTORY_TABLE).with_op(StoreOp::Put, key)?;
                    history
                        .insert(history_key(key, revision).as_str(), stamped.fat.as_bytes())
                        .with_op(StoreOp::Put, key)?;
                    if let Some(floor) = trim_floor(limit, revision) {
                        match remove_history_through(&mut history, key, floor) {
                            Ok(removed) => log_trim_ok(BACKEND_NAME, revision, removed),
                            Err(err) => log_trim_failure(BACKEND_NAME, revision, &err),
                        }
                    }
                }
                revision
            };
            tx.commit().with_op(StoreOp::Put, key)?;
            Ok(revision)
        })?;

        log_put_ok(BACKEND_NAME, tiddler, revision, started_at);
        Ok(revision)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.with_db(|db| {
            let tx = db.begin_write().with_op(StoreOp::Delete, key)?;
            {
                let mut current = tx.open_table(TIDDLER_TABLE).with_op(StoreOp::Delete, key)?;
                let existed = current
                    .remove(meta_key(key).as_str())
                    .with_op(StoreOp::Delete, key)?
                    .is_some();
                if !existed {
                    // Dropping the transaction aborts it.
                    return Err(StoreError::NotFound(key.to_string()));
                }
                current
                    .remove(body_key(key).as_str())
                    .with_op(StoreOp::Delete, key)?;

                let mut history = tx.open_table(HISTORY_TABLE).with_op(StoreOp::Delete, key)?;
                remove_history_through(&mut history, key, Revision::MAX)
                    .with_op(StoreOp::Delete, key)?;
            }
            tx.commit().with_op(StoreOp::Delete, key)?;
            Ok(())
        })
    }

    fn close(&self) -> StoreResult<()> {
        let db = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        log_close(BACKEND_NAME, db.is_some());
        Ok(())
    }

    fn set_max_history(&self, limit: HistoryLimit) {
        self.retention.set(limit);
    }

    fn max_history(&self) -> HistoryLimit {
        self.retention.get()
    }

    fn history(&self, key: &str) -> StoreResult<Vec<Revision>> {
        self.with_db(|db| {
            let tx = db.begin_read().with_op(StoreOp::History, key)?;
            let table = tx.open_table(HISTORY_TABLE).with_op(StoreOp::History, key)?;
            let mut revisions = history_revisions(&table, key).with_op(StoreOp::History, key)?;
            revisions.sort_unstable();
            Ok(revisions)
        })
    }

    fn history_entry(&self, key: &str, revision: Revision) -> StoreResult<Tiddler> {
        self.with_db(|db| {
            let tx = db.begin_read().with_op(StoreOp::History, key)?;
            let table = tx.open_table(HISTORY_TABLE).with_op(StoreOp::History, key)?;
            let entry_key = history_key(key, revision);
            let Some(fat) = table
                .get(entry_key.as_str())
                .with_op(StoreOp::History, key)?
                .map(|row| row.value().to_vec())
            else {
                return Err(StoreError::NotFound(entry_key));
            };
            Tiddler::from_json(key, &fat).map_err(|err| StoreError::corrupt(key, err))
        })
    }
}

/// History revisions of `key` in table order (lexicographic, not numeric).
fn history_revisions(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Vec<Revision>, StorageError> {
    let prefix = format!("{key}#");
    let mut revisions = Vec::new();
    for entry in table.range(prefix.as_str()..)? {
        let (stored_key, _) = entry?;
        let stored_key = stored_key.value();
        if !stored_key.starts_with(&prefix) {
            break;
        }
        if let Some(revision) = parse_history_key(key, stored_key) {
            revisions.push(revision);
        }
    }
    Ok(revisions)
}

fn remove_history_through(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    floor: Revision,
) -> Result<usize, StorageError> {
    let expired: Vec<Revision> = history_revisions(&*table, key)?
        .into_iter()
        .filter(|revision| *revision <= floor)
        .collect();
    for revision in &expired {
        table.remove(history_key(key, *revision).as_str())?;
    }
    Ok(expired.len())
}

#[cfg(test)]
mod tests {
    use super::{body_key, meta_key, KvStore};
    use crate::model::tiddler::Tiddler;
    use crate::store::TiddlerStore;

    #[test]
    fn record_keys_use_numeric_suffixes() {
        assert_eq!(meta_key("Page"), "Page|1");
        assert_eq!(body_key("Page"), "Page|2");
    }

    #[test]
    fn history_ordering_is_numeric_past_nine_revisions() {
        let store = KvStore::in_memory().unwrap();
        let tiddler = Tiddler::decode(br#"{"title":"Page","text":"x"}"#).unwrap();
        for _ in 0..11 {
            store.put(&tiddler).unwrap();
        }
        let history = store.history("Page").unwrap();
        assert_eq!(history, (1..=11).collect::<Vec<_>>());
    }

    #[test]
    fn history_of_prefixed_keys_stays_separate() {
        let store = KvStore::in_memory().unwrap();
        store
            .put(&Tiddler::decode(br#"{"title":"A"}"#).unwrap())
            .unwrap();
        store
            .put(&Tiddler::decode(br#"{"title":"A#1"}"#).unwrap())
            .unwrap();
        assert_eq!(store.history("A").unwrap(), vec![1]);
        assert_eq!(store.history("A#1").unwrap(), vec![1]);

        store.delete("A").unwrap();
        assert_eq!(store.history("A#1").unwrap(), vec![1]);
    }
}
