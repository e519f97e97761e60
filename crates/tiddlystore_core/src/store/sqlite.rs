//! Relational tiddler store on SQLite.
//!
//! # Responsibility
//! - Keep current values in `tiddler(title, meta, content, revision)`.
//! - Keep history in `tiddler_history(title, revision, data, written_at)`.
//!
//! # Invariants
//! - Each put/delete runs in one `IMMEDIATE` transaction, so the revision
//!   read and the writes are serialized against other writers on the file.
//! - History trimming runs in a savepoint; a failed trim is rolled back to
//!   the savepoint, logged, and the write still commits.
//! - System keys store the full JSON in `meta` and leave `content` NULL.

use crate::db::{open_db, open_db_in_memory, DbError};
use crate::error::{StoreError, StoreOp, StoreResult};
use crate::model::tiddler::{is_macro_meta, is_system_key, Revision, Tiddler, FALLBACK_REVISION};
use crate::retention::{history_key, records_history, trim_floor, HistoryLimit, RetentionSetting};
use crate::store::{
    log_close, log_open_error, log_open_ok, log_put_ok, log_trim_failure, log_trim_ok, OpContext,
    TiddlerStore, IN_MEMORY_SOURCE,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

pub const BACKEND_NAME: &str = "sqlite";

/// SQLite-backed store. `None` once closed.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    retention: RetentionSetting,
}

/// Registry constructor. `:memory:` selects a private in-memory database.
pub fn open_store(data_source: &str) -> StoreResult<Arc<dyn TiddlerStore>> {
    Ok(Arc::new(SqliteStore::open(data_source)?))
}

impl SqliteStore {
    /// Opens the database at `data_source` and applies pending migrations.
    pub fn open(data_source: &str) -> StoreResult<Self> {
        let started_at = Instant::now();
        let opened = if data_source == IN_MEMORY_SOURCE {
            open_db_in_memory()
        } else {
            ensure_parent_dir(Path::new(data_source))
                .map_err(|err| StoreError::unavailable(BACKEND_NAME, data_source, err))?;
            open_db(data_source)
        };

        match opened {
            Ok(conn) => {
                log_open_ok(BACKEND_NAME, data_source, started_at);
                Ok(Self::from_connection(conn))
            }
            Err(err) => {
                log_open_error(BACKEND_NAME, data_source, &err);
                Err(StoreError::unavailable(BACKEND_NAME, data_source, err))
            }
        }
    }

    /// Wraps a connection that already has migrations applied.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            retention: RetentionSetting::default(),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }
}

impl TiddlerStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn get(&self, key: &str) -> StoreResult<Tiddler> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT meta, content FROM tiddler WHERE title = ?1;",
                    [key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .with_op(StoreOp::Get, key)?;

            let Some((meta, content)) = row else {
                return Err(StoreError::NotFound(key.to_string()));
            };
            let text = if is_system_key(key) {
                None
            } else {
                content.map(String::into_bytes)
            };
            Tiddler::from_stored(key, meta.into_bytes(), text)
                .map_err(|err| StoreError::corrupt(key, err))
        })
    }

    fn all(&self) -> StoreResult<Vec<Tiddler>> {
        self.with_conn(|conn| {
            let unkeyed = |err: rusqlite::Error| StoreError::io_unkeyed(StoreOp::All, err);
            let mut stmt = conn
                .prepare("SELECT title, meta, content FROM tiddler;")
                .map_err(unkeyed)?;
            let mut rows = stmt.query([]).map_err(unkeyed)?;

            let mut tiddlers = Vec::new();
            while let Some(row) = rows.next().map_err(unkeyed)? {
                let title: String = row.get(0).map_err(unkeyed)?;
                let meta: String = row.get(1).map_err(unkeyed)?;
                let content: Option<String> = row.get(2).map_err(unkeyed)?;

                let text = if is_macro_meta(meta.as_bytes()) && !is_system_key(&title) {
                    content.map(String::into_bytes)
                } else {
                    None
                };
                let tiddler = Tiddler::from_stored(title.as_str(), meta.into_bytes(), text)
                    .map_err(|err| StoreError::corrupt(&title, err))?;
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

        let revision = self.with_conn(|conn| {
            let mut tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .with_op(StoreOp::Put, key)?;

            let last = tx
                .query_row(
                    "SELECT revision FROM tiddler WHERE title = ?1;",
                    [key],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .with_op(StoreOp::Put, key)?
                .map_or(0, revision_from_db);
            let revision = last + 1;
            let stamped = tiddler.stamp(revision)?;

            let (meta, content) = if tiddler.is_system() {
                (stamped.fat.as_str(), None)
            } else {
                (stamped.meta.as_str(), Some(stamped.text.as_str()))
            };
            tx.execute(
                "INSERT INTO tiddler (title, meta, content, revision)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(title) DO UPDATE SET
                    meta = excluded.meta,
                    content = excluded.content,
                    revision = excluded.revision;",
                params![key, meta, content, revision_to_db(revision)],
            )
            .with_op(StoreOp::Put, key)?;

            if keep_history {
                tx.execute(
                    "INSERT OR REPLACE INTO tiddler_history (title, revision, data, written_at)
                     VALUES (?1, ?2, ?3, (strftime('%s', 'now') * 1000));",
                    params![key, revision_to_db(revision), stamped.fat.as_str()],
                )
                .with_op(StoreOp::Put, key)?;

                if let Some(floor) = trim_floor(limit, revision) {
                    match trim_history(&mut tx, key, floor) {
                        Ok(removed) => log_trim_ok(BACKEND_NAME, revision, removed),
                        Err(err) => log_trim_failure(BACKEND_NAME, revision, &err),
                    }
                }
            }

            tx.commit().with_op(StoreOp::Put, key)?;
            Ok(revision)
        })?;

        log_put_ok(BACKEND_NAME, tiddler, revision, started_at);
        Ok(revision)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .with_op(StoreOp::Delete, key)?;

            let changed = tx
                .execute("DELETE FROM tiddler WHERE title = ?1;", [key])
                .with_op(StoreOp::Delete, key)?;
            if changed == 0 {
                return Err(StoreError::NotFound(key.to_string()));
            }
            tx.execute("DELETE FROM tiddler_history WHERE title = ?1;", [key])
                .with_op(StoreOp::Delete, key)?;

            tx.commit().with_op(StoreOp::Delete, key)
        })
    }

    fn close(&self) -> StoreResult<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        log_close(BACKEND_NAME, conn.is_some());
        match conn {
            Some(conn) => conn
                .close()
                .map_err(|(_, err)| StoreError::io_unkeyed(StoreOp::Close, err)),
            None => Ok(()),
        }
    }

    fn set_max_history(&self, limit: HistoryLimit) {
        self.retention.set(limit);
    }

    fn max_history(&self) -> HistoryLimit {
        self.retention.get()
    }

    fn history(&self, key: &str) -> StoreResult<Vec<Revision>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT revision FROM tiddler_history
                     WHERE title = ?1
                     ORDER BY revision ASC;",
                )
                .with_op(StoreOp::History, key)?;
            let revisions = stmt
                .query_map([key], |row| row.get::<_, i64>(0))
                .with_op(StoreOp::History, key)?
                .map(|revision| revision.map(revision_from_db))
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_op(StoreOp::History, key)?;
            Ok(revisions)
        })
    }

    fn history_entry(&self, key: &str, revision: Revision) -> StoreResult<Tiddler> {
        self.with_conn(|conn| {
            let data = conn
                .query_row(
                    "SELECT data FROM tiddler_history WHERE title = ?1 AND revision = ?2;",
                    params![key, revision_to_db(revision)],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .with_op(StoreOp::History, key)?;
            let Some(data) = data else {
                return Err(StoreError::NotFound(history_key(key, revision)));
            };
            Tiddler::from_json(key, data.as_bytes()).map_err(|err| StoreError::corrupt(key, err))
        })
    }
}

fn trim_history(tx: &mut Transaction<'_>, key: &str, floor: Revision) -> Result<usize, DbError> {
    let savepoint = tx.savepoint()?;
    let removed = savepoint.execute(
        "DELETE FROM tiddler_history WHERE title = ?1 AND revision <= ?2;",
        params![key, revision_to_db(floor)],
    )?;
    savepoint.commit()?;
    Ok(removed)
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn revision_to_db(revision: Revision) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

fn revision_from_db(value: i64) -> Revision {
    Revision::try_from(value)
        .ok()
        .filter(|revision| *revision > 0)
        .unwrap_or(FALLBACK_REVISION)
}

#[cfg(test)]
mod tests {
    use super::{revision_from_db, revision_to_db, SqliteStore};
    use crate::model::tiddler::Tiddler;
    use crate::store::TiddlerStore;

    #[test]
    fn revision_conversion_clamps_out_of_range_values() {
        assert_eq!(revision_to_db(7), 7);
        assert_eq!(revision_to_db(u64::MAX), i64::MAX);
        assert_eq!(revision_from_db(9), 9);
        assert_eq!(revision_from_db(-3), 1);
        assert_eq!(revision_from_db(0), 1);
    }

    #[test]
    fn system_rows_keep_content_null() {
        let store = SqliteStore::open(":memory:").unwrap();
        store
            .put(&Tiddler::decode(br#"{"title":"$:/StoryList","text":"list"}"#).unwrap())
            .unwrap();

        let content = store
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT content FROM tiddler WHERE title = '$:/StoryList';",
                        [],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert_eq!(content, None);
    }

    #[test]
    fn history_rows_record_write_time() {
        let store = SqliteStore::open(":memory:").unwrap();
        store
            .put(&Tiddler::decode(br#"{"title":"Page","text":"x"}"#).unwrap())
            .unwrap();

        let written_at = store
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT written_at FROM tiddler_history WHERE title = 'Page';",
                        [],
                        |row| row.get::<_, i64>(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert!(written_at > 0);
    }
}
