//! Storage engine contract and its physical backends.
//!
//! # Responsibility
//! - Define the one trait every backend satisfies (`TiddlerStore`).
//! - Host the flat-file, embedded key-value and SQLite implementations.
//!
//! # Invariants
//! - Revisions per key are `1, 2, 3, ...`; the next write reads the current
//!   revision and adds one.
//! - `delete` removes the current value and purges the key's history, so a
//!   re-created key starts again at revision 1.
//! - Drafts and system keys never write history.
//! - History trim failures are logged, never returned.
//! - Every backend is `Send + Sync` and shared across request threads.

use crate::error::{BackendError, StoreError, StoreOp, StoreResult};
use crate::model::tiddler::{Revision, Tiddler};
use crate::retention::HistoryLimit;
use log::{debug, error, info, warn};
use std::fmt::{Debug, Display};
use std::time::Instant;

pub mod flat_file;
pub mod kv;
pub mod sqlite;

pub use flat_file::FlatFileStore;
pub use kv::KvStore;
pub use sqlite::SqliteStore;

/// Data source that selects an in-memory substrate where one exists.
pub const IN_MEMORY_SOURCE: &str = ":memory:";

/// Storage engine contract.
///
/// Implementations own durable tiddler state exclusively. All methods take
/// `&self`; each backend provides its own interior synchronization.
pub trait TiddlerStore: Send + Sync + Debug {
    /// Registry name of the backend.
    fn backend_name(&self) -> &'static str;

    /// Returns the current value of `key`.
    ///
    /// Fails with [`StoreError::NotFound`] when the key was never written or
    /// has been deleted. System keys are returned skinny, with their body
    /// inline in the stored metadata.
    fn get(&self, key: &str) -> StoreResult<Tiddler>;

    /// Returns every live tiddler, skinny except macro-tagged ones.
    ///
    /// Order is the backend's natural iteration order.
    fn all(&self) -> StoreResult<Vec<Tiddler>>;

    /// Writes `tiddler` as the next revision of its key and returns it.
    fn put(&self, tiddler: &Tiddler) -> StoreResult<Revision>;

    /// Removes the current value and all history of `key`.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Releases the substrate. Safe to call repeatedly.
    fn close(&self) -> StoreResult<()>;

    /// Sets the history retention for subsequent writes.
    fn set_max_history(&self, limit: HistoryLimit);

    fn max_history(&self) -> HistoryLimit;

    /// Revisions currently held in history for `key`, ascending.
    fn history(&self, key: &str) -> StoreResult<Vec<Revision>>;

    /// One history entry, fat.
    fn history_entry(&self, key: &str, revision: Revision) -> StoreResult<Tiddler>;
}

/// Attaches operation/key context to substrate errors.
pub(crate) trait OpContext<T> {
    fn with_op(self, op: StoreOp, key: &str) -> StoreResult<T>;
}

impl<T, E: Into<BackendError>> OpContext<T> for Result<T, E> {
    fn with_op(self, op: StoreOp, key: &str) -> StoreResult<T> {
        self.map_err(|err| StoreError::io(op, key, err))
    }
}

pub(crate) fn log_open_ok(backend: &str, data_source: &str, started_at: Instant) {
    info!(
        "event=store_open module=store backend={} status=ok data_source={} duration_ms={}",
        backend,
        data_source,
        started_at.elapsed().as_millis()
    );
}

pub(crate) fn log_open_error(backend: &str, data_source: &str, err: &dyn Display) {
    error!(
        "event=store_open module=store backend={} status=error data_source={} error={}",
        backend,
        data_source,
        err
    );
}

pub(crate) fn log_put_ok(backend: &str, tiddler: &Tiddler, revision: Revision, started_at: Instant) {
    debug!(
        "event=tiddler_put module=store backend={} status=ok revision={} draft={} system={} duration_ms={}",
        backend,
        revision,
        tiddler.is_draft(),
        tiddler.is_system(),
        started_at.elapsed().as_millis()
    );
}

pub(crate) fn log_trim_ok(backend: &str, revision: Revision, removed: usize) {
    if removed > 0 {
        debug!(
            "event=history_trim module=store backend={} status=ok revision={} removed={}",
            backend, revision, removed
        );
    }
}

pub(crate) fn log_trim_failure(backend: &str, revision: Revision, err: &dyn Display) {
    warn!(
        "event=history_trim module=store backend={} status=error revision={} error={}",
        backend, revision, err
    );
}

pub(crate) fn log_close(backend: &str, was_open: bool) {
    info!(
        "event=store_close module=store backend={} status=ok was_open={}",
        backend, was_open
    );
}
