//! Storage error taxonomy.
//!
//! # Responsibility
//! - Separate expected negative results (`NotFound`) from failures.
//! - Wrap substrate errors with the operation and key they occurred in.
//!
//! # Invariants
//! - Substrate errors keep their original kind through `BackendError`.
//! - Nothing in the engine retries; callers decide on retry policy.

use crate::db::DbError;
use crate::model::tiddler::TiddlerError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    All,
    Put,
    Delete,
    History,
    Close,
}

impl StoreOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::All => "all",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::History => "history",
            Self::Close => "close",
        }
    }
}

impl Display for StoreOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a physical storage substrate.
#[derive(Debug)]
pub enum BackendError {
    Io(std::io::Error),
    Sqlite(DbError),
    Kv(redb::Error),
    Json(serde_json::Error),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Kv(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sqlite(err) => Some(err),
            Self::Kv(err) => Some(err),
            Self::Json(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<DbError> for BackendError {
    fn from(value: DbError) -> Self {
        Self::Sqlite(value)
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<redb::Error> for BackendError {
    fn from(value: redb::Error) -> Self {
        Self::Kv(value)
    }
}

impl From<redb::DatabaseError> for BackendError {
    fn from(value: redb::DatabaseError) -> Self {
        Self::Kv(value.into())
    }
}

impl From<redb::TransactionError> for BackendError {
    fn from(value: redb::TransactionError) -> Self {
        Self::Kv(value.into())
    }
}

impl From<redb::TableError> for BackendError {
    fn from(value: redb::TableError) -> Self {
        Self::Kv(value.into())
    }
}

impl From<redb::StorageError> for BackendError {
    fn from(value: redb::StorageError) -> Self {
        Self::Kv(value.into())
    }
}

impl From<redb::CommitError> for BackendError {
    fn from(value: redb::CommitError) -> Self {
        Self::Kv(value.into())
    }
}

/// Error returned by every `TiddlerStore` operation.
#[derive(Debug)]
pub enum StoreError {
    /// Key has no current value. Expected; not a failure.
    NotFound(String),
    /// Caller supplied a payload the model rejects.
    BadInput(TiddlerError),
    /// Substrate could not be opened or created.
    Unavailable {
        backend: &'static str,
        data_source: String,
        source: BackendError,
    },
    /// Substrate read/write failed mid-operation.
    Io {
        op: StoreOp,
        key: Option<String>,
        source: BackendError,
    },
    /// Stored bytes could not be turned back into a tiddler.
    Corrupt { key: String, source: TiddlerError },
    /// Store was closed.
    Closed,
}

impl StoreError {
    pub fn io(op: StoreOp, key: &str, source: impl Into<BackendError>) -> Self {
        Self::Io {
            op,
            key: Some(key.to_string()),
            source: source.into(),
        }
    }

    /// Substrate failure not tied to one key (listing, close).
    pub fn io_unkeyed(op: StoreOp, source: impl Into<BackendError>) -> Self {
        Self::Io {
            op,
            key: None,
            source: source.into(),
        }
    }

    pub fn unavailable(
        backend: &'static str,
        data_source: &str,
        source: impl Into<BackendError>,
    ) -> Self {
        Self::Unavailable {
            backend,
            data_source: data_source.to_string(),
            source: source.into(),
        }
    }

    pub fn corrupt(key: &str, source: TiddlerError) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "tiddler not found: {key}"),
            Self::BadInput(err) => write!(f, "bad input: {err}"),
            Self::Unavailable {
                backend,
                data_source,
                source,
            } => write!(
                f,
                "backend `{backend}` unavailable at `{data_source}`: {source}"
            ),
            Self::Io {
                op,
                key: Some(key),
                source,
            } => write!(f, "{op} failed for `{key}`: {source}"),
            Self::Io {
                op,
                key: None,
                source,
            } => write!(f, "{op} failed: {source}"),
            Self::Corrupt { key, source } => {
                write!(f, "stored tiddler `{key}` is unreadable: {source}")
            }
            Self::Closed => write!(f, "store is closed"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::BadInput(err) => Some(err),
            Self::Unavailable { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
            Self::Corrupt { source, .. } => Some(source),
            Self::NotFound(_) | Self::Closed => None,
        }
    }
}

impl From<TiddlerError> for StoreError {
    fn from(value: TiddlerError) -> Self {
        Self::BadInput(value)
    }
}
