//! Storage core for a personal wiki server.
//! Tiddlers are stored through one of several interchangeable backends that
//! share a single revision and history protocol.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod registry;
pub mod retention;
pub mod service;
pub mod store;

pub use config::{ConfigError, StoreConfig};
pub use error::{BackendError, StoreError, StoreOp, StoreResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::tiddler::{Revision, StampedTiddler, Tiddler, TiddlerError};
pub use registry::{BackendRegistry, OpenFn, RegistryError};
pub use retention::HistoryLimit;
pub use service::tiddler_service::{PutOutcome, TiddlerService};
pub use store::{FlatFileStore, KvStore, SqliteStore, TiddlerStore};

/// Minimal health-check API for hosts.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
