//! Store configuration.
//!
//! # Responsibility
//! - Load backend selection and retention settings from TOML.
//! - Open the configured store with its retention applied.
//!
//! # Invariants
//! - Missing keys fall back to defaults; unknown keys are rejected.

use crate::registry::{BackendRegistry, RegistryError};
use crate::retention::HistoryLimit;
use crate::store::{flat_file, TiddlerStore};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_DATA_SOURCE: &str = "widdly.db";
pub const DEFAULT_MAX_HISTORY: i64 = -1;

/// Configuration load errors.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse config `{}`: {source}", path.display())
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
        }
    }
}

/// Storage settings for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Registry name of the backend.
    pub backend: String,
    /// Directory, file path or `:memory:`, interpreted by the backend.
    pub data_source: String,
    /// `-1` unlimited, `0` disabled, `n` keep the last `n` revisions.
    pub max_history: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: flat_file::BACKEND_NAME.to_string(),
            data_source: DEFAULT_DATA_SOURCE.to_string(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl StoreConfig {
    /// Loads the config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn history_limit(&self) -> HistoryLimit {
        HistoryLimit::from_raw(self.max_history)
    }

    /// Opens the configured backend from `registry` and applies retention.
    pub fn open_store(
        &self,
        registry: &BackendRegistry,
    ) -> Result<Arc<dyn TiddlerStore>, RegistryError> {
        let store = registry.open(&self.backend, &self.data_source)?;
        store.set_max_history(self.history_limit());
        Ok(store)
    }
}
