//! Backend registry: name to constructor map.
//!
//! # Responsibility
//! - Hold the constructors hosts can select a storage backend from.
//! - Open exactly one backend for a process.
//!
//! # Invariants
//! - Names are trimmed, lowercased and match `[a-z0-9_-]+`.
//! - A name is registered at most once.
//! - Core code never reads [`global`]; stores are passed explicitly.

use crate::error::{StoreError, StoreResult};
use crate::store::{flat_file, kv, sqlite, TiddlerStore};
use log::{error, info};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock};

/// Backend constructor: opens a store over `data_source`.
pub type OpenFn = fn(&str) -> StoreResult<Arc<dyn TiddlerStore>>;

const BUILTIN_BACKENDS: &[(&str, OpenFn)] = &[
    (flat_file::BACKEND_NAME, flat_file::open_store),
    (kv::BACKEND_NAME, kv::open_store),
    (sqlite::BACKEND_NAME, sqlite::open_store),
];

static GLOBAL: Lazy<RwLock<BackendRegistry>> =
    Lazy::new(|| RwLock::new(BackendRegistry::with_builtin()));

/// Registration/selection errors.
#[derive(Debug)]
pub enum RegistryError {
    InvalidBackendName(String),
    BackendExists(String),
    BackendNotFound(String),
    /// `open_sole` needs exactly one registered backend.
    AmbiguousBackend(Vec<String>),
    Open(StoreError),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBackendName(value) => write!(f, "backend name is invalid: {value}"),
            Self::BackendExists(value) => write!(f, "backend already registered: {value}"),
            Self::BackendNotFound(value) => write!(f, "backend not found: {value}"),
            Self::AmbiguousBackend(names) if names.is_empty() => {
                write!(f, "no storage backend registered")
            }
            Self::AmbiguousBackend(names) => write!(
                f,
                "expected exactly one storage backend, found: {}",
                names.join(", ")
            ),
            Self::Open(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Open(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(value: StoreError) -> Self {
        Self::Open(value)
    }
}

/// Runtime backend registry.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, OpenFn>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.backends.keys()).finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `flatfile`, `kv` and `sqlite`.
    pub fn with_builtin() -> Self {
        let backends = BUILTIN_BACKENDS
            .iter()
            .map(|(name, open)| ((*name).to_string(), *open))
            .collect();
        Self { backends }
    }

    /// Registers one backend constructor.
    pub fn register(&mut self, name: &str, open: OpenFn) -> Result<(), RegistryError> {
        let name = normalize_name(name);
        if !is_valid_backend_name(&name) {
            return Err(RegistryError::InvalidBackendName(name));
        }
        if self.backends.contains_key(name.as_str()) {
            return Err(RegistryError::BackendExists(name));
        }

        self.backends.insert(name, open);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(normalize_name(name).as_str())
    }

    /// Returns sorted backend names.
    pub fn list_registered(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Opens the backend registered as `name` over `data_source`.
    pub fn open(
        &self,
        name: &str,
        data_source: &str,
    ) -> Result<Arc<dyn TiddlerStore>, RegistryError> {
        let name = normalize_name(name);
        let Some(open) = self.backends.get(name.as_str()) else {
            error!(
                "event=backend_select module=registry status=error backend={} error_code=backend_not_found",
                name
            );
            return Err(RegistryError::BackendNotFound(name));
        };

        info!(
            "event=backend_select module=registry status=ok backend={}",
            name
        );
        Ok(open(data_source)?)
    }

    /// Opens the only registered backend.
    pub fn open_sole(&self, data_source: &str) -> Result<Arc<dyn TiddlerStore>, RegistryError> {
        let mut names = self.backends.keys();
        match (names.next(), names.next()) {
            (Some(name), None) => self.open(name, data_source),
            _ => Err(RegistryError::AmbiguousBackend(self.list_registered())),
        }
    }
}

/// Process-wide registry preloaded with the built-in backends.
pub fn global() -> &'static RwLock<BackendRegistry> {
    &GLOBAL
}

fn normalize_name(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn is_valid_backend_name(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
