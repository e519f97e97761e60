use std::num::NonZeroU64;
use std::sync::Arc;
use tiddlystore_core::registry::global;
use tiddlystore_core::{
    BackendRegistry, HistoryLimit, KvStore, RegistryError, StoreConfig, StoreError, StoreResult,
    TiddlerService, TiddlerStore,
};

fn open_memory_kv(_data_source: &str) -> StoreResult<Arc<dyn TiddlerStore>> {
    Ok(Arc::new(KvStore::in_memory()?))
}

#[test]
fn global_registry_lists_builtin_backends() {
    let registry = global().read().unwrap();
    assert_eq!(registry.list_registered(), vec!["flatfile", "kv", "sqlite"]);
    assert!(registry.contains("SQLite"));
}

#[test]
fn builtin_backends_open_by_case_insensitive_name() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::with_builtin();

    let flat = registry
        .open(" FlatFile ", dir.path().join("flat").to_str().unwrap())
        .unwrap();
    assert_eq!(flat.backend_name(), "flatfile");
    assert!(dir.path().join("flat").join("tiddlers").is_dir());
    assert!(dir.path().join("flat").join("tiddler_history").is_dir());

    let kv = registry.open("kv", ":memory:").unwrap();
    assert_eq!(kv.backend_name(), "kv");
}

#[test]
fn builtin_names_cannot_be_registered_twice() {
    let mut registry = BackendRegistry::with_builtin();
    let err = registry.register("kv", open_memory_kv).unwrap_err();
    assert!(matches!(err, RegistryError::BackendExists(name) if name == "kv"));
    assert_eq!(registry.len(), 3);
}

#[test]
fn open_sole_reproduces_single_backend_startup() {
    let mut registry = BackendRegistry::new();
    registry.register("memory", open_memory_kv).unwrap();

    let store = registry.open_sole("unused").unwrap();
    let service = TiddlerService::new(store);
    let outcome = service
        .put_json("Start", br#"{"title":"Start","text":"ok"}"#)
        .unwrap();
    assert_eq!(outcome.revision, 1);
}

#[test]
fn unavailable_data_source_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let registry = BackendRegistry::with_builtin();
    let err = registry
        .open("flatfile", blocker.to_str().unwrap())
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Open(StoreError::Unavailable {
            backend: "flatfile",
            ..
        })
    ));
}

#[test]
fn config_file_selects_backend_and_retention() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("wiki.db");
    let config_path = dir.path().join("tiddlystore.toml");
    std::fs::write(
        &config_path,
        format!(
            "backend = \"sqlite\"\ndata_source = {:?}\nmax_history = 2\n",
            data.to_str().unwrap()
        ),
    )
    .unwrap();

    let config = StoreConfig::load(&config_path).unwrap();
    let store = config
        .open_store(&BackendRegistry::with_builtin())
        .unwrap();
    assert_eq!(store.backend_name(), "sqlite");
    assert_eq!(
        store.max_history(),
        HistoryLimit::Keep(NonZeroU64::new(2).unwrap())
    );
    assert!(data.exists());
}
