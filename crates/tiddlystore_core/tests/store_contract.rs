use serde_json::{json, Value};
use std::num::NonZeroU64;
use std::sync::Arc;
use tempfile::TempDir;
use tiddlystore_core::{
    BackendRegistry, HistoryLimit, StoreError, Tiddler, TiddlerService, TiddlerStore,
};

/// One open store per built-in backend, all under `dir`.
fn open_all(dir: &TempDir) -> Vec<Arc<dyn TiddlerStore>> {
    let registry = BackendRegistry::with_builtin();
    let sources = [
        ("flatfile", dir.path().join("flat")),
        ("kv", dir.path().join("store.redb")),
        ("sqlite", dir.path().join("store.db")),
    ];
    sources
        .iter()
        .map(|(backend, path)| {
            registry
                .open(backend, path.to_str().unwrap())
                .unwrap_or_else(|err| panic!("{backend} should open: {err}"))
        })
        .collect()
}

fn tiddler(json: &str) -> Tiddler {
    Tiddler::decode(json.as_bytes()).unwrap()
}

fn encoded(tiddler: &Tiddler) -> Value {
    serde_json::from_slice(&tiddler.encode().unwrap()).unwrap()
}

fn keep(count: u64) -> HistoryLimit {
    HistoryLimit::Keep(NonZeroU64::new(count).unwrap())
}

#[test]
fn get_of_unwritten_key_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let err = store.get("never written").unwrap_err();
        assert!(
            matches!(err, StoreError::NotFound(ref key) if key == "never written"),
            "{}: {err}",
            store.backend_name()
        );
    }
}

#[test]
fn sequential_puts_return_increasing_revisions() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let page = tiddler(r#"{"title":"Page","text":"body"}"#);
        let revisions: Vec<u64> = (0..5).map(|_| store.put(&page).unwrap()).collect();
        assert_eq!(revisions, vec![1, 2, 3, 4, 5], "{}", store.backend_name());
    }
}

#[test]
fn get_reports_revision_returned_by_put() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        store.put(&tiddler(r#"{"title":"A","text":"one"}"#)).unwrap();
        let revision = store.put(&tiddler(r#"{"title":"A","text":"two"}"#)).unwrap();

        let current = store.get("A").unwrap();
        assert_eq!(current.revision(), revision, "{}", store.backend_name());
        assert_eq!(current.text(), Some("two"));
        assert_eq!(encoded(&current)["revision"], json!(revision));
    }
}

#[test]
fn delete_removes_value_and_history() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let name = store.backend_name();
        store.put(&tiddler(r#"{"title":"Gone","text":"x"}"#)).unwrap();
        store.put(&tiddler(r#"{"title":"Gone","text":"y"}"#)).unwrap();

        store.delete("Gone").unwrap();
        assert!(store.get("Gone").unwrap_err().is_not_found(), "{name}");
        assert!(store.history("Gone").unwrap().is_empty(), "{name}");
        assert!(store.all().unwrap().iter().all(|t| t.key() != "Gone"));

        // Revision numbering restarts after a purge.
        let revision = store.put(&tiddler(r#"{"title":"Gone","text":"z"}"#)).unwrap();
        assert_eq!(revision, 1, "{name}");
    }
}

#[test]
fn delete_of_absent_key_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        assert!(
            store.delete("missing").unwrap_err().is_not_found(),
            "{}",
            store.backend_name()
        );
    }
}

#[test]
fn history_limit_keeps_most_recent_revisions() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        store.set_max_history(keep(2));
        for _ in 0..5 {
            store.put(&tiddler(r#"{"title":"Page","text":"x"}"#)).unwrap();
        }
        assert_eq!(store.history("Page").unwrap(), vec![4, 5], "{}", store.backend_name());
    }
}

#[test]
fn disabled_history_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        store.set_max_history(HistoryLimit::Disabled);
        for _ in 0..3 {
            store.put(&tiddler(r#"{"title":"Page","text":"x"}"#)).unwrap();
        }
        assert!(store.history("Page").unwrap().is_empty(), "{}", store.backend_name());
        assert_eq!(store.get("Page").unwrap().revision(), 3);
    }
}

#[test]
fn drafts_and_system_tiddlers_skip_history() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let name = store.backend_name();
        let draft = tiddler(r#"{"title":"Draft of 'A'","text":"wip","fields":{"draft.of":"A"}}"#);
        store.put(&draft).unwrap();
        store.put(&draft).unwrap();
        assert!(store.history("Draft of 'A'").unwrap().is_empty(), "{name}");

        let system = tiddler(r#"{"title":"$:/StoryList","list":"A B"}"#);
        assert_eq!(store.put(&system).unwrap(), 1);
        assert_eq!(store.put(&system).unwrap(), 2);
        assert!(store.history("$:/StoryList").unwrap().is_empty(), "{name}");
    }
}

#[test]
fn system_tiddlers_read_back_skinny_with_inline_text() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        store
            .put(&tiddler(r#"{"title":"$:/config/Flag","text":"yes"}"#))
            .unwrap();
        let stored = store.get("$:/config/Flag").unwrap();
        assert!(stored.is_skinny(), "{}", store.backend_name());
        let json = encoded(&stored);
        assert_eq!(json["text"], json!("yes"));
        assert_eq!(json["revision"], json!(1));
    }
}

#[test]
fn all_lists_live_keys_with_bodies_only_for_macros() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let name = store.backend_name();
        store
            .put(&tiddler(r#"{"title":"Plain","text":"p","tags":["x"]}"#))
            .unwrap();
        store
            .put(&tiddler(
                r#"{"title":"Macro","text":"\\define hi() hi","tags":["$:/tags/Macro"]}"#,
            ))
            .unwrap();
        store.put(&tiddler(r#"{"title":"Deleted","text":"d"}"#)).unwrap();
        store.delete("Deleted").unwrap();

        let mut listed: Vec<(String, Value)> = store
            .all()
            .unwrap()
            .iter()
            .map(|t| (t.key().to_string(), encoded(t)))
            .collect();
        listed.sort_by(|a, b| a.0.cmp(&b.0));

        let keys: Vec<&str> = listed.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["Macro", "Plain"], "{name}");
        assert_eq!(listed[0].1["text"], json!("\\define hi() hi"), "{name}");
        assert!(listed[1].1.get("text").is_none(), "{name}");
    }
}

#[test]
fn scenario_two_writes_with_single_history_slot() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let name = store.backend_name();
        store.set_max_history(keep(1));

        let first = store
            .put(&tiddler(r#"{"title":"A","text":"hello","tags":""}"#))
            .unwrap();
        assert_eq!(first, 1, "{name}");
        let second = store.put(&tiddler(r#"{"title":"A","text":"world"}"#)).unwrap();
        assert_eq!(second, 2, "{name}");

        let current = store.get("A").unwrap();
        assert_eq!(current.text(), Some("world"), "{name}");
        assert_eq!(current.revision(), 2, "{name}");

        assert_eq!(store.history("A").unwrap(), vec![2], "{name}");
        let entry = store.history_entry("A", 2).unwrap();
        assert_eq!(entry.text(), Some("world"));
        assert_eq!(entry.revision(), 2);
        assert!(store.history_entry("A", 1).unwrap_err().is_not_found());
    }
}

#[test]
fn retention_change_is_not_retroactive() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        for _ in 0..4 {
            store.put(&tiddler(r#"{"title":"Page"}"#)).unwrap();
        }
        store.set_max_history(keep(3));
        assert_eq!(store.max_history(), keep(3));
        assert_eq!(store.history("Page").unwrap(), vec![1, 2, 3, 4]);

        store.put(&tiddler(r#"{"title":"Page"}"#)).unwrap();
        assert_eq!(store.history("Page").unwrap(), vec![3, 4, 5], "{}", store.backend_name());
    }
}

#[test]
fn closed_store_rejects_operations() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        store.put(&tiddler(r#"{"title":"A"}"#)).unwrap();
        store.close().unwrap();
        store.close().unwrap();

        assert!(matches!(store.get("A"), Err(StoreError::Closed)), "{}", store.backend_name());
        assert!(matches!(store.put(&tiddler(r#"{"title":"A"}"#)), Err(StoreError::Closed)));
        assert!(matches!(store.all(), Err(StoreError::Closed)));
    }
}

#[test]
fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        store.put(&tiddler(r#"{"title":"Kept","text":"v1"}"#)).unwrap();
        store.put(&tiddler(r#"{"title":"Kept","text":"v2"}"#)).unwrap();
        store.close().unwrap();
    }

    for store in open_all(&dir) {
        let kept = store.get("Kept").unwrap();
        assert_eq!(kept.text(), Some("v2"), "{}", store.backend_name());
        assert_eq!(store.put(&tiddler(r#"{"title":"Kept"}"#)).unwrap(), 3);
    }
}

#[test]
fn decode_encode_round_trip_keeps_key_revision_and_text() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        store
            .put(&tiddler(r#"{"title":"Round","text":"trip","type":"text/vnd.tiddlywiki"}"#))
            .unwrap();
        let stored = store.get("Round").unwrap();
        let again = Tiddler::decode(&stored.encode().unwrap()).unwrap();
        assert_eq!(again.key(), "Round");
        assert_eq!(again.revision(), stored.revision());
        assert_eq!(again.text(), Some("trip"), "{}", store.backend_name());
    }
}

#[test]
fn listed_keys_are_request_keys_even_when_title_differs() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let name = store.backend_name();
        let service = TiddlerService::new(Arc::clone(&store));
        service.put_json("A", br#"{"title":"B","text":"x"}"#).unwrap();

        let listed = store.all().unwrap();
        let keys: Vec<&str> = listed.iter().map(|t| t.key()).collect();
        assert_eq!(keys, vec!["A"], "{name}");
        for key in keys {
            assert_eq!(store.get(key).unwrap().text(), Some("x"), "{name}");
        }
    }
}

#[test]
fn keys_with_reserved_file_characters_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    for store in open_all(&dir) {
        let name = store.backend_name();
        for key in ["a/b", "a_b", "a%2Fb", "a:b"] {
            let body = json!({ "title": key, "text": key }).to_string();
            assert_eq!(store.put(&tiddler(&body)).unwrap(), 1, "{name}: {key}");
        }
        for key in ["a/b", "a_b", "a%2Fb", "a:b"] {
            assert_eq!(store.get(key).unwrap().text(), Some(key), "{name}");
        }

        let mut keys: Vec<String> = store.all().unwrap().iter().map(|t| t.key().to_string()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a%2Fb", "a/b", "a:b", "a_b"], "{name}");
    }
}
