//! Flat-file tiddler store.
//!
//! # Responsibility
//! - Keep current values as `<fkey>.meta` + `<fkey>.tid` pairs under
//!   `<root>/tiddlers`.
//! - Keep history as `<fkey>#<revision>` files under `<root>/tiddler_history`.
//!
//! # Invariants
//! - Every file is written to a temp file in the same directory and renamed
//!   into place, so readers never observe a partial file.
//! - History is written first, then the body, then the metadata. A `.meta`
//!   file only appears once its body exists.
//! - System keys keep their body inline in `.meta` and have no `.tid` file.
//! - File stems map back to exactly one key (see [`file_key`]).
//! - Writers within one process are serialized by `write_lock`; readers take
//!   no lock.

use crate::error::{StoreError, StoreOp, StoreResult};
use crate::model::tiddler::{
    current_revision, is_macro_meta, is_system_key, Revision, Tiddler,
};
use crate::retention::{
    history_key, parse_history_key, records_history, trim_floor, HistoryLimit, RetentionSetting,
};
use crate::store::{
    log_close, log_open_error, log_open_ok, log_put_ok, log_trim_failure, log_trim_ok, OpContext,
    TiddlerStore,
};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tempfile::NamedTempFile;

pub const BACKEND_NAME: &str = "flatfile";

const CURRENT_DIR: &str = "tiddlers";
const HISTORY_DIR: &str = "tiddler_history";
const META_EXT: &str = "meta";
const BODY_EXT: &str = "tid";
const ESCAPED_FILE_CHARS: &[char] = &[
    '%', '#', '<', '>', ':', '"', '/', '\\', '|', '?', '*', '^',
];

/// File-tree backed store.
#[derive(Debug)]
pub struct FlatFileStore {
    current_dir: PathBuf,
    history_dir: PathBuf,
    retention: RetentionSetting,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

/// Registry constructor.
pub fn open_store(data_source: &str) -> StoreResult<Arc<dyn TiddlerStore>> {
    Ok(Arc::new(FlatFileStore::open(data_source)?))
}

/// Maps a title to a file-system safe stem.
///
/// Reserved characters, `%` and the history separator `#` are
/// percent-encoded, so distinct titles never share files.
pub fn file_key(key: &str) -> String {
    let mut fkey = String::with_capacity(key.len());
    for c in key.chars() {
        if ESCAPED_FILE_CHARS.contains(&c) {
            fkey.push_str(&format!("%{:02X}", u32::from(c)));
        } else {
            fkey.push(c);
        }
    }
    fkey
}

/// Inverse of [`file_key`]; `None` for stems no key maps to.
pub fn key_from_file(fkey: &str) -> Option<String> {
    let key = urlencoding::decode(fkey).ok()?.into_owned();
    (file_key(&key) == fkey).then_some(key)
}

impl FlatFileStore {
    /// Opens the store rooted at `root`, creating its directories.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let started_at = Instant::now();
        let root = root.as_ref();
        let source = root.display().to_string();
        let current_dir = root.join(CURRENT_DIR);
        let history_dir = root.join(HISTORY_DIR);

        for dir in [&current_dir, &history_dir] {
            if let Err(err) = fs::create_dir_all(dir) {
                log_open_error(BACKEND_NAME, &source, &err);
                return Err(StoreError::unavailable(BACKEND_NAME, &source, err));
            }
        }

        log_open_ok(BACKEND_NAME, &source, started_at);
        Ok(Self {
            current_dir,
            history_dir,
            retention: RetentionSetting::default(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn meta_path(&self, fkey: &str) -> PathBuf {
        self.current_dir.join(format!("{fkey}.{META_EXT}"))
    }

    fn body_path(&self, fkey: &str) -> PathBuf {
        self.current_dir.join(format!("{fkey}.{BODY_EXT}"))
    }

    fn history_path(&self, fkey: &str, revision: Revision) -> PathBuf {
        self.history_dir.join(history_key(fkey, revision))
    }

    fn last_revision(&self, key: &str, fkey: &str) -> StoreResult<Revision> {
        let meta = read_optional(&self.meta_path(fkey)).with_op(StoreOp::Put, key)?;
        Ok(meta.map_or(0, |meta| current_revision(&meta)))
    }

    fn history_revisions(&self, fkey: &str) -> std::io::Result<Vec<Revision>> {
        let mut revisions = Vec::new();
        for entry in fs::read_dir(&self.history_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(revision) = parse_history_key(fkey, name) {
                revisions.push(revision);
            }
        }
        revisions.sort_unstable();
        Ok(revisions)
    }

    /// Removes history entries at or below `floor`; returns how many went.
    ///
    /// Earlier trims already cleared everything below the previous floor, so
    /// entries are probed downward from `floor` until the first gap. A missing
    /// `floor` entry (history was off, or the limit grew) falls back to a
    /// directory scan.
    fn remove_history_through(&self, fkey: &str, floor: Revision) -> std::io::Result<usize> {
        if !self.history_path(fkey, floor).try_exists()? {
            return self.remove_history_scanned(fkey, floor);
        }

        let mut removed = 0;
        for revision in (1..=floor).rev() {
            match fs::remove_file(self.history_path(fkey, revision)) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    fn remove_history_scanned(&self, fkey: &str, floor: Revision) -> std::io::Result<usize> {
        let mut removed = 0;
        for revision in self.history_revisions(fkey)? {
            if revision > floor {
                break;
            }
            remove_if_exists(&self.history_path(fkey, revision))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn write_file(&self, dir: &Path, target: &Path, bytes: &[u8], key: &str) -> StoreResult<()> {
        write_atomic(dir, target, bytes).with_op(StoreOp::Put, key)
    }
}

impl TiddlerStore for FlatFileStore {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn get(&self, key: &str) -> StoreResult<Tiddler> {
        self.ensure_open()?;
        let fkey = file_key(key);
        let Some(meta) = read_optional(&self.meta_path(&fkey)).with_op(StoreOp::Get, key)? else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        let text = if is_system_key(key) {
            None
        } else {
            read_optional(&self.body_path(&fkey)).with_op(StoreOp::Get, key)?
        };
        Tiddler::from_stored(key, meta, text).map_err(|err| StoreError::corrupt(key, err))
    }

    fn all(&self) -> StoreResult<Vec<Tiddler>> {
        self.ensure_open()?;
        let entries = fs::read_dir(&self.current_dir)
            .map_err(|err| StoreError::io_unkeyed(StoreOp::All, err))?;

        let mut tiddlers = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| StoreError::io_unkeyed(StoreOp::All, err))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXT) {
                continue;
            }
            let Some(fkey) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            // Not written by this store.
            let Some(key) = key_from_file(fkey) else {
                continue;
            };

            // Deleted between listing and reading.
            let Some(meta) = read_optional(&path).with_op(StoreOp::All, &key)? else {
                continue;
            };
            let text = if is_macro_meta(&meta) && !is_system_key(&key) {
                read_optional(&self.body_path(fkey)).with_op(StoreOp::All, &key)?
            } else {
                None
            };
            let tiddler = Tiddler::from_stored(key.as_str(), meta, text)
                .map_err(|err| StoreError::corrupt(&key, err))?;
            tiddlers.push(tiddler);
        }
        Ok(tiddlers)
    }

    fn put(&self, tiddler: &Tiddler) -> StoreResult<Revision> {
        self.ensure_open()?;
        let started_at = Instant::now();
        let key = tiddler.key();
        let fkey = file_key(key);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let revision = self.last_revision(key, &fkey)? + 1;
        let stamped = tiddler.stamp(revision)?;
        let limit = self.retention.get();
        let keep_history = records_history(limit, tiddler.is_draft(), tiddler.is_system());

        if keep_history {
            self.write_file(
                &self.history_dir,
                &self.history_path(&fkey, revision),
                stamped.fat.as_bytes(),
                key,
            )?;
        }

        if tiddler.is_system() {
            self.write_file(&self.current_dir, &self.meta_path(&fkey), stamped.fat.as_bytes(), key)?;
        } else {
            self.write_file(&self.current_dir, &self.body_path(&fkey), stamped.text.as_bytes(), key)?;
            self.write_file(&self.current_dir, &self.meta_path(&fkey), stamped.meta.as_bytes(), key)?;
        }

        if keep_history {
            if let Some(floor) = trim_floor(limit, revision) {
                match self.remove_history_through(&fkey, floor) {
                    Ok(removed) => log_trim_ok(BACKEND_NAME, revision, removed),
                    Err(err) => log_trim_failure(BACKEND_NAME, revision, &err),
                }
            }
        }

        log_put_ok(BACKEND_NAME, tiddler, revision, started_at);
        Ok(revision)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let fkey = file_key(key);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        match fs::remove_file(self.meta_path(&fkey)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(StoreError::io(StoreOp::Delete, key, err)),
        }
        remove_if_exists(&self.body_path(&fkey)).with_op(StoreOp::Delete, key)?;
        self.remove_history_scanned(&fkey, Revision::MAX)
            .with_op(StoreOp::Delete, key)?;
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        let was_open = !self.closed.swap(true, Ordering::AcqRel);
        log_close(BACKEND_NAME, was_open);
        Ok(())
    }

    fn set_max_history(&self, limit: HistoryLimit) {
        self.retention.set(limit);
    }

    fn max_history(&self) -> HistoryLimit {
        self.retention.get()
    }

    fn history(&self, key: &str) -> StoreResult<Vec<Revision>> {
        self.ensure_open()?;
        self.history_revisions(&file_key(key))
            .with_op(StoreOp::History, key)
    }

    fn history_entry(&self, key: &str, revision: Revision) -> StoreResult<Tiddler> {
        self.ensure_open()?;
        let path = self.history_path(&file_key(key), revision);
        let Some(fat) = read_optional(&path).with_op(StoreOp::History, key)? else {
            return Err(StoreError::NotFound(history_key(key, revision)));
        };
        Tiddler::from_json(key, &fat).map_err(|err| StoreError::corrupt(key, err))
    }
}

fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.persist(target).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{file_key, key_from_file, FlatFileStore};
    use crate::model::tiddler::Tiddler;
    use crate::retention::HistoryLimit;
    use crate::store::TiddlerStore;
    use std::num::NonZeroU64;

    fn tiddler(json: &str) -> Tiddler {
        Tiddler::decode(json.as_bytes()).unwrap()
    }

    #[test]
    fn file_key_escapes_reserved_characters() {
        assert_eq!(file_key("$:/StoryList"), "$%3A%2FStoryList");
        assert_eq!(
            file_key(r#"a<b>c"d|e?f*g^h\i"#),
            "a%3Cb%3Ec%22d%7Ce%3Ff%2Ag%5Eh%5Ci"
        );
        assert_eq!(file_key("100% #1"), "100%25 %231");
        assert_eq!(file_key("plain title"), "plain title");
    }

    #[test]
    fn file_key_maps_back_to_the_key() {
        for key in ["$:/StoryList", "a/b", "a_b", "100%", "a%2Fb", "x#3", "Ünïcode page"] {
            assert_eq!(key_from_file(&file_key(key)).as_deref(), Some(key));
        }
        assert_eq!(key_from_file("a%2fb"), None);
        assert_eq!(key_from_file("bad%zz"), None);
    }

    #[test]
    fn put_lays_out_meta_body_and_history_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::open(dir.path()).unwrap();
        assert_eq!(store.put(&tiddler(r#"{"title":"Page","text":"body"}"#)).unwrap(), 1);

        let current = dir.path().join("tiddlers");
        assert_eq!(
            std::fs::read_to_string(current.join("Page.tid")).unwrap(),
            "body"
        );
        let meta = std::fs::read_to_string(current.join("Page.meta")).unwrap();
        assert!(meta.contains("\"revision\":1"));
        assert!(!meta.contains("body"));
        assert!(dir.path().join("tiddler_history").join("Page#1").exists());
    }

    #[test]
    fn system_keys_keep_body_inside_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::open(dir.path()).unwrap();
        store.put(&tiddler(r#"{"title":"$:/config/x","text":"yes"}"#)).unwrap();

        let current = dir.path().join("tiddlers");
        assert!(!current.join("$%3A%2Fconfig%2Fx.tid").exists());
        let meta = std::fs::read_to_string(current.join("$%3A%2Fconfig%2Fx.meta")).unwrap();
        assert!(meta.contains("\"text\":\"yes\""));
    }

    #[test]
    fn keys_that_differ_only_in_reserved_characters_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::open(dir.path()).unwrap();

        assert_eq!(store.put(&tiddler(r#"{"title":"a/b","text":"1"}"#)).unwrap(), 1);
        assert_eq!(store.put(&tiddler(r#"{"title":"a_b","text":"2"}"#)).unwrap(), 1);
        assert_eq!(store.get("a/b").unwrap().text(), Some("1"));
        assert_eq!(store.get("a_b").unwrap().text(), Some("2"));

        store.delete("a_b").unwrap();
        assert_eq!(store.get("a/b").unwrap().text(), Some("1"));
        assert_eq!(store.history("a/b").unwrap(), vec![1]);

        let keys: Vec<String> = store.all().unwrap().iter().map(|t| t.key().to_string()).collect();
        assert_eq!(keys, vec!["a/b"]);
    }

    #[test]
    fn failed_trim_does_not_fail_the_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::open(dir.path()).unwrap();
        store.set_max_history(HistoryLimit::Keep(NonZeroU64::new(1).unwrap()));
        assert_eq!(store.put(&tiddler(r#"{"title":"Page","text":"one"}"#)).unwrap(), 1);

        // A non-empty directory where revision 1 lives cannot be unlinked.
        let stuck = dir.path().join("tiddler_history").join("Page#1");
        std::fs::remove_file(&stuck).unwrap();
        std::fs::create_dir(&stuck).unwrap();
        std::fs::write(stuck.join("pin"), b"x").unwrap();

        assert_eq!(store.put(&tiddler(r#"{"title":"Page","text":"two"}"#)).unwrap(), 2);
        let current = store.get("Page").unwrap();
        assert_eq!(current.revision(), 2);
        assert_eq!(current.text(), Some("two"));
        assert!(store.history("Page").unwrap().contains(&2));
    }

    #[test]
    fn unreadable_stored_revision_counts_as_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::open(dir.path()).unwrap();
        store.put(&tiddler(r#"{"title":"Page","text":"one"}"#)).unwrap();
        store.put(&tiddler(r#"{"title":"Page","text":"two"}"#)).unwrap();

        std::fs::write(
            dir.path().join("tiddlers").join("Page.meta"),
            br#"{"title":"Page","revision":"not a number"}"#,
        )
        .unwrap();

        assert_eq!(store.get("Page").unwrap().revision(), 1);
        assert_eq!(store.put(&tiddler(r#"{"title":"Page","text":"three"}"#)).unwrap(), 2);
    }

    #[test]
    fn trim_after_history_gap_still_clears_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::open(dir.path()).unwrap();
        let page = tiddler(r#"{"title":"Page"}"#);
        store.put(&page).unwrap();
        store.put(&page).unwrap();

        store.set_max_history(HistoryLimit::Disabled);
        store.put(&page).unwrap();
        store.put(&page).unwrap();

        store.set_max_history(HistoryLimit::Keep(NonZeroU64::new(1).unwrap()));
        assert_eq!(store.put(&page).unwrap(), 5);
        assert_eq!(store.history("Page").unwrap(), vec![5]);
        assert_eq!(store.put(&page).unwrap(), 6);
        assert_eq!(store.history("Page").unwrap(), vec![6]);
    }
}
