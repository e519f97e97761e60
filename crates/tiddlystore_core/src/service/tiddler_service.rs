//! Tiddler request adapter.
//!
//! # Responsibility
//! - Turn request-shaped input (key + JSON body) into store calls.
//! - Encode store results back into wire JSON.
//!
//! # Invariants
//! - Every stored tiddler carries `bag = "bag"`.
//! - The adapter owns no state beyond its store handle.

use crate::error::{StoreError, StoreResult};
use crate::model::tiddler::{Revision, Tiddler};
use crate::store::TiddlerStore;
use serde_json::Value;
use std::sync::Arc;

/// The single bag this server exposes.
pub const BAG_NAME: &str = "bag";

/// Fixed status document for unauthenticated clients.
pub const STATUS_JSON: &str = r#"{"username":"GUEST","space":{"recipe":"all"}}"#;

const ETAG_HASH_HEX_CHARS: usize = 32;

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub revision: Revision,
    /// Quoted entity tag, `"bag/<escaped key>/<revision>:<hash>"`.
    pub etag: String,
}

/// Use-case service over one shared store.
#[derive(Debug, Clone)]
pub struct TiddlerService {
    store: Arc<dyn TiddlerStore>,
}

impl TiddlerService {
    pub fn new(store: Arc<dyn TiddlerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TiddlerStore> {
        &self.store
    }

    /// Stores `body` as the next revision of `key`.
    ///
    /// # Errors
    /// - `BadInput` when `body` is not a JSON object or `key` is empty.
    pub fn put_json(&self, key: &str, body: &[u8]) -> StoreResult<PutOutcome> {
        let mut tiddler = Tiddler::from_json(key, body)?;
        tiddler.set_field("bag", Value::String(BAG_NAME.to_string()))?;

        let revision = self.store.put(&tiddler)?;
        let meta = tiddler.meta_json()?;
        Ok(PutOutcome {
            revision,
            etag: etag(key, revision, meta.as_bytes()),
        })
    }

    /// Current value of `key` as wire JSON.
    pub fn get_json(&self, key: &str) -> StoreResult<Vec<u8>> {
        let tiddler = self.store.get(key)?;
        encode(&tiddler)
    }

    /// Every live tiddler as a JSON array, skinny except macros.
    pub fn list_json(&self) -> StoreResult<Vec<u8>> {
        let tiddlers = self.store.all()?;
        let mut out = Vec::with_capacity(tiddlers.len() * 64 + 2);
        out.push(b'[');
        for (index, tiddler) in tiddlers.iter().enumerate() {
            if index > 0 {
                out.push(b',');
            }
            out.extend_from_slice(&encode(tiddler)?);
        }
        out.push(b']');
        Ok(out)
    }

    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.store.delete(key)
    }

    /// Retained history revisions of `key`, ascending.
    pub fn history(&self, key: &str) -> StoreResult<Vec<Revision>> {
        self.store.history(key)
    }

    /// One history entry as wire JSON.
    pub fn history_json(&self, key: &str, revision: Revision) -> StoreResult<Vec<u8>> {
        let tiddler = self.store.history_entry(key, revision)?;
        encode(&tiddler)
    }

    pub fn status_json(&self) -> &'static str {
        STATUS_JSON
    }
}

fn encode(tiddler: &Tiddler) -> StoreResult<Vec<u8>> {
    tiddler
        .encode()
        .map(|bytes| bytes.into_owned())
        .map_err(|err| StoreError::corrupt(tiddler.key(), err))
}

/// Entity tag for a stored revision, hashed over the written metadata.
pub fn etag(key: &str, revision: Revision, meta: &[u8]) -> String {
    let hash = blake3::hash(meta).to_hex();
    format!(
        "\"{BAG_NAME}/{}/{revision}:{}\"",
        query_escape(key),
        &hash.as_str()[..ETAG_HASH_HEX_CHARS]
    )
}

/// Query-component escaping: spaces become `+`, a literal `+` becomes `%2B`.
fn query_escape(key: &str) -> String {
    urlencoding::encode(key).replace("%20", "+")
}
