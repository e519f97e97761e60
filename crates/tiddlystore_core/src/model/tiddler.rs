//! Tiddler domain model.
//!
//! # Responsibility
//! - Convert between wire JSON and the split metadata/text representation.
//! - Answer revision and classification queries (draft, system, macro).
//!
//! # Invariants
//! - `text` is never kept inside the metadata map; it is tracked separately.
//! - A tiddler built from stored metadata bytes alone is encoded by returning
//!   those bytes unchanged.
//! - Revision lookup never fails: absent or unparseable values read as `1`.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::string::FromUtf8Error;

/// Per-key revision counter.
pub type Revision = u64;

/// Title prefix reserved for system tiddlers.
pub const SYSTEM_PREFIX: &str = "$:/";
/// Tag marking global macro tiddlers, which are always listed fat.
pub const MACRO_TAG: &str = "$:/tags/Macro";

/// Revision reported for metadata without a usable `revision` field.
pub const FALLBACK_REVISION: Revision = 1;

const DRAFT_OF_QUOTED: &[u8] = b"\"draft.of\"";

const TITLE_FIELD: &str = "title";
const TEXT_FIELD: &str = "text";
const TAGS_FIELD: &str = "tags";
const REVISION_FIELD: &str = "revision";
const FIELDS_FIELD: &str = "fields";
const DRAFT_OF_FIELD: &str = "draft.of";

/// Decode/validation errors for tiddler payloads.
#[derive(Debug)]
pub enum TiddlerError {
    BadJson(serde_json::Error),
    NotAnObject,
    MissingTitle,
    EmptyKey,
    InvalidText(FromUtf8Error),
}

impl Display for TiddlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadJson(err) => write!(f, "malformed tiddler json: {err}"),
            Self::NotAnObject => write!(f, "tiddler json must be an object"),
            Self::MissingTitle => write!(f, "tiddler json has no usable `title` field"),
            Self::EmptyKey => write!(f, "tiddler key cannot be empty"),
            Self::InvalidText(err) => write!(f, "tiddler text is not valid UTF-8: {err}"),
        }
    }
}

impl Error for TiddlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::BadJson(err) => Some(err),
            Self::InvalidText(err) => Some(err),
            Self::NotAnObject | Self::MissingTitle | Self::EmptyKey => None,
        }
    }
}

impl From<serde_json::Error> for TiddlerError {
    fn from(value: serde_json::Error) -> Self {
        Self::BadJson(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Repr {
    /// Raw metadata bytes read from storage (skinny path).
    Stored(Vec<u8>),
    /// Decoded metadata with the body tracked on the side.
    Fields {
        meta: Map<String, Value>,
        text: Option<String>,
    },
}

/// A named wiki document.
///
/// Values are built per call: from a request body on write, from storage on
/// read. Durable state is owned by the storage engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Tiddler {
    key: String,
    repr: Repr,
}

/// Storage-ready serialization of a tiddler stamped with its new revision.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedTiddler {
    pub revision: Revision,
    /// Metadata JSON without `text`.
    pub meta: String,
    /// Body, empty when the tiddler had none.
    pub text: String,
    /// Full JSON with `text` inline, used for history and system records.
    pub fat: String,
}

impl Tiddler {
    /// Decodes a wire JSON object, taking the key from its `title` field.
    pub fn decode(bytes: &[u8]) -> Result<Self, TiddlerError> {
        let meta = parse_object(bytes)?;
        let key = match meta.get(TITLE_FIELD).and_then(Value::as_str) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => return Err(TiddlerError::MissingTitle),
        };
        Self::from_fields(key, meta, None)
    }

    /// Decodes a wire JSON object stored under an explicit key.
    ///
    /// A missing `title` field is filled in from `key` so the encoded form
    /// always decodes back to the same key.
    pub fn from_json(key: impl Into<String>, bytes: &[u8]) -> Result<Self, TiddlerError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TiddlerError::EmptyKey);
        }
        let mut meta = parse_object(bytes)?;
        if !meta.contains_key(TITLE_FIELD) {
            meta.insert(TITLE_FIELD.to_string(), Value::String(key.clone()));
        }
        Self::from_fields(key, meta, None)
    }

    /// Builds a tiddler from a metadata map and optional body.
    ///
    /// A `text` entry left inside `meta` is moved out; an explicit `text`
    /// argument wins over it.
    pub fn from_fields(
        key: impl Into<String>,
        mut meta: Map<String, Value>,
        text: Option<String>,
    ) -> Result<Self, TiddlerError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TiddlerError::EmptyKey);
        }
        let inline_text = take_text(&mut meta);
        Ok(Self {
            key,
            repr: Repr::Fields {
                meta,
                text: text.or(inline_text),
            },
        })
    }

    /// Builds a tiddler from stored bytes.
    ///
    /// Without `text` the metadata bytes are kept verbatim (skinny). With
    /// `text` the metadata is parsed and the body attached (fat).
    pub fn from_stored(
        key: impl Into<String>,
        meta: Vec<u8>,
        text: Option<Vec<u8>>,
    ) -> Result<Self, TiddlerError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TiddlerError::EmptyKey);
        }
        let Some(text) = text else {
            return Ok(Self {
                key,
                repr: Repr::Stored(meta),
            });
        };
        let text = String::from_utf8(text).map_err(TiddlerError::InvalidText)?;
        let meta = parse_object(&meta)?;
        Self::from_fields(key, meta, Some(text))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the separately tracked body, if this value carries one.
    ///
    /// Skinny values return `None` even when their stored metadata happens to
    /// hold text inline (system tiddlers).
    pub fn text(&self) -> Option<&str> {
        match &self.repr {
            Repr::Stored(_) => None,
            Repr::Fields { text, .. } => text.as_deref(),
        }
    }

    /// Whether this value was built from raw stored metadata only.
    pub fn is_skinny(&self) -> bool {
        matches!(self.repr, Repr::Stored(_))
    }

    /// Current revision recorded in the metadata.
    pub fn revision(&self) -> Revision {
        match &self.repr {
            Repr::Stored(bytes) => current_revision(bytes),
            Repr::Fields { meta, .. } => meta
                .get(REVISION_FIELD)
                .and_then(revision_from_value)
                .unwrap_or(FALLBACK_REVISION),
        }
    }

    /// Title carries the reserved system prefix.
    pub fn is_system(&self) -> bool {
        is_system_key(&self.key)
    }

    /// Metadata carries a `draft.of` field, directly or under `fields`.
    pub fn is_draft(&self) -> bool {
        match &self.repr {
            Repr::Stored(bytes) => contains_bytes(bytes, DRAFT_OF_QUOTED),
            Repr::Fields { meta, .. } => {
                meta.contains_key(DRAFT_OF_FIELD)
                    || meta
                        .get(FIELDS_FIELD)
                        .and_then(Value::as_object)
                        .is_some_and(|fields| fields.contains_key(DRAFT_OF_FIELD))
            }
        }
    }

    /// Tagged as a global macro.
    pub fn is_macro(&self) -> bool {
        match &self.repr {
            Repr::Stored(bytes) => is_macro_meta(bytes),
            Repr::Fields { meta, .. } => tags_include_macro(meta.get(TAGS_FIELD)),
        }
    }

    /// Reads one metadata field. Skinny values are parsed on demand.
    pub fn field(&self, name: &str) -> Option<Value> {
        match &self.repr {
            Repr::Stored(bytes) => parse_object(bytes).ok()?.remove(name),
            Repr::Fields { meta, .. } => meta.get(name).cloned(),
        }
    }

    /// Sets one metadata field, decoding skinny values first.
    ///
    /// Setting `text` replaces the body.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), TiddlerError> {
        let (mut meta, mut text) = self.split_fields()?;
        if name == TEXT_FIELD {
            text = Some(text_from_value(value));
        } else {
            meta.insert(name.to_string(), value);
        }
        self.repr = Repr::Fields { meta, text };
        Ok(())
    }

    /// Encodes the wire JSON form.
    ///
    /// Skinny values return their stored bytes without copying.
    pub fn encode(&self) -> Result<Cow<'_, [u8]>, TiddlerError> {
        match &self.repr {
            Repr::Stored(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
            Repr::Fields { meta, text } => {
                let bytes = match text {
                    Some(text) => marshal_with_text(meta, text)?,
                    None => serde_json::to_vec(meta)?,
                };
                Ok(Cow::Owned(bytes))
            }
        }
    }

    /// Metadata JSON with the body left out.
    pub fn meta_json(&self) -> Result<String, TiddlerError> {
        let (meta, _) = self.split_fields()?;
        Ok(serde_json::to_string(&meta)?)
    }

    /// Serializes this tiddler for storage under `revision`.
    pub fn stamp(&self, revision: Revision) -> Result<StampedTiddler, TiddlerError> {
        let (mut meta, text) = self.split_fields()?;
        meta.insert(REVISION_FIELD.to_string(), Value::from(revision));
        let text = text.unwrap_or_default();
        let mut fat = meta.clone();
        fat.insert(TEXT_FIELD.to_string(), Value::String(text.clone()));
        let fat = serde_json::to_string(&fat)?;
        let meta = serde_json::to_string(&meta)?;
        Ok(StampedTiddler {
            revision,
            meta,
            text,
            fat,
        })
    }

    fn split_fields(&self) -> Result<(Map<String, Value>, Option<String>), TiddlerError> {
        match &self.repr {
            Repr::Stored(bytes) => {
                let mut meta = parse_object(bytes)?;
                let text = take_text(&mut meta);
                Ok((meta, text))
            }
            Repr::Fields { meta, text } => Ok((meta.clone(), text.clone())),
        }
    }
}

/// Parses the `revision` field of stored metadata.
///
/// Returns [`FALLBACK_REVISION`] when the field is absent or unparseable;
/// this keeps the first write on damaged metadata from failing.
pub fn current_revision(meta: &[u8]) -> Revision {
    #[derive(Deserialize)]
    struct RevisionProbe {
        #[serde(default)]
        revision: Option<Value>,
    }

    match serde_json::from_slice::<RevisionProbe>(meta) {
        Ok(RevisionProbe {
            revision: Some(value),
        }) => revision_from_value(&value).unwrap_or(FALLBACK_REVISION),
        _ => FALLBACK_REVISION,
    }
}

/// Title carries the reserved system prefix.
pub fn is_system_key(key: &str) -> bool {
    key.starts_with(SYSTEM_PREFIX)
}

/// Macro tag check on raw metadata.
///
/// Metadata that never mentions the tag is rejected without a JSON parse.
pub fn is_macro_meta(meta: &[u8]) -> bool {
    if !contains_bytes(meta, MACRO_TAG.as_bytes()) {
        return false;
    }
    parse_object(meta).is_ok_and(|map| tags_include_macro(map.get(TAGS_FIELD)))
}

fn tags_include_macro(tags: Option<&Value>) -> bool {
    match tags {
        Some(Value::Array(tags)) => tags.iter().any(|tag| tag.as_str() == Some(MACRO_TAG)),
        Some(Value::String(list)) => tag_list(list).any(|tag| tag == MACRO_TAG),
        _ => false,
    }
}

/// Splits a string tag list: `[[two words]]` or whitespace-separated names.
fn tag_list(list: &str) -> impl Iterator<Item = &str> {
    let mut rest = list;
    std::iter::from_fn(move || {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        if let Some(open) = rest.strip_prefix("[[") {
            let (tag, tail) = open.split_once("]]").unwrap_or((open, ""));
            rest = tail;
            return Some(tag);
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (tag, tail) = rest.split_at(end);
        rest = tail;
        Some(tag)
    })
}

fn revision_from_value(value: &Value) -> Option<Revision> {
    let revision = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<Revision>().ok(),
        _ => None,
    }?;
    (revision > 0).then_some(revision)
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, TiddlerError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(TiddlerError::NotAnObject),
    }
}

fn take_text(meta: &mut Map<String, Value>) -> Option<String> {
    match meta.remove(TEXT_FIELD)? {
        Value::Null => None,
        other => Some(text_from_value(other)),
    }
}

fn text_from_value(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn marshal_with_text(meta: &Map<String, Value>, text: &str) -> Result<Vec<u8>, TiddlerError> {
    let mut fat = meta.clone();
    fat.insert(TEXT_FIELD.to_string(), Value::String(text.to_string()));
    Ok(serde_json::to_vec(&fat)?)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
