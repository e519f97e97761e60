//! History retention policy shared by every backend.
//!
//! # Responsibility
//! - Decide whether a write records a history entry.
//! - Decide which `(key, revision)` history entries fall out of the window.
//!
//! # Invariants
//! - Drafts and system keys never record history.
//! - `Keep(n)` retains the `n` most recent revisions, the new one included.
//! - Trimming is best-effort; callers log trim failures and keep the write.

use crate::model::tiddler::Revision;
use std::fmt::{Display, Formatter};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicI64, Ordering};

/// History retention setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryLimit {
    /// Keep every revision.
    #[default]
    Unlimited,
    /// Never write history.
    Disabled,
    /// Keep at most this many revisions.
    Keep(NonZeroU64),
}

impl HistoryLimit {
    /// Maps the integer configuration knob: `< 0` unlimited, `0` disabled.
    pub fn from_raw(value: i64) -> Self {
        match value {
            value if value < 0 => Self::Unlimited,
            0 => Self::Disabled,
            value => NonZeroU64::new(value.unsigned_abs()).map_or(Self::Disabled, Self::Keep),
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            Self::Unlimited => -1,
            Self::Disabled => 0,
            Self::Keep(count) => i64::try_from(count.get()).unwrap_or(i64::MAX),
        }
    }
}

impl Display for HistoryLimit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Disabled => write!(f, "disabled"),
            Self::Keep(count) => write!(f, "keep({count})"),
        }
    }
}

/// Whether a write of this tiddler records a history entry.
pub fn records_history(limit: HistoryLimit, is_draft: bool, is_system: bool) -> bool {
    !is_draft && !is_system && limit != HistoryLimit::Disabled
}

/// Highest revision to delete after writing `new_revision`, if any.
pub fn trim_floor(limit: HistoryLimit, new_revision: Revision) -> Option<Revision> {
    match limit {
        HistoryLimit::Keep(count) => new_revision
            .checked_sub(count.get())
            .filter(|floor| *floor > 0),
        HistoryLimit::Unlimited | HistoryLimit::Disabled => None,
    }
}

/// Whether history entry `candidate` falls outside the retained window.
pub fn is_expired(limit: HistoryLimit, new_revision: Revision, candidate: Revision) -> bool {
    trim_floor(limit, new_revision).is_some_and(|floor| candidate <= floor)
}

/// Lock-free holder for the live limit, shared by a store's callers.
#[derive(Debug)]
pub struct RetentionSetting(AtomicI64);

impl RetentionSetting {
    pub fn new(limit: HistoryLimit) -> Self {
        Self(AtomicI64::new(limit.as_raw()))
    }

    pub fn get(&self) -> HistoryLimit {
        HistoryLimit::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, limit: HistoryLimit) {
        self.0.store(limit.as_raw(), Ordering::Release);
    }
}

impl Default for RetentionSetting {
    fn default() -> Self {
        Self::new(HistoryLimit::default())
    }
}

/// Formats the history key `<key>#<revision>` used by the file and kv layouts.
pub fn history_key(key: &str, revision: Revision) -> String {
    format!("{key}#{revision}")
}

/// Parses the revision out of a history key belonging to `key`.
///
/// Returns `None` for keys of other tiddlers that merely share the prefix.
pub fn parse_history_key(key: &str, candidate: &str) -> Option<Revision> {
    let suffix = candidate.strip_prefix(key)?.strip_prefix('#')?;
    if suffix.is_empty() || !suffix.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
