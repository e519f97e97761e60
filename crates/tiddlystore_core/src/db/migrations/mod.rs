//! Schema steps for the relational tiddler store.
//!
//! # Responsibility
//! - List the `tiddler` / `tiddler_history` schema steps in order.
//! - Bring a connection from its recorded version up to [`latest_version`].
//!
//! # Invariants
//! - Step versions are consecutive from 1.
//! - All pending steps commit together with the final `PRAGMA user_version`,
//!   or none do.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "tiddlers",
        sql: include_str!("0001_tiddlers.sql"),
    },
    SchemaStep {
        version: 2,
        name: "history_written_at",
        sql: include_str!("0002_history_written_at.sql"),
    },
];

/// Schema version a fully migrated database reports.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// Applies every step newer than the stored version.
///
/// Returns the versions applied, oldest first; empty when already current.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<Vec<u32>> {
    let from = schema_version(conn)?;
    let latest = latest_version();
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }

    let pending: Vec<&SchemaStep> = SCHEMA_STEPS
        .iter()
        .filter(|step| step.version > from)
        .collect();
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let tx = conn.transaction()?;
    for step in &pending {
        tx.execute_batch(step.sql)?;
        info!(
            "event=db_migrate module=db status=applied version={} name={}",
            step.version, step.name
        );
    }
    tx.pragma_update(None, "user_version", latest)?;
    tx.commit()?;

    info!("event=db_migrate module=db status=ok from={from} to={latest}");
    Ok(pending.iter().map(|step| step.version).collect())
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
