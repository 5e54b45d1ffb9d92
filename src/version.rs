// src/version.rs

//! Monotonic global version ledger
//!
//! A single `Version` table backs every soft-delete entity table in the
//! store. `allocate` inserts one row inside the caller's transaction and
//! returns the backend-assigned identity, so committed allocations form a
//! strictly increasing sequence shared by the whole store.

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

/// Ledger DDL; AUTOINCREMENT keeps identities strictly increasing even
/// after rows are pruned
pub const LEDGER_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS \"Version\" (
    \"Version\" INTEGER PRIMARY KEY AUTOINCREMENT,
    \"Timestamp\" TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Allocate the next global version inside the caller's transaction
///
/// There is no way to peek without allocating; callers that do not commit
/// leave a gap, which is expected.
pub fn allocate(conn: &Connection) -> Result<i64> {
    conn.execute("INSERT INTO \"Version\" DEFAULT VALUES", [])?;
    let version = conn.last_insert_rowid();
    debug!(version, "allocated global version");
    Ok(version)
}

/// Highest version the ledger has handed out; diagnostics only
pub fn current(conn: &Connection) -> Result<i64> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(\"Version\") FROM \"Version\"", [], |row| {
            row.get(0)
        })?;
    Ok(max.unwrap_or(0))
}

/// Advance the ledger so future allocations exceed `version`
///
/// Used when an import preserves source version chains: inserting an
/// explicit identity pushes the AUTOINCREMENT sequence past it.
pub fn ensure_at_least(conn: &Connection, version: i64) -> Result<()> {
    if current(conn)? >= version {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO \"Version\" (\"Version\") VALUES (?1)",
        [version],
    )?;
    debug!(version, "advanced version ledger");
    Ok(())
}
