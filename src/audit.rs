// src/audit.rs

//! Append-only audit log
//!
//! Every successful CRUD effect on an audit-enabled entity appends one
//! record with caller context and the old/new versions. Records are
//! written on a dedicated connection, never inside the primary
//! operation's transaction: an audit failure is logged at debug level and
//! swallowed so it cannot roll back or fail the caller.

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::entity::CallerInfo;
use crate::error::Result;
use crate::store::Store;
use crate::value::{format_timestamp, now, read_timestamp};

/// Audit table and index DDL
pub fn table_ddl() -> Vec<&'static str> {
    vec![
        "CREATE TABLE IF NOT EXISTS \"AuditRecords\" (
    \"Id\" INTEGER PRIMARY KEY AUTOINCREMENT,
    \"EntityType\" TEXT NOT NULL,
    \"EntityId\" TEXT NOT NULL,
    \"Operation\" TEXT NOT NULL,
    \"OldVersion\" INTEGER,
    \"NewVersion\" INTEGER,
    \"Size\" INTEGER,
    \"CallerFile\" TEXT,
    \"CallerMember\" TEXT,
    \"CallerLine\" INTEGER,
    \"UserId\" TEXT,
    \"OldValueJson\" TEXT,
    \"NewValueJson\" TEXT,
    \"Timestamp\" TEXT NOT NULL
)",
        "CREATE INDEX IF NOT EXISTS \"idx_audit_entity\" ON \"AuditRecords\" (\"EntityType\", \"EntityId\")",
        "CREATE INDEX IF NOT EXISTS \"idx_audit_operation\" ON \"AuditRecords\" (\"Operation\")",
    ]
}

/// One appended audit record
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: Option<i64>,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub old_version: Option<i64>,
    pub new_version: Option<i64>,
    /// Serialized size of the new value, when known
    pub size: Option<i64>,
    pub caller: CallerInfo,
    pub old_value_json: Option<String>,
    pub new_value_json: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AuditRecord {
    pub fn new(entity_type: &str, entity_id: &str, operation: &str, caller: CallerInfo) -> Self {
        Self {
            id: None,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            old_version: None,
            new_version: None,
            size: None,
            caller,
            old_value_json: None,
            new_value_json: None,
            timestamp: now(),
        }
    }

    fn insert(&self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO \"AuditRecords\"
             (\"EntityType\", \"EntityId\", \"Operation\", \"OldVersion\", \"NewVersion\", \"Size\",
              \"CallerFile\", \"CallerMember\", \"CallerLine\", \"UserId\", \"OldValueJson\", \"NewValueJson\", \"Timestamp\")
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &self.entity_type,
                &self.entity_id,
                &self.operation,
                &self.old_version,
                &self.new_version,
                &self.size,
                &self.caller.file,
                &self.caller.member,
                &self.caller.line,
                &self.caller.user_id,
                &self.old_value_json,
                &self.new_value_json,
                format_timestamp(self.timestamp),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            operation: row.get(3)?,
            old_version: row.get(4)?,
            new_version: row.get(5)?,
            size: row.get(6)?,
            caller: CallerInfo {
                file: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                member: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                line: row.get::<_, Option<u32>>(9)?.unwrap_or_default(),
                user_id: row.get(10)?,
            },
            old_value_json: row.get(11)?,
            new_value_json: row.get(12)?,
            timestamp: read_timestamp(row, 13)?,
        })
    }
}

/// Append a record on a dedicated connection; never fails the caller
pub fn record(store: &Store, record: AuditRecord) {
    let outcome = store
        .audit_connection()
        .and_then(|conn| record.insert(&conn));
    if let Err(err) = outcome {
        debug!(
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            operation = %record.operation,
            error = %err,
            "audit write failed; primary operation unaffected"
        );
    }
}

/// Audit records for one entity, oldest first; diagnostics and tests
pub fn find_by_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<AuditRecord>> {
    let mut stmt = conn.prepare(
        "SELECT \"Id\", \"EntityType\", \"EntityId\", \"Operation\", \"OldVersion\", \"NewVersion\", \"Size\",
                \"CallerFile\", \"CallerMember\", \"CallerLine\", \"UserId\", \"OldValueJson\", \"NewValueJson\", \"Timestamp\"
         FROM \"AuditRecords\" WHERE \"EntityType\" = ?1 AND \"EntityId\" = ?2 ORDER BY \"Id\"",
    )?;
    let records = stmt
        .query_map(params![entity_type, entity_id], AuditRecord::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Most recent record for an operation kind, if any
pub fn last_for_operation(conn: &Connection, operation: &str) -> Result<Option<AuditRecord>> {
    let mut stmt = conn.prepare(
        "SELECT \"Id\", \"EntityType\", \"EntityId\", \"Operation\", \"OldVersion\", \"NewVersion\", \"Size\",
                \"CallerFile\", \"CallerMember\", \"CallerLine\", \"UserId\", \"OldValueJson\", \"NewValueJson\", \"Timestamp\"
         FROM \"AuditRecords\" WHERE \"Operation\" = ?1 ORDER BY \"Id\" DESC LIMIT 1",
    )?;
    let record = stmt
        .query_row(params![operation], AuditRecord::from_row)
        .optional()?;
    Ok(record)
}
