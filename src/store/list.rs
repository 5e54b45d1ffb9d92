// src/store/list.rs

//! List-association operations
//!
//! A list is a named set of entity keys stored in the shared
//! `EntryListMapping` table. List operations never delete entity rows:
//! `delete_list` removes mappings only, and `get_list` lazily repairs
//! mappings whose entity has moved to a newer version.

use rusqlite::{Connection, Row, params};
use tracing::{debug, warn};

use crate::entity::{CallerInfo, Entity, OpContext};
use crate::error::{Error, Result};
use crate::value::{format_timestamp, now, read_timestamp};
use crate::version;

use super::EntityStore;

/// List mapping table and index DDL
pub fn mapping_ddl() -> Vec<&'static str> {
    vec![
        "CREATE TABLE IF NOT EXISTS \"EntryListMapping\" (
    \"ListCacheKey\" TEXT NOT NULL,
    \"EntryCacheKey\" TEXT NOT NULL,
    \"Version\" INTEGER NOT NULL,
    \"CreatedTime\" TEXT NOT NULL,
    \"LastWriteTime\" TEXT NOT NULL,
    \"CallerFile\" TEXT,
    \"CallerMember\" TEXT,
    \"CallerLine\" INTEGER,
    PRIMARY KEY (\"ListCacheKey\", \"EntryCacheKey\")
)",
        "CREATE INDEX IF NOT EXISTS \"idx_entry_list_mapping_list\" ON \"EntryListMapping\" (\"ListCacheKey\")",
        "CREATE INDEX IF NOT EXISTS \"idx_entry_list_mapping_entry\" ON \"EntryListMapping\" (\"EntryCacheKey\")",
    ]
}

/// One list-to-entry association row
#[derive(Debug, Clone)]
pub struct ListMapping {
    pub list_key: String,
    pub entry_key: String,
    pub version: i64,
    pub created_time: chrono::DateTime<chrono::Utc>,
    pub last_write_time: chrono::DateTime<chrono::Utc>,
}

impl ListMapping {
    fn insert(&self, conn: &Connection, caller: &CallerInfo) -> Result<()> {
        conn.execute(
            "INSERT INTO \"EntryListMapping\"
             (\"ListCacheKey\", \"EntryCacheKey\", \"Version\", \"CreatedTime\", \"LastWriteTime\",
              \"CallerFile\", \"CallerMember\", \"CallerLine\")
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &self.list_key,
                &self.entry_key,
                &self.version,
                format_timestamp(self.created_time),
                format_timestamp(self.last_write_time),
                &caller.file,
                &caller.member,
                &caller.line,
            ],
        )?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            list_key: row.get(0)?,
            entry_key: row.get(1)?,
            version: row.get(2)?,
            created_time: read_timestamp(row, 3)?,
            last_write_time: read_timestamp(row, 4)?,
        })
    }
}

/// Mappings for a list ordered by entry key
fn mappings_for(conn: &Connection, list_key: &str) -> Result<Vec<ListMapping>> {
    let mut stmt = conn.prepare(
        "SELECT \"ListCacheKey\", \"EntryCacheKey\", \"Version\", \"CreatedTime\", \"LastWriteTime\"
         FROM \"EntryListMapping\" WHERE \"ListCacheKey\" = ?1 ORDER BY \"EntryCacheKey\"",
    )?;
    let mappings = stmt
        .query_map([list_key], ListMapping::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(mappings)
}

impl<T: Entity> EntityStore<'_, T> {
    /// Create a list and its member entities atomically
    ///
    /// Fails with `AlreadyExists` when the list key is taken and with the
    /// create-flow errors when any member already has a live head; either
    /// way no mapping row survives.
    pub fn create_list(&self, list_key: &str, entities: &[T], ctx: &OpContext) -> Result<Vec<T>> {
        self.require_flag(self.schema.flags.sync_with_list, "sync_with_list")?;
        ctx.cancel.check()?;

        let conn = self.store().connection()?;
        let tx = self.store().begin_write(&conn)?;

        if !mappings_for(&tx, list_key)?.is_empty() {
            return Err(Error::AlreadyExists(format!("list '{}'", list_key)));
        }

        let shared_version = if self.schema.flags.soft_delete {
            Some(version::allocate(&tx)?)
        } else {
            None
        };

        let mut created = Vec::with_capacity(entities.len());
        for entity in entities {
            ctx.cancel.check()?;
            let stored = self.create_in_tx(&tx, entity, shared_version)?;
            let stamp = now();
            ListMapping {
                list_key: list_key.to_string(),
                entry_key: stored.key(),
                version: stored.version(),
                created_time: stamp,
                last_write_time: stamp,
            }
            .insert(&tx, &ctx.caller)?;
            created.push(stored);
        }

        tx.commit()?;
        debug!(
            entity = T::entity_type(),
            list_key,
            members = created.len(),
            "list created"
        );
        for stored in &created {
            self.audit_write(
                "CREATE",
                &stored.key(),
                None,
                Some(stored.version()),
                None,
                Some(stored),
                ctx,
            );
        }
        Ok(created)
    }

    /// Read a list's member heads in mapping order
    ///
    /// A mapping pointing at a missing or soft-deleted head fails with
    /// `NotFound`. A mapping whose version lags the head is repaired in
    /// place; a mapping ahead of the head is a `ConcurrencyConflict`.
    pub fn get_list(&self, list_key: &str, ctx: &OpContext) -> Result<Vec<T>> {
        self.require_flag(self.schema.flags.sync_with_list, "sync_with_list")?;
        ctx.cancel.check()?;

        let conn = self.store().connection()?;
        let mappings = mappings_for(&conn, list_key)?;
        if mappings.is_empty() {
            return Err(Error::NotFound(format!("list '{}'", list_key)));
        }

        let mut heads = Vec::with_capacity(mappings.len());
        let mut repairs: Vec<(String, i64)> = Vec::new();
        for mapping in &mappings {
            ctx.cancel.check()?;
            let head = self
                .read_head(&conn, &mapping.entry_key)?
                .filter(|h| !h.is_deleted())
                .ok_or_else(|| Error::NotFound(mapping.entry_key.clone()))?;

            if head.version() > mapping.version {
                repairs.push((mapping.entry_key.clone(), head.version()));
            } else if head.version() < mapping.version {
                return Err(Error::ConcurrencyConflict {
                    key: mapping.entry_key.clone(),
                    expected: mapping.version,
                    actual: head.version(),
                });
            }
            heads.push(head);
        }

        if !repairs.is_empty() {
            // Lazy repair runs in its own transaction on a fresh connection
            let repair_conn = self.store().connection()?;
            let repair_tx = self.store().begin_write(&repair_conn)?;
            for (entry_key, head_version) in &repairs {
                repair_tx.execute(
                    "UPDATE \"EntryListMapping\"
                     SET \"Version\" = ?1, \"LastWriteTime\" = ?2
                     WHERE \"ListCacheKey\" = ?3 AND \"EntryCacheKey\" = ?4",
                    params![
                        head_version,
                        format_timestamp(now()),
                        list_key,
                        entry_key
                    ],
                )?;
            }
            repair_tx.commit()?;
            warn!(
                list_key,
                repaired = repairs.len(),
                "list mappings lagged their heads; repaired"
            );
        }

        Ok(heads)
    }

    /// Replace a list's membership and contents atomically
    ///
    /// Members without a live head are created, changed members are
    /// updated, unchanged members are left alone; the mapping set is
    /// rewritten to exactly the given entities.
    pub fn update_list(&self, list_key: &str, entities: &[T], ctx: &OpContext) -> Result<Vec<T>> {
        self.require_flag(self.schema.flags.sync_with_list, "sync_with_list")?;
        ctx.cancel.check()?;

        let conn = self.store().connection()?;
        let tx = self.store().begin_write(&conn)?;

        let existing = mappings_for(&tx, list_key)?;
        let shared_version = if self.schema.flags.soft_delete {
            Some(version::allocate(&tx)?)
        } else {
            None
        };

        tx.execute(
            "DELETE FROM \"EntryListMapping\" WHERE \"ListCacheKey\" = ?1",
            [list_key],
        )?;

        let mut members = Vec::with_capacity(entities.len());
        let mut audits: Vec<(String, Option<i64>, i64, Option<T>, T)> = Vec::new();
        for entity in entities {
            ctx.cancel.check()?;
            let head = self
                .read_head(&tx, &entity.key())?
                .filter(|h| self.is_live(h));
            let stored = match head {
                None => {
                    let stored = self.create_in_tx(&tx, entity, shared_version)?;
                    audits.push((
                        "CREATE".to_string(),
                        None,
                        stored.version(),
                        None,
                        stored.clone(),
                    ));
                    stored
                }
                Some(head) => {
                    if differs_from(&head, entity) {
                        let stored = self.update_in_tx(&tx, entity, &head, shared_version)?;
                        audits.push((
                            "UPDATE".to_string(),
                            Some(head.version()),
                            stored.version(),
                            Some(head),
                            stored.clone(),
                        ));
                        stored
                    } else {
                        head
                    }
                }
            };

            let stamp = now();
            ListMapping {
                list_key: list_key.to_string(),
                entry_key: stored.key(),
                version: stored.version(),
                created_time: stamp,
                last_write_time: stamp,
            }
            .insert(&tx, &ctx.caller)?;
            members.push(stored);
        }

        tx.commit()?;
        debug!(
            entity = T::entity_type(),
            list_key,
            previous = existing.len(),
            members = members.len(),
            "list updated"
        );
        for (operation, old_version, new_version, old_entity, new_entity) in &audits {
            self.audit_write(
                operation,
                &new_entity.key(),
                *old_version,
                Some(*new_version),
                old_entity.as_ref(),
                Some(new_entity),
                ctx,
            );
        }
        Ok(members)
    }

    /// Remove a list's mappings; entity rows are never touched
    ///
    /// Returns the number of mappings removed.
    pub fn delete_list(&self, list_key: &str, ctx: &OpContext) -> Result<usize> {
        self.require_flag(self.schema.flags.sync_with_list, "sync_with_list")?;
        ctx.cancel.check()?;

        let conn = self.store().connection()?;
        let removed = conn.execute(
            "DELETE FROM \"EntryListMapping\" WHERE \"ListCacheKey\" = ?1",
            [list_key],
        )?;
        debug!(list_key, removed, "list mappings deleted");
        Ok(removed)
    }
}

/// Serialized inequality of user-visible content
///
/// The candidate's base properties are aligned with the head's before
/// comparing, so only user-column differences count.
fn differs_from<T: Entity>(head: &T, candidate: &T) -> bool {
    let mut aligned = candidate.clone();
    aligned.set_version(head.version());
    aligned.set_created_time(head.created_time());
    aligned.set_last_write_time(head.last_write_time());
    aligned.set_is_deleted(head.is_deleted());
    aligned.set_absolute_expiration(head.absolute_expiration());

    match (
        serde_json::to_value(head),
        serde_json::to_value(&aligned),
    ) {
        (Ok(a), Ok(b)) => a != b,
        _ => true,
    }
}
