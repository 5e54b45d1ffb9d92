// src/store/crud.rs

//! Create / Get / Update / Delete
//!
//! Every write opens one connection, runs one transaction, and commits
//! before its audit record is appended on a separate connection. Under
//! soft-delete, updates and deletes append new versions drawn from the
//! global ledger; the version chain for a key is never rewritten.

use rusqlite::Connection;
use tracing::debug;

use crate::audit::{self, AuditRecord};
use crate::command::{self, CommandContext, SelectOptions};
use crate::entity::{Entity, OpContext};
use crate::error::{Error, Result};
use crate::value::{Value, now};
use crate::version;

use super::EntityStore;

impl<T: Entity> EntityStore<'_, T> {
    /// Create a new entity
    ///
    /// Fails with `AlreadyExists` when the key already has a live head.
    /// A soft-deleted head does not block creation: the new row resumes
    /// the chain with a fresh ledger version. Returns the stored entity
    /// as read back from the row.
    pub fn create(&self, entity: &T, ctx: &OpContext) -> Result<T> {
        ctx.cancel.check()?;
        let conn = self.store().connection()?;
        let tx = self.store().begin_write(&conn)?;

        let created = self.create_in_tx(&tx, entity, None)?;

        ctx.cancel.check()?;
        tx.commit()?;
        debug!(
            entity = T::entity_type(),
            key = %created.key(),
            version = created.version(),
            "created"
        );

        self.audit_write(
            "CREATE",
            &created.key(),
            None,
            Some(created.version()),
            None,
            Some(&created),
            ctx,
        );
        Ok(created)
    }

    /// Read the live head for a key
    ///
    /// Returns `None` when the key is absent, soft-deleted, or expired.
    pub fn get(&self, key: &str, ctx: &OpContext) -> Result<Option<T>> {
        ctx.cancel.check()?;
        let command = command::build(
            self.schema,
            &CommandContext::<T>::select(key, SelectOptions::default()),
        )?;
        self.store().config().retry.run("get", || {
            let conn = self.store().connection()?;
            let mut rows: Vec<T> = command.query_entities(&conn)?;
            Ok(rows.pop())
        })
    }

    /// Read a key's rows according to the visibility options
    ///
    /// With `include_all_versions` the whole chain is returned ordered by
    /// version ascending; otherwise at most the head.
    pub fn get_by_key(&self, key: &str, options: SelectOptions, ctx: &OpContext) -> Result<Vec<T>> {
        ctx.cancel.check()?;
        let command = command::build(self.schema, &CommandContext::<T>::select(key, options))?;
        self.store().config().retry.run("get_by_key", || {
            let conn = self.store().connection()?;
            command.query_entities(&conn)
        })
    }

    /// Update an entity under optimistic concurrency
    ///
    /// The caller supplies the entity carrying the version it read;
    /// a mismatch with the current head fails with `ConcurrencyConflict`
    /// and modifies nothing.
    pub fn update(&self, entity: &T, ctx: &OpContext) -> Result<T> {
        ctx.cancel.check()?;
        let conn = self.store().connection()?;
        let tx = self.store().begin_write(&conn)?;

        let head = self
            .read_head(&tx, &entity.key())?
            .filter(|h| self.is_live(h))
            .ok_or_else(|| Error::NotFound(entity.key()))?;
        if head.version() != entity.version() {
            return Err(Error::ConcurrencyConflict {
                key: entity.key(),
                expected: entity.version(),
                actual: head.version(),
            });
        }

        let updated = self.update_in_tx(&tx, entity, &head, None)?;

        ctx.cancel.check()?;
        tx.commit()?;
        debug!(
            entity = T::entity_type(),
            key = %updated.key(),
            old_version = head.version(),
            new_version = updated.version(),
            "updated"
        );

        self.audit_write(
            "UPDATE",
            &updated.key(),
            Some(head.version()),
            Some(updated.version()),
            Some(&head),
            Some(&updated),
            ctx,
        );
        Ok(updated)
    }

    /// Delete by key
    ///
    /// Under soft-delete a tombstone version is appended and a second
    /// delete of the same key is a no-op returning `true`. Without
    /// soft-delete the chain is removed; `true` is returned even when no
    /// row matched.
    pub fn delete(&self, key: &str, ctx: &OpContext) -> Result<bool> {
        ctx.cancel.check()?;
        let conn = self.store().connection()?;
        let tx = self.store().begin_write(&conn)?;

        let effect = self.delete_in_tx(&tx, key, None)?;

        ctx.cancel.check()?;
        tx.commit()?;

        if let DeleteEffect::Applied {
            old_version,
            new_version,
        } = effect
        {
            debug!(entity = T::entity_type(), key, "deleted");
            self.audit_write("DELETE", key, old_version, new_version, None, None, ctx);
        }
        Ok(true)
    }

    // ---- shared transactional building blocks ---------------------------

    /// Head row for a key regardless of delete/expiry state
    pub(crate) fn read_head(&self, conn: &Connection, key: &str) -> Result<Option<T>> {
        let command = command::build(
            self.schema,
            &CommandContext::<T>::select(
                key,
                SelectOptions {
                    include_all_versions: false,
                    include_deleted: true,
                    include_expired: true,
                },
            ),
        )?;
        let mut rows: Vec<T> = command.query_entities(conn)?;
        Ok(rows.pop())
    }

    /// Whether a head row is live: not deleted and not expired
    pub(crate) fn is_live(&self, entity: &T) -> bool {
        if self.schema.flags.soft_delete && entity.is_deleted() {
            return false;
        }
        if self.schema.flags.expiry
            && let Some(expiration) = entity.absolute_expiration()
            && expiration <= now()
        {
            return false;
        }
        true
    }

    /// Create inside an open transaction
    ///
    /// `shared_version` lets batch and list operations reuse one ledger
    /// allocation across several creates.
    pub(crate) fn create_in_tx(
        &self,
        conn: &Connection,
        entity: &T,
        shared_version: Option<i64>,
    ) -> Result<T> {
        if let Some(head) = self.read_head(conn, &entity.key())? {
            if !self.schema.flags.soft_delete || self.is_live(&head) {
                return Err(Error::AlreadyExists(entity.key()));
            }
            // Soft-deleted head: the create resumes the chain
        }

        let version = if self.schema.flags.soft_delete {
            match shared_version {
                Some(v) => v,
                None => version::allocate(conn)?,
            }
        } else {
            1
        };

        let stamp = now();
        let mut stored = entity.clone();
        stored.set_version(version);
        stored.set_created_time(stamp);
        stored.set_last_write_time(stamp);
        stored.set_is_deleted(false);
        if self.schema.flags.expiry
            && stored.absolute_expiration().is_none()
            && let Some(span) = self.schema.flags.expiry_span
        {
            stored.set_absolute_expiration(Some(stamp + span));
        }

        command::build(self.schema, &CommandContext::insert(&stored))?.execute(conn)?;

        // Read back by (Id, Version) to confirm the row landed
        self.read_exact(conn, &stored.key(), version)?
            .ok_or_else(|| Error::WriteFailed(stored.key()))
    }

    /// Update inside an open transaction; the concurrency check against
    /// `head` has already passed
    pub(crate) fn update_in_tx(
        &self,
        conn: &Connection,
        entity: &T,
        head: &T,
        shared_version: Option<i64>,
    ) -> Result<T> {
        let stamp = now();
        let mut updated = entity.clone();
        updated.set_created_time(head.created_time());
        updated.set_last_write_time(stamp);
        updated.set_is_deleted(false);

        if self.schema.flags.soft_delete {
            let version = match shared_version {
                Some(v) => v,
                None => version::allocate(conn)?,
            };
            updated.set_version(version);
            command::build(self.schema, &CommandContext::insert(&updated))?.execute(conn)?;
        } else {
            updated.set_version(head.version() + 1);
            let affected =
                command::build(self.schema, &CommandContext::update(&updated, head.version()))?
                    .execute(conn)?;
            if affected == 0 {
                return Err(Error::ConcurrencyConflict {
                    key: updated.key(),
                    expected: head.version(),
                    actual: head.version() + 1,
                });
            }
        }
        Ok(updated)
    }

    /// Delete inside an open transaction
    pub(crate) fn delete_in_tx(
        &self,
        conn: &Connection,
        key: &str,
        shared_version: Option<i64>,
    ) -> Result<DeleteEffect> {
        if self.schema.flags.soft_delete {
            let Some(head) = self.read_head(conn, key)? else {
                return Ok(DeleteEffect::NoOp);
            };
            if head.is_deleted() {
                // Idempotent: the chain already ends in a tombstone
                return Ok(DeleteEffect::NoOp);
            }

            let version = match shared_version {
                Some(v) => v,
                None => version::allocate(conn)?,
            };
            let mut tombstone = head.clone();
            tombstone.set_version(version);
            tombstone.set_is_deleted(true);
            tombstone.set_last_write_time(now());
            command::build(self.schema, &CommandContext::insert(&tombstone))?.execute(conn)?;
            Ok(DeleteEffect::Applied {
                old_version: Some(head.version()),
                new_version: Some(version),
            })
        } else {
            let affected =
                command::build(self.schema, &CommandContext::<T>::delete(key))?.execute(conn)?;
            if affected == 0 {
                Ok(DeleteEffect::NoOp)
            } else {
                Ok(DeleteEffect::Applied {
                    old_version: None,
                    new_version: None,
                })
            }
        }
    }

    fn read_exact(&self, conn: &Connection, key: &str, version: i64) -> Result<Option<T>> {
        let columns: Vec<String> = self
            .schema
            .select_columns()
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE \"Id\" = @p0 AND \"Version\" = @p1",
            columns.join(", "),
            self.schema.qualified_table()
        );
        let command = command::SqlCommand {
            sql,
            params: vec![
                ("@p0".to_string(), Value::Text(key.to_string())),
                ("@p1".to_string(), Value::I64(version)),
            ],
        };
        let mut rows: Vec<T> = command.query_entities(conn)?;
        Ok(rows.pop())
    }

    /// Append an audit record when the schema enables auditing
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn audit_write(
        &self,
        operation: &str,
        entity_id: &str,
        old_version: Option<i64>,
        new_version: Option<i64>,
        old_entity: Option<&T>,
        new_entity: Option<&T>,
        ctx: &OpContext,
    ) {
        if !self.schema.flags.audit {
            return;
        }
        let mut record =
            AuditRecord::new(T::entity_type(), entity_id, operation, ctx.caller.clone());
        record.old_version = old_version;
        record.new_version = new_version;
        record.old_value_json = old_entity.and_then(|e| serde_json::to_string(e).ok());
        record.new_value_json = new_entity.and_then(|e| serde_json::to_string(e).ok());
        record.size = record.new_value_json.as_ref().map(|j| j.len() as i64);
        audit::record(self.store(), record);
    }
}

/// Outcome of a transactional delete
pub(crate) enum DeleteEffect {
    /// A tombstone was appended or rows were removed
    Applied {
        old_version: Option<i64>,
        new_version: Option<i64>,
    },
    /// Nothing to do; delete is idempotent
    NoOp,
}
