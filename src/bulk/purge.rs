// src/bulk/purge.rs

//! Purge: physical removal of rows by strategy
//!
//! The only code path that destroys entity rows. Safe mode previews the
//! delete set without touching it; a backup, when requested, is a full
//! compressed export that must succeed before any row dies. Orphaned
//! list mappings left behind by purged chains are cleaned alongside.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::audit::AuditRecord;
use crate::command::SqlCommand;
use crate::entity::{Entity, OpContext};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::query::{SqlFragment, translate_where};
use crate::schema::{COL_EXPIRATION, COL_ID, COL_IS_ARCHIVED, COL_IS_DELETED, COL_VERSION};
use crate::store::EntityStore;
use crate::value::{Value, now};

use super::{
    BulkExportOptions, BulkProgress, ESTIMATED_ROW_BYTES, ProgressFn, PurgeAudit, PurgeBackup,
    PurgeOptions, PurgePreview, PurgeResult, PurgeStrategy,
};

impl<T: Entity> EntityStore<'_, T> {
    /// Preview or execute a purge according to the strategy
    pub fn purge(
        &self,
        filter: Option<&Filter>,
        options: &PurgeOptions,
        progress: Option<ProgressFn<'_>>,
        ctx: &OpContext,
    ) -> Result<PurgeResult> {
        ctx.cancel.check()?;
        let started = Instant::now();
        let condition = self.purge_condition(filter, options.strategy)?;

        let mut result = PurgeResult::default();

        let preview = self.build_preview(&condition, options.max_samples)?;
        if options.safe_mode {
            debug!(
                entity = T::entity_type(),
                entities = preview.affected_entity_count,
                versions = preview.affected_version_count,
                "purge preview (safe mode)"
            );
            result.preview = Some(preview);
            result.duration = started.elapsed();
            return Ok(result);
        }

        // A failed backup aborts the purge outright
        if options.backup_before_purge {
            result.backup = Some(self.backup_for_purge(options, ctx)?);
        }

        ctx.cancel.check()?;
        let affected_keys = self.condition_keys(&condition)?;

        let conn = self.store().connection()?;
        let delete_sql = format!(
            "DELETE FROM {} WHERE {}",
            self.schema().qualified_table(),
            condition.sql
        );
        let delete = SqlCommand {
            sql: delete_sql,
            params: condition.params.clone(),
        };

        let versions_purged = if options.use_transaction {
            let tx = self.store().begin_write(&conn)?;
            let removed = delete.execute(&tx)?;
            result.list_mappings_cleaned = self.clean_orphan_mappings(&tx, &affected_keys)?;
            ctx.cancel.check()?;
            tx.commit()?;
            removed
        } else {
            let removed = delete.execute(&conn)?;
            result.list_mappings_cleaned = self.clean_orphan_mappings(&conn, &affected_keys)?;
            removed
        };

        if let Some(progress) = progress {
            progress(BulkProgress {
                processed: versions_purged,
                total: preview.affected_version_count as usize,
                elapsed: started.elapsed(),
            });
        }

        if options.optimize_storage {
            // VACUUM cannot run inside a transaction
            conn.execute_batch("REINDEX; VACUUM;")?;
            debug!(entity = T::entity_type(), "storage optimized after purge");
        }

        result.entities_purged = preview.affected_entity_count;
        result.versions_purged = versions_purged as i64;
        result.space_reclaimed = versions_purged as u64 * ESTIMATED_ROW_BYTES;
        result.duration = started.elapsed();
        result.audit = Some(PurgeAudit {
            strategy: options.strategy,
            timestamp: now(),
        });

        if self.schema().flags.audit {
            let mut record =
                AuditRecord::new(T::entity_type(), "<bulk>", "PURGE", ctx.caller.clone());
            record.size = Some(result.versions_purged);
            record.new_value_json = Some(format!(
                "{{\"strategy\":\"{:?}\",\"entitiesPurged\":{},\"versionsPurged\":{}}}",
                options.strategy, result.entities_purged, result.versions_purged
            ));
            crate::audit::record(self.store(), record);
        }

        info!(
            entity = T::entity_type(),
            strategy = ?options.strategy,
            entities = result.entities_purged,
            versions = result.versions_purged,
            mappings = result.list_mappings_cleaned,
            "purge complete"
        );
        Ok(result)
    }

    /// WHERE condition selecting the rows a strategy removes
    fn purge_condition(
        &self,
        filter: Option<&Filter>,
        strategy: PurgeStrategy,
    ) -> Result<SqlFragment> {
        let mut parts: Vec<String> = Vec::new();
        let mut params: Vec<(String, Value)> = Vec::new();

        if let Some(filter) = filter {
            let fragment = translate_where(self.schema(), filter)?;
            parts.push(fragment.sql);
            params.extend(fragment.params);
        }

        match strategy {
            PurgeStrategy::PurgeExpired => {
                if !self.schema().flags.expiry {
                    return Err(Error::NotSupported(
                        "PurgeExpired requires the 'expiry' flag".to_string(),
                    ));
                }
                params.push(("@now".to_string(), Value::Timestamp(now())));
                parts.push(format!(
                    "datetime(\"{}\") < datetime(@now)",
                    COL_EXPIRATION
                ));
                if self.schema().flags.archive {
                    parts.push(format!("\"{}\" = 0", COL_IS_ARCHIVED));
                }
            }
            PurgeStrategy::PurgeDeletedOnly => {
                if !self.schema().flags.soft_delete {
                    return Err(Error::NotSupported(
                        "PurgeDeletedOnly requires the 'soft_delete' flag".to_string(),
                    ));
                }
                parts.push(format!("\"{}\" = 1", COL_IS_DELETED));
            }
            PurgeStrategy::PreserveActiveVersions => {
                if !self.schema().flags.soft_delete {
                    return Err(Error::NotSupported(
                        "PreserveActiveVersions requires the 'soft_delete' flag".to_string(),
                    ));
                }
                let table = self.schema().qualified_table();
                // Whole chains whose head is a tombstone, plus non-head
                // rows of chains whose head is live
                parts.push(format!(
                    "(\"{id}\" IN (
        SELECT heads.\"{id}\" FROM (
            SELECT \"{id}\", MAX(\"{version}\") AS MaxVersion FROM {table} GROUP BY \"{id}\"
        ) heads
        JOIN {table} head_row
          ON head_row.\"{id}\" = heads.\"{id}\" AND head_row.\"{version}\" = heads.MaxVersion
        WHERE head_row.\"{deleted}\" = 1
    ) OR \"{version}\" < (
        SELECT MAX(chain.\"{version}\") FROM {table} chain
        WHERE chain.\"{id}\" = {table}.\"{id}\"
    ))",
                    id = COL_ID,
                    version = COL_VERSION,
                    deleted = COL_IS_DELETED,
                    table = table,
                ));
            }
            PurgeStrategy::PurgeAllOldVersions => {
                if parts.is_empty() {
                    parts.push("1 = 1".to_string());
                }
            }
        }

        Ok(SqlFragment {
            sql: parts.join(" AND "),
            params,
        })
    }

    /// Count and sample the delete set without touching it
    fn build_preview(&self, condition: &SqlFragment, max_samples: usize) -> Result<PurgePreview> {
        let conn = self.store().connection()?;
        let table = self.schema().qualified_table();

        let count_sql = format!(
            "SELECT COUNT(*), COUNT(DISTINCT \"{}\") FROM {} WHERE {}",
            COL_ID, table, condition.sql
        );
        let (version_count, entity_count) = {
            let mut stmt = conn.prepare(&count_sql)?;
            stmt.query_row(condition.bind_args().as_slice(), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
        };

        let sample_sql = format!(
            "SELECT DISTINCT \"{}\" FROM {} WHERE {} ORDER BY \"{}\" LIMIT {}",
            COL_ID, table, condition.sql, COL_ID, max_samples
        );
        let samples = {
            let mut stmt = conn.prepare(&sample_sql)?;
            stmt.query_map(condition.bind_args().as_slice(), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut stats_by_state = std::collections::HashMap::new();
        let mut state_terms: Vec<(&str, String)> = Vec::new();
        if self.schema().flags.soft_delete {
            state_terms.push((
                "deleted",
                format!("SUM(CASE WHEN \"{}\" = 1 THEN 1 ELSE 0 END)", COL_IS_DELETED),
            ));
        }
        if self.schema().flags.expiry {
            state_terms.push((
                "expired",
                format!(
                    "SUM(CASE WHEN \"{col}\" IS NOT NULL AND datetime(\"{col}\") < datetime('now') THEN 1 ELSE 0 END)",
                    col = COL_EXPIRATION
                ),
            ));
        }
        if self.schema().flags.archive {
            state_terms.push((
                "archived",
                format!("SUM(CASE WHEN \"{}\" = 1 THEN 1 ELSE 0 END)", COL_IS_ARCHIVED),
            ));
        }
        if !state_terms.is_empty() {
            let select_list = state_terms
                .iter()
                .map(|(_, term)| term.clone())
                .collect::<Vec<_>>()
                .join(", ");
            let stats_sql = format!(
                "SELECT {} FROM {} WHERE {}",
                select_list, table, condition.sql
            );
            let mut stmt = conn.prepare(&stats_sql)?;
            let counts: Vec<i64> = stmt.query_row(condition.bind_args().as_slice(), |row| {
                (0..state_terms.len())
                    .map(|i| row.get::<_, Option<i64>>(i).map(|v| v.unwrap_or(0)))
                    .collect()
            })?;
            for ((name, _), count) in state_terms.iter().zip(counts) {
                stats_by_state.insert(name.to_string(), count);
            }
        }
        stats_by_state.insert("total".to_string(), version_count);

        Ok(PurgePreview {
            affected_entity_count: entity_count,
            affected_version_count: version_count,
            sample_entities: samples,
            estimated_space_to_reclaim: version_count as u64 * ESTIMATED_ROW_BYTES,
            stats_by_state,
        })
    }

    /// Distinct keys in the delete set, for orphan mapping cleanup
    fn condition_keys(&self, condition: &SqlFragment) -> Result<Vec<String>> {
        if !self.schema().flags.sync_with_list {
            return Ok(Vec::new());
        }
        let conn = self.store().connection()?;
        let sql = format!(
            "SELECT DISTINCT \"{}\" FROM {} WHERE {}",
            COL_ID,
            self.schema().qualified_table(),
            condition.sql
        );
        let mut stmt = conn.prepare(&sql)?;
        let keys = stmt
            .query_map(condition.bind_args().as_slice(), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Remove mappings whose entry no longer has any row
    ///
    /// Restricted to the purged keys so mappings owned by other entity
    /// tables sharing the mapping store are untouched.
    fn clean_orphan_mappings(
        &self,
        conn: &rusqlite::Connection,
        purged_keys: &[String],
    ) -> Result<i64> {
        if purged_keys.is_empty() {
            return Ok(0);
        }
        let table = self.schema().qualified_table();
        let mut cleaned = 0i64;
        for chunk in purged_keys.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM \"EntryListMapping\"
                 WHERE \"EntryCacheKey\" IN ({placeholders})
                   AND \"EntryCacheKey\" NOT IN (SELECT \"{id}\" FROM {table})",
                placeholders = placeholders,
                id = COL_ID,
                table = table,
            );
            let mut stmt = conn.prepare(&sql)?;
            let args: Vec<&dyn rusqlite::ToSql> =
                chunk.iter().map(|k| k as &dyn rusqlite::ToSql).collect();
            cleaned += stmt.execute(args.as_slice())? as i64;
        }
        if cleaned > 0 {
            warn!(
                entity = T::entity_type(),
                cleaned, "purge removed orphaned list mappings"
            );
        }
        Ok(cleaned)
    }

    /// Full compressed export backing up the table before destruction
    fn backup_for_purge(&self, options: &PurgeOptions, ctx: &OpContext) -> Result<PurgeBackup> {
        let staging = match &options.backup_folder {
            Some(folder) => {
                std::fs::create_dir_all(folder)?;
                tempfile::Builder::new()
                    .prefix("purge-backup-")
                    .tempdir_in(folder)?
            }
            None => tempfile::Builder::new().prefix("purge-backup-").tempdir()?,
        };
        // The backup must outlive the purge
        let folder = staging.keep();

        let export_options = BulkExportOptions {
            include_deleted: true,
            include_expired: true,
            include_all_versions: true,
            compress: true,
            export_folder: Some(folder.clone()),
            ..Default::default()
        };
        let export = self.export(None, &export_options, None, ctx)?;
        info!(
            entity = T::entity_type(),
            folder = %folder.display(),
            files = export.files.len(),
            "purge backup written"
        );
        Ok(PurgeBackup {
            folder,
            files: export.files.len(),
            manifest: export.manifest_path,
        })
    }
}
