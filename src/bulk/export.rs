// src/bulk/export.rs

//! Chunked export with manifest and checksums
//!
//! Exports stream matching rows in batch-sized chunks. With an export
//! folder configured, each chunk becomes one data file named
//! `<prefix>_<yyyyMMddHHmmss>_<index:04>.(json|csv)[.gz]`, accompanied by
//! a metadata file and a manifest listing every data file with its size,
//! row count, SHA-256 checksum, and compression flag.

use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info};

use crate::audit::AuditRecord;
use crate::command::SqlCommand;
use crate::entity::{Entity, OpContext};
use crate::error::Result;
use crate::filter::Filter;
use crate::query::{SqlFragment, translate_where};
use crate::schema::{
    COL_EXPIRATION, COL_EXPORTED_DATE, COL_ID, COL_IS_DELETED, COL_LAST_WRITE, COL_VERSION,
};
use crate::store::EntityStore;
use crate::value::{Value, format_timestamp, now};

use super::{
    BulkExportOptions, BulkExportResult, BulkProgress, DataFileEntry, ExportFormat, ExportManifest,
    ExportMetadata, ExportMode, ExportStatistics, MANIFEST_SCHEMA_VERSION, ProgressFn,
    checksum_bytes, record_from_entity,
};

impl<T: Entity> EntityStore<'_, T> {
    /// Export rows matching the predicate and mode filters
    ///
    /// Returns entities in memory when no export folder is configured;
    /// otherwise writes chunked data files plus metadata and manifest.
    pub fn export(
        &self,
        filter: Option<&Filter>,
        options: &BulkExportOptions,
        progress: Option<ProgressFn<'_>>,
        ctx: &OpContext,
    ) -> Result<BulkExportResult<T>> {
        ctx.cancel.check()?;
        let started = Instant::now();
        let prefix = if options.file_prefix.is_empty() {
            T::entity_type().to_string()
        } else {
            options.file_prefix.clone()
        };

        let fragment = self.export_fragment(filter, options)?;
        let base_sql = self.export_select_sql(&fragment, options);
        let total = self.export_count(&fragment, options)?;

        debug!(
            entity = T::entity_type(),
            total,
            mode = options.mode.manifest_name(),
            "export starting"
        );

        let conn = self.store().connection()?;
        let stamp = now();
        let timestamp_tag = stamp.format("%Y%m%d%H%M%S").to_string();

        let mut exported: Vec<T> = Vec::new();
        let mut files: Vec<PathBuf> = Vec::new();
        let mut data_files: Vec<DataFileEntry> = Vec::new();
        let mut exported_keys: Vec<String> = Vec::new();
        let mut deleted_included = 0i64;
        let mut uncompressed_bytes = 0u64;
        let mut total_bytes = 0u64;
        let mut processed = 0usize;
        let mut chunk_index = 0usize;

        if let Some(folder) = &options.export_folder {
            std::fs::create_dir_all(folder)?;
        }

        loop {
            ctx.cancel.check()?;
            let chunk_sql = format!(
                "{} LIMIT {} OFFSET {}",
                base_sql,
                options.batch_size.max(1),
                processed
            );
            let command = SqlCommand {
                sql: chunk_sql,
                params: fragment.params.clone(),
            };
            let chunk: Vec<T> = command.query_entities(&conn)?;
            if chunk.is_empty() {
                break;
            }

            processed += chunk.len();
            deleted_included += chunk.iter().filter(|e| e.is_deleted()).count() as i64;
            for entity in &chunk {
                exported_keys.push(entity.key());
            }

            if let Some(folder) = &options.export_folder {
                let payload = self.render_chunk(&chunk, options)?;
                uncompressed_bytes += payload.len() as u64;

                let extension = match options.format {
                    ExportFormat::Json => "json",
                    ExportFormat::Csv => "csv",
                };
                let file_name = if options.compress {
                    format!("{}_{}_{:04}.{}.gz", prefix, timestamp_tag, chunk_index, extension)
                } else {
                    format!("{}_{}_{:04}.{}", prefix, timestamp_tag, chunk_index, extension)
                };
                let path = folder.join(&file_name);

                let bytes = if options.compress {
                    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                    encoder.write_all(&payload)?;
                    encoder.finish()?
                } else {
                    payload
                };
                std::fs::write(&path, &bytes)?;
                total_bytes += bytes.len() as u64;

                data_files.push(DataFileEntry {
                    file_name,
                    file_size_bytes: bytes.len() as i64,
                    entity_count: chunk.len() as i32,
                    checksum: checksum_bytes(&bytes),
                    is_compressed: options.compress,
                });
                files.push(path);
                chunk_index += 1;
            } else {
                exported.extend(chunk);
            }

            if let Some(progress) = progress {
                progress(BulkProgress {
                    processed,
                    total: total as usize,
                    elapsed: started.elapsed(),
                });
            }
        }

        let mut manifest_path = None;
        let mut metadata_path = None;
        if let Some(folder) = &options.export_folder {
            let metadata = ExportMetadata {
                schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
                export_timestamp: format_timestamp(stamp),
                entity_type: T::entity_type().to_string(),
                entity_count: processed as i64,
                soft_delete_enabled: self.schema().flags.soft_delete,
                export_mode: options.mode.manifest_name().to_string(),
                filter_criteria: fragment.sql.clone(),
                additional_properties: Default::default(),
            };
            let statistics = ExportStatistics {
                total_entities_processed: processed as i64,
                total_versions_exported: processed as i64,
                deleted_entities_included: deleted_included,
                total_file_size_bytes: total_bytes as i64,
                compression_ratio: if options.compress && total_bytes > 0 {
                    uncompressed_bytes as f64 / total_bytes as f64
                } else {
                    1.0
                },
            };

            let metadata_file = folder.join(format!("{}_{}_metadata.json", prefix, timestamp_tag));
            std::fs::write(&metadata_file, serde_json::to_vec_pretty(&metadata)?)?;
            metadata_path = Some(metadata_file);

            let manifest = ExportManifest {
                metadata,
                statistics,
                data_files,
            };
            let manifest_file = folder.join(format!("{}_{}_manifest.json", prefix, timestamp_tag));
            std::fs::write(&manifest_file, serde_json::to_vec_pretty(&manifest)?)?;
            manifest_path = Some(manifest_file);
        }

        if options.mark_as_exported && options.mode == ExportMode::Archive {
            self.stamp_exported(&conn, &exported_keys, stamp)?;
            if self.schema().flags.audit && !exported_keys.is_empty() {
                let mut record = AuditRecord::new(
                    T::entity_type(),
                    "<bulk>",
                    "EXPORT",
                    ctx.caller.clone(),
                );
                record.size = Some(processed as i64);
                crate::audit::record(self.store(), record);
            }
        }

        info!(
            entity = T::entity_type(),
            exported = processed,
            files = files.len(),
            "export complete"
        );

        Ok(BulkExportResult {
            entity_count: processed as i64,
            entities: if options.export_folder.is_none() {
                Some(exported)
            } else {
                None
            },
            files,
            manifest_path,
            metadata_path,
            total_bytes,
            duration: started.elapsed(),
        })
    }

    /// WHERE conjunction for the export: predicate plus mode filters
    fn export_fragment(
        &self,
        filter: Option<&Filter>,
        options: &BulkExportOptions,
    ) -> Result<SqlFragment> {
        let mut parts: Vec<String> = Vec::new();
        let mut params: Vec<(String, Value)> = Vec::new();

        if let Some(filter) = filter {
            let fragment = translate_where(self.schema(), filter)?;
            parts.push(fragment.sql);
            params.extend(fragment.params);
        }

        if options.mode == ExportMode::Incremental
            && let Some(from_date) = options.from_date
        {
            params.push(("@m0".to_string(), Value::Timestamp(from_date)));
            parts.push(format!(
                "datetime(\"{}\") > datetime(@m0)",
                COL_LAST_WRITE
            ));
        }
        if options.mode == ExportMode::Archive
            && let Some(older_than) = options.older_than
        {
            params.push(("@m1".to_string(), Value::Timestamp(now() - older_than)));
            parts.push(format!(
                "datetime(\"{}\") < datetime(@m1)",
                COL_LAST_WRITE
            ));
        }
        if !options.include_deleted && self.schema().flags.soft_delete {
            parts.push(format!("\"{}\" = 0", COL_IS_DELETED));
        }
        if !options.include_expired && self.schema().flags.expiry {
            params.push(("@m2".to_string(), Value::Timestamp(now())));
            parts.push(format!(
                "(\"{col}\" IS NULL OR datetime(\"{col}\") > datetime(@m2))",
                col = COL_EXPIRATION
            ));
        }

        Ok(SqlFragment {
            sql: parts.join(" AND "),
            params,
        })
    }

    /// Ordered row selection the chunk loop paginates over
    fn export_select_sql(&self, fragment: &SqlFragment, options: &BulkExportOptions) -> String {
        let columns = self
            .schema()
            .select_columns()
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = if options.include_all_versions || !self.schema().flags.soft_delete {
            let mut sql = format!("SELECT {} FROM {}", columns, self.schema().qualified_table());
            if !fragment.sql.is_empty() {
                sql.push_str(&format!(" WHERE {}", fragment.sql));
            }
            sql
        } else {
            let mut sql = format!(
                "WITH LatestVersions AS (
    SELECT *, ROW_NUMBER() OVER (PARTITION BY \"{id}\" ORDER BY \"{version}\" DESC) AS rn
    FROM {table}
)
SELECT {columns} FROM LatestVersions WHERE rn = 1",
                id = COL_ID,
                version = COL_VERSION,
                table = self.schema().qualified_table(),
                columns = columns,
            );
            if !fragment.sql.is_empty() {
                sql.push_str(&format!(" AND {}", fragment.sql));
            }
            sql
        };
        sql.push_str(&format!(" ORDER BY \"{}\", \"{}\"", COL_ID, COL_VERSION));
        sql
    }

    fn export_count(&self, fragment: &SqlFragment, options: &BulkExportOptions) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM ({})",
            self.export_select_sql(fragment, options)
        );
        let command = SqlCommand {
            sql,
            params: fragment.params.clone(),
        };
        let conn = self.store().connection()?;
        match command.query_scalar(&conn)? {
            Some(Value::I64(count)) => Ok(count),
            _ => Ok(0),
        }
    }

    fn render_chunk(&self, chunk: &[T], options: &BulkExportOptions) -> Result<Vec<u8>> {
        match options.format {
            ExportFormat::Json => {
                let records: Vec<serde_json::Value> = chunk
                    .iter()
                    .map(|e| serde_json::Value::Object(record_from_entity(self.schema(), e)))
                    .collect();
                Ok(serde_json::to_vec_pretty(&records)?)
            }
            ExportFormat::Csv => {
                Ok(super::csv::render(self.schema(), chunk, &options.csv).into_bytes())
            }
        }
    }

    /// Additive `ExportedDate` column, stamped on every exported row
    fn stamp_exported(
        &self,
        conn: &rusqlite::Connection,
        keys: &[String],
        stamp: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let table = self.schema().qualified_table();
        let has_column: bool = {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            names.iter().any(|n| n == COL_EXPORTED_DATE)
        };
        if !has_column {
            conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN \"{}\" TEXT",
                    table, COL_EXPORTED_DATE
                ),
                [],
            )?;
            debug!(entity = T::entity_type(), "added ExportedDate column");
        }

        let rendered = format_timestamp(stamp);
        for chunk in keys.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE {} SET \"{}\" = ? WHERE \"{}\" IN ({})",
                table, COL_EXPORTED_DATE, COL_ID, placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut args: Vec<&dyn rusqlite::ToSql> = vec![&rendered];
            for key in chunk {
                args.push(key);
            }
            stmt.execute(args.as_slice())?;
        }
        Ok(())
    }
}
