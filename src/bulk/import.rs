// src/bulk/import.rs

//! Bulk import with strategies and conflict resolution
//!
//! Rows import in batch-sized chunks, each under its own transaction.
//! Existing live heads are loaded up front; per row the strategy decides
//! between insert, update, skip, or conflict resolution. One ledger
//! allocation serves the whole invocation, so every row written by an
//! import lands on the same global version. File imports detect JSON,
//! CSV, and manifest payloads, verifying each data file's SHA-256
//! checksum before touching its rows.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::command::{self, CommandContext};
use crate::entity::{Entity, OpContext};
use crate::error::{Error, Result};
use crate::store::EntityStore;
use crate::value::now;
use crate::version;

use super::{
    BulkImportOptions, BulkImportResult, BulkProgress, ConflictResolution, ConflictType,
    ExportManifest, FileFormat, ImportConflict, ImportStrategy, MergePriority, ProgressFn,
    checksum_bytes, detect_format, record_from_entity, value_map_from_record,
};

impl<T: Entity> EntityStore<'_, T> {
    /// Import entities according to the configured strategy
    pub fn import(
        &self,
        entities: &[T],
        options: &BulkImportOptions,
        progress: Option<ProgressFn<'_>>,
        ctx: &OpContext,
    ) -> Result<BulkImportResult> {
        ctx.cancel.check()?;
        let started = Instant::now();
        let mut result = BulkImportResult::default();
        result
            .metadata
            .insert("entityType".to_string(), T::entity_type().to_string());
        result.metadata.insert(
            "strategy".to_string(),
            format!("{:?}", options.strategy),
        );

        // Validation happens before any row is written
        let mut accepted: Vec<&T> = Vec::with_capacity(entities.len());
        if options.validate_before_import {
            for entity in entities {
                match self.validate_entity(entity) {
                    Ok(()) => accepted.push(entity),
                    Err(err) => {
                        result.failure_count += 1;
                        result
                            .errors
                            .push(format!("validation failed for '{}': {}", entity.key(), err));
                    }
                }
            }
        } else {
            accepted.extend(entities.iter());
        }

        if options.strategy == ImportStrategy::Replace {
            let conn = self.store().connection()?;
            let removed = conn.execute(
                &format!("DELETE FROM {}", self.schema().qualified_table()),
                [],
            )?;
            debug!(
                entity = T::entity_type(),
                removed, "replace import truncated table"
            );
        }

        // Existing live heads keyed by id; Replace starts from empty
        let mut existing: HashMap<String, T> = HashMap::new();
        if options.strategy != ImportStrategy::Replace {
            let snapshot = self.export(
                None,
                &super::BulkExportOptions {
                    batch_size: options.batch_size,
                    ..Default::default()
                },
                None,
                ctx,
            )?;
            for head in snapshot.entities.unwrap_or_default() {
                existing.insert(head.key(), head);
            }
        }

        // One allocation covers every row this invocation writes
        let shared_version = if self.schema().flags.soft_delete && !options.preserve_version_chains
        {
            let conn = self.store().connection()?;
            Some(version::allocate(&conn)?)
        } else {
            None
        };

        let total = accepted.len();
        let mut processed = 0usize;
        let mut max_imported_version = 0i64;
        let mut timed_out = false;

        for chunk in accepted.chunks(options.batch_size.max(1)) {
            ctx.cancel.check()?;
            let conn = self.store().connection()?;
            let tx = self.store().begin_write(&conn)?;

            for entity in chunk {
                if let Some(timeout) = options.timeout
                    && started.elapsed() > timeout
                {
                    result
                        .errors
                        .push("import timeout exceeded; remaining rows skipped".to_string());
                    timed_out = true;
                    break;
                }
                ctx.cancel.check()?;

                let outcome = self.import_row(
                    &tx,
                    entity,
                    &mut existing,
                    options,
                    shared_version,
                    &mut result,
                );
                match outcome {
                    Ok(version) => {
                        max_imported_version = max_imported_version.max(version.unwrap_or(0));
                    }
                    Err(err) => {
                        result.failure_count += 1;
                        result
                            .errors
                            .push(format!("import failed for '{}': {}", entity.key(), err));
                    }
                }

                processed += 1;
                if processed % 100 == 0
                    && let Some(progress) = progress
                {
                    progress(BulkProgress {
                        processed,
                        total,
                        elapsed: started.elapsed(),
                    });
                }
            }

            if timed_out {
                // The in-flight batch rolls back with the transaction
                break;
            }
            tx.commit()?;
            result.statistics.batches += 1;
        }

        if options.preserve_version_chains
            && self.schema().flags.soft_delete
            && max_imported_version > 0
        {
            let conn = self.store().connection()?;
            version::ensure_at_least(&conn, max_imported_version)?;
        }

        if let Some(progress) = progress {
            progress(BulkProgress {
                processed,
                total,
                elapsed: started.elapsed(),
            });
        }

        result.statistics.duration = started.elapsed();
        let seconds = result.statistics.duration.as_secs_f64();
        result.statistics.entities_per_second = if seconds > 0.0 {
            processed as f64 / seconds
        } else {
            processed as f64
        };

        info!(
            entity = T::entity_type(),
            success = result.success_count,
            skipped = result.skipped_count,
            failed = result.failure_count,
            conflicts = result.conflicts.len(),
            timed_out,
            "import complete"
        );
        Ok(result)
    }

    /// Import one row inside the chunk transaction; returns the written
    /// version, if a row was written
    fn import_row(
        &self,
        conn: &rusqlite::Connection,
        entity: &T,
        existing: &mut HashMap<String, T>,
        options: &BulkImportOptions,
        shared_version: Option<i64>,
        result: &mut BulkImportResult,
    ) -> Result<Option<i64>> {
        let key = entity.key();
        let Some(target) = existing.get(&key).cloned() else {
            let written = self.write_import_row(conn, entity, None, options, shared_version)?;
            existing.insert(key, written.clone());
            result.success_count += 1;
            return Ok(Some(written.version()));
        };

        match options.strategy {
            ImportStrategy::Replace => {
                // Replace truncated the table; duplicate keys within the
                // input overwrite each other
                let written =
                    self.write_import_row(conn, entity, Some(&target), options, shared_version)?;
                existing.insert(key, written.clone());
                result.success_count += 1;
                Ok(Some(written.version()))
            }
            ImportStrategy::Merge => {
                result.skipped_count += 1;
                Ok(None)
            }
            ImportStrategy::Upsert => {
                let conflict_type = self.detect_conflict(entity, &target);
                let Some(conflict_type) = conflict_type else {
                    let written = self.write_import_row(
                        conn,
                        entity,
                        Some(&target),
                        options,
                        shared_version,
                    )?;
                    existing.insert(key, written.clone());
                    result.success_count += 1;
                    return Ok(Some(written.version()));
                };

                result.conflicts.push(ImportConflict {
                    key: key.clone(),
                    conflict_type,
                    resolution: options.conflict_resolution,
                    source_version: entity.version(),
                    target_version: target.version(),
                });

                match options.conflict_resolution {
                    ConflictResolution::UseSource => {
                        let written = self.write_import_row(
                            conn,
                            entity,
                            Some(&target),
                            options,
                            shared_version,
                        )?;
                        existing.insert(key, written.clone());
                        result.success_count += 1;
                        Ok(Some(written.version()))
                    }
                    ConflictResolution::UseTarget => {
                        result.skipped_count += 1;
                        Ok(None)
                    }
                    ConflictResolution::Merge => {
                        let winner = if options.field_merge_priorities.is_empty() {
                            if entity.last_write_time() >= target.last_write_time() {
                                Some(entity.clone())
                            } else {
                                None
                            }
                        } else {
                            Some(self.merge_fields(entity, &target, options)?)
                        };
                        match winner {
                            Some(merged) => {
                                let written = self.write_import_row(
                                    conn,
                                    &merged,
                                    Some(&target),
                                    options,
                                    shared_version,
                                )?;
                                existing.insert(key, written.clone());
                                result.success_count += 1;
                                Ok(Some(written.version()))
                            }
                            None => {
                                result.skipped_count += 1;
                                Ok(None)
                            }
                        }
                    }
                    ConflictResolution::Manual => {
                        result.skipped_count += 1;
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Write an imported row, honoring chain preservation
    fn write_import_row(
        &self,
        conn: &rusqlite::Connection,
        entity: &T,
        target: Option<&T>,
        options: &BulkImportOptions,
        shared_version: Option<i64>,
    ) -> Result<T> {
        let mut stored = entity.clone();

        if options.preserve_version_chains {
            // Source version and timestamps land verbatim; same (Id,
            // Version) overwrites
            command::build(self.schema(), &CommandContext::upsert(&stored))?.execute(conn)?;
            return Ok(stored);
        }

        stored.set_last_write_time(now());
        if self.schema().flags.soft_delete {
            let version = match shared_version {
                Some(v) => v,
                None => version::allocate(conn)?,
            };
            stored.set_version(version);
            if let Some(target) = target {
                stored.set_created_time(target.created_time());
            }
            command::build(self.schema(), &CommandContext::upsert(&stored))?.execute(conn)?;
        } else {
            match target {
                Some(target) => {
                    stored.set_version(target.version() + 1);
                    stored.set_created_time(target.created_time());
                    let affected = command::build(
                        self.schema(),
                        &CommandContext::update(&stored, target.version()),
                    )?
                    .execute(conn)?;
                    if affected == 0 {
                        return Err(Error::WriteFailed(stored.key()));
                    }
                }
                None => {
                    stored.set_version(1);
                    command::build(self.schema(), &CommandContext::insert(&stored))?
                        .execute(conn)?;
                }
            }
        }
        Ok(stored)
    }

    /// Version mismatch wins; otherwise canonical user-column inequality
    fn detect_conflict(&self, source: &T, target: &T) -> Option<ConflictType> {
        if source.version() != target.version() {
            return Some(ConflictType::Version);
        }
        let source_record = record_from_entity(self.schema(), source);
        let target_record = record_from_entity(self.schema(), target);
        for column in self.schema().user_columns() {
            if source_record.get(column) != target_record.get(column) {
                return Some(ConflictType::Data);
            }
        }
        None
    }

    /// Field-by-field merge; unlisted columns fall back to the source
    fn merge_fields(&self, source: &T, target: &T, options: &BulkImportOptions) -> Result<T> {
        let source_record = record_from_entity(self.schema(), source);
        let target_record = record_from_entity(self.schema(), target);
        let mut merged = source_record.clone();
        for (column, priority) in &options.field_merge_priorities {
            if *priority == MergePriority::Target
                && let Some(value) = target_record.get(column)
            {
                merged.insert(column.clone(), value.clone());
            }
        }
        T::from_values(&value_map_from_record(self.schema(), &merged))
    }

    /// Check NOT NULL and CHECK constraints before any write
    fn validate_entity(&self, entity: &T) -> Result<()> {
        for column in &self.schema().columns {
            if column.is_computed {
                continue;
            }
            let value = command::bind_value(entity, &column.name);
            if !column.nullable && value.is_null() {
                return Err(Error::ValidationFailed(format!(
                    "Column '{}' must not be null",
                    column.name
                )));
            }
            if let Some(allowed) = &column.check_values
                && let crate::value::Value::Text(text) = &value
                && !allowed.contains(text)
            {
                return Err(Error::ValidationFailed(format!(
                    "Value '{}' not allowed for column '{}'",
                    text, column.name
                )));
            }
        }
        Ok(())
    }

    /// Import from a JSON, CSV, gzip-compressed, or manifest file
    pub fn import_from_file(
        &self,
        path: &Path,
        options: &BulkImportOptions,
        progress: Option<ProgressFn<'_>>,
        ctx: &OpContext,
    ) -> Result<BulkImportResult> {
        ctx.cancel.check()?;
        let bytes = std::fs::read(path)?;
        let bytes = if path.extension().is_some_and(|ext| ext == "gz") {
            gunzip(&bytes)?
        } else {
            bytes
        };
        let content = String::from_utf8(bytes)
            .map_err(|_| Error::Format(format!("File is not UTF-8: {}", path.display())))?;

        match detect_format(&content) {
            FileFormat::Json => {
                let json: serde_json::Value = serde_json::from_str(&content)?;
                if is_manifest(&json) {
                    self.import_manifest(path, &content, options, progress, ctx)
                } else {
                    let (entities, mut pre_errors, pre_failures) = self.entities_from_json(&json);
                    let mut result = self.import(&entities, options, progress, ctx)?;
                    result.failure_count += pre_failures;
                    result.errors.append(&mut pre_errors);
                    Ok(result)
                }
            }
            FileFormat::Csv => {
                let maps = super::csv::parse(self.schema(), &content, &options.csv)?;
                let mut pre_errors = Vec::new();
                let mut pre_failures = 0usize;
                let mut entities = Vec::with_capacity(maps.len());
                for map in &maps {
                    match T::from_values(map) {
                        Ok(entity) => entities.push(entity),
                        Err(err) => {
                            pre_failures += 1;
                            pre_errors.push(format!("row decode failed: {}", err));
                        }
                    }
                }
                let mut result = self.import(&entities, options, progress, ctx)?;
                result.failure_count += pre_failures;
                result.errors.append(&mut pre_errors);
                Ok(result)
            }
        }
    }

    /// Verify and ingest every data file referenced by a manifest
    fn import_manifest(
        &self,
        manifest_path: &Path,
        content: &str,
        options: &BulkImportOptions,
        progress: Option<ProgressFn<'_>>,
        ctx: &OpContext,
    ) -> Result<BulkImportResult> {
        let manifest: ExportManifest = serde_json::from_str(content)?;

        if let Some(expected) = &options.expected_schema_version
            && expected != &manifest.metadata.schema_version
        {
            return Err(Error::Format(format!(
                "Manifest schema version '{}' does not match expected '{}'",
                manifest.metadata.schema_version, expected
            )));
        }

        let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let mut entities: Vec<T> = Vec::new();
        let mut pre_errors: Vec<String> = Vec::new();
        let mut pre_failures = 0usize;

        for entry in &manifest.data_files {
            ctx.cancel.check()?;
            let file_path = base.join(&entry.file_name);
            let disk_bytes = match std::fs::read(&file_path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    pre_errors.push(format!(
                        "data file '{}' unreadable: {}",
                        entry.file_name, err
                    ));
                    continue;
                }
            };

            // Checksum covers the exact bytes on disk, compression included
            let actual = checksum_bytes(&disk_bytes);
            if actual != entry.checksum {
                warn!(
                    file = %entry.file_name,
                    "checksum mismatch; importing zero rows from this file"
                );
                pre_errors.push(
                    Error::ChecksumMismatch {
                        file: entry.file_name.clone(),
                        expected: entry.checksum.clone(),
                        actual,
                    }
                    .to_string(),
                );
                continue;
            }

            let payload = if entry.is_compressed {
                gunzip(&disk_bytes)?
            } else {
                disk_bytes
            };
            let text = String::from_utf8(payload).map_err(|_| {
                Error::Format(format!("Data file is not UTF-8: {}", entry.file_name))
            })?;

            match detect_format(&text) {
                FileFormat::Json => {
                    let json: serde_json::Value = serde_json::from_str(&text)?;
                    let (mut file_entities, mut errors, failures) = self.entities_from_json(&json);
                    entities.append(&mut file_entities);
                    pre_errors.append(&mut errors);
                    pre_failures += failures;
                }
                FileFormat::Csv => {
                    let maps = super::csv::parse(self.schema(), &text, &options.csv)?;
                    for map in &maps {
                        match T::from_values(map) {
                            Ok(entity) => entities.push(entity),
                            Err(err) => {
                                pre_failures += 1;
                                pre_errors.push(format!("row decode failed: {}", err));
                            }
                        }
                    }
                }
            }
        }

        let mut result = self.import(&entities, options, progress, ctx)?;
        result.failure_count += pre_failures;
        let mut combined = pre_errors;
        combined.append(&mut result.errors);
        result.errors = combined;
        result.metadata.insert(
            "manifestSchemaVersion".to_string(),
            manifest.metadata.schema_version.clone(),
        );
        Ok(result)
    }

    /// Decode a JSON array (or single object) of column-keyed records
    fn entities_from_json(&self, json: &serde_json::Value) -> (Vec<T>, Vec<String>, usize) {
        let mut entities = Vec::new();
        let mut errors = Vec::new();
        let mut failures = 0usize;

        let records: Vec<&serde_json::Map<String, serde_json::Value>> = match json {
            serde_json::Value::Array(items) => {
                items.iter().filter_map(|item| item.as_object()).collect()
            }
            serde_json::Value::Object(map) => vec![map],
            _ => Vec::new(),
        };

        for record in records {
            let values = value_map_from_record(self.schema(), record);
            match T::from_values(&values) {
                Ok(entity) => entities.push(entity),
                Err(err) => {
                    failures += 1;
                    errors.push(format!("record decode failed: {}", err));
                }
            }
        }
        (entities, errors, failures)
    }
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Format(format!("gzip decode failed: {}", e)))?;
    Ok(out)
}

fn is_manifest(json: &serde_json::Value) -> bool {
    json.as_object()
        .map(|map| map.contains_key("metadata") && map.contains_key("dataFiles"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{Order, Product, test_store};
    use chrono::Duration;

    fn order(id: &str, status: &str, amount: f64) -> Order {
        Order::new(id, &format!("ORD-{id}"), status, amount)
    }

    #[test]
    fn test_import_into_empty_table_creates_rows() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let rows = vec![order("a", "New", 1.0), order("b", "New", 2.0)];
        let result = handle
            .import(&rows, &BulkImportOptions::default(), None, &ctx)
            .unwrap();
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 0);
        assert!(handle.get("a", &ctx).unwrap().is_some());

        // All imported rows share one ledger allocation
        let a = handle.get("a", &ctx).unwrap().unwrap();
        let b = handle.get("b", &ctx).unwrap().unwrap();
        assert_eq!(a.version, b.version);
    }

    #[test]
    fn test_merge_strategy_keeps_existing() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        handle.create(&order("a", "Old", 1.0), &ctx).unwrap();
        let result = handle
            .import(
                &[order("a", "Imported", 9.0), order("b", "Imported", 2.0)],
                &BulkImportOptions {
                    strategy: ImportStrategy::Merge,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(result.skipped_count, 1);
        assert_eq!(handle.get("a", &ctx).unwrap().unwrap().status, "Old");
        assert_eq!(handle.get("b", &ctx).unwrap().unwrap().status, "Imported");
    }

    #[test]
    fn test_upsert_use_source_overwrites() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        handle.create(&order("a", "Old", 1.0), &ctx).unwrap();
        let result = handle
            .import(
                &[order("a", "Fresh", 5.0)],
                &BulkImportOptions {
                    strategy: ImportStrategy::Upsert,
                    conflict_resolution: ConflictResolution::UseSource,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(handle.get("a", &ctx).unwrap().unwrap().status, "Fresh");
    }

    #[test]
    fn test_upsert_use_target_skips() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        handle.create(&order("a", "Old", 1.0), &ctx).unwrap();
        let result = handle
            .import(
                &[order("a", "Fresh", 5.0)],
                &BulkImportOptions {
                    strategy: ImportStrategy::Upsert,
                    conflict_resolution: ConflictResolution::UseTarget,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.skipped_count, 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(handle.get("a", &ctx).unwrap().unwrap().status, "Old");
    }

    #[test]
    fn test_merge_resolution_newer_last_write_wins() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let target = handle.create(&order("a", "Target", 1.0), &ctx).unwrap();

        // Source carries the same version but different bytes and a
        // newer timestamp
        let mut source = target.clone();
        source.status = "Source".to_string();
        source.last_write_time = target.last_write_time + Duration::seconds(1);

        let result = handle
            .import(
                &[source],
                &BulkImportOptions {
                    strategy: ImportStrategy::Upsert,
                    conflict_resolution: ConflictResolution::Merge,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Data);
        assert_eq!(result.conflicts[0].resolution, ConflictResolution::Merge);
        assert_eq!(handle.get("a", &ctx).unwrap().unwrap().status, "Source");
    }

    #[test]
    fn test_merge_resolution_older_source_skipped() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let target = handle.create(&order("a", "Target", 1.0), &ctx).unwrap();
        let mut source = target.clone();
        source.status = "Stale".to_string();
        source.last_write_time = target.last_write_time - Duration::hours(1);

        let result = handle
            .import(
                &[source],
                &BulkImportOptions {
                    strategy: ImportStrategy::Upsert,
                    conflict_resolution: ConflictResolution::Merge,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.skipped_count, 1);
        assert_eq!(handle.get("a", &ctx).unwrap().unwrap().status, "Target");
    }

    #[test]
    fn test_field_merge_priorities() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let target = handle.create(&order("a", "Target", 100.0), &ctx).unwrap();
        let mut source = target.clone();
        source.status = "Source".to_string();
        source.total_amount = 5.0;

        let mut priorities = HashMap::new();
        priorities.insert("TotalAmount".to_string(), MergePriority::Target);

        let result = handle
            .import(
                &[source],
                &BulkImportOptions {
                    strategy: ImportStrategy::Upsert,
                    conflict_resolution: ConflictResolution::Merge,
                    field_merge_priorities: priorities,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();
        assert_eq!(result.success_count, 1);

        let merged = handle.get("a", &ctx).unwrap().unwrap();
        // Status fell back to source; TotalAmount obeyed the priority
        assert_eq!(merged.status, "Source");
        assert_eq!(merged.total_amount, 100.0);
    }

    #[test]
    fn test_manual_resolution_records_and_skips() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        handle.create(&order("a", "Target", 1.0), &ctx).unwrap();
        let mut source = order("a", "Other", 2.0);
        source.version = 999;

        let result = handle
            .import(
                &[source],
                &BulkImportOptions {
                    strategy: ImportStrategy::Upsert,
                    conflict_resolution: ConflictResolution::Manual,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.skipped_count, 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Version);
        assert_eq!(handle.get("a", &ctx).unwrap().unwrap().status, "Target");
    }

    #[test]
    fn test_replace_truncates_first() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        handle.create(&order("old", "Old", 1.0), &ctx).unwrap();
        let result = handle
            .import(
                &[order("new", "New", 2.0)],
                &BulkImportOptions {
                    strategy: ImportStrategy::Replace,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.success_count, 1);
        assert!(handle.get("old", &ctx).unwrap().is_none());
        assert!(handle.get("new", &ctx).unwrap().is_some());
    }

    #[test]
    fn test_preserve_version_chains_advances_ledger() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let mut chain: Vec<Order> = Vec::new();
        for (version, status) in [(50i64, "A"), (60, "B")] {
            let mut row = order("a", status, 1.0);
            row.version = version;
            chain.push(row);
        }

        let result = handle
            .import(
                &chain,
                &BulkImportOptions {
                    strategy: ImportStrategy::Replace,
                    preserve_version_chains: true,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();
        assert_eq!(result.success_count, 2);

        let head = handle.get("a", &ctx).unwrap().unwrap();
        assert_eq!(head.version, 60);
        assert_eq!(head.status, "B");

        // The next allocation must clear the imported versions
        let created = handle.create(&order("fresh", "New", 1.0), &ctx).unwrap();
        assert!(created.version > 60);
    }

    #[test]
    fn test_validate_before_import_rejects_bad_rows() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Product>().unwrap();
        let ctx = OpContext::new();

        let good = Product::new("p1", "ok", 1.0);
        let result = handle
            .import(
                &[good],
                &BulkImportOptions {
                    validate_before_import: true,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 0);
    }

    #[test]
    fn test_import_from_json_file() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let records: Vec<serde_json::Value> = [order("a", "New", 1.0), order("b", "New", 2.0)]
            .iter()
            .map(|o| serde_json::Value::Object(record_from_entity(Order::schema(), o)))
            .collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

        let result = handle
            .import_from_file(&path, &BulkImportOptions::default(), None, &ctx)
            .unwrap();
        assert_eq!(result.success_count, 2);
        assert!(handle.get("b", &ctx).unwrap().is_some());
    }

    #[test]
    fn test_import_from_csv_file() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        std::fs::write(&path, "Id,OrderNumber,Status,TotalAmount\na,ORD-a,New,1.5\n").unwrap();

        let result = handle
            .import_from_file(&path, &BulkImportOptions::default(), None, &ctx)
            .unwrap();
        assert_eq!(result.success_count, 1);
        assert_eq!(handle.get("a", &ctx).unwrap().unwrap().total_amount, 1.5);
    }

    #[test]
    fn test_import_from_gzip_file() {
        use flate2::Compression;
        use std::io::Write;

        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let records = vec![serde_json::Value::Object(record_from_entity(
            Order::schema(),
            &order("z", "New", 3.0),
        ))];
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&serde_json::to_vec(&records).unwrap())
            .unwrap();
        let compressed = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json.gz");
        std::fs::write(&path, compressed).unwrap();

        let result = handle
            .import_from_file(&path, &BulkImportOptions::default(), None, &ctx)
            .unwrap();
        assert_eq!(result.success_count, 1);
    }

    #[test]
    fn test_manifest_checksum_mismatch_imports_zero_rows() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        // Build an export, then corrupt the first data file
        for i in 0..3 {
            handle
                .create(&order(&format!("s{i}"), "New", i as f64), &ctx)
                .unwrap();
        }
        let out = tempfile::tempdir().unwrap();
        let export = handle
            .export(
                None,
                &super::super::BulkExportOptions {
                    export_folder: Some(out.path().to_path_buf()),
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();
        let manifest_path = export.manifest_path.unwrap();

        let data_file = &export.files[0];
        let mut bytes = std::fs::read(data_file).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(data_file, bytes).unwrap();

        let result = handle
            .import_from_file(
                &manifest_path,
                &BulkImportOptions {
                    strategy: ImportStrategy::Replace,
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.success_count, 0);
        assert!(result.errors.iter().any(|e| e.contains("Checksum mismatch")));
    }

    #[test]
    fn test_manifest_schema_version_mismatch_rejected() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        handle.create(&order("a", "New", 1.0), &ctx).unwrap();
        let out = tempfile::tempdir().unwrap();
        let export = handle
            .export(
                None,
                &super::super::BulkExportOptions {
                    export_folder: Some(out.path().to_path_buf()),
                    ..Default::default()
                },
                None,
                &ctx,
            )
            .unwrap();

        let result = handle.import_from_file(
            &export.manifest_path.unwrap(),
            &BulkImportOptions {
                expected_schema_version: Some("9.9".to_string()),
                ..Default::default()
            },
            None,
            &ctx,
        );
        assert!(matches!(result, Err(Error::Format(_))));
    }
}
