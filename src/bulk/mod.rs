// src/bulk/mod.rs

//! Bulk import, export, and purge
//!
//! Data files carry entities as column-keyed records (schema column
//! names, not Rust field names), so exported files are self-describing
//! and a CSV and a JSON file agree on their vocabulary. Checksums are
//! SHA-256 over the exact bytes on disk, hex-encoded uppercase.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::value::{Value, ValueMap, format_timestamp};

pub mod csv;
pub mod export;
pub mod import;
pub mod purge;

/// Assumed on-disk footprint per row for space estimates
pub(crate) const ESTIMATED_ROW_BYTES: u64 = 1024;

/// Manifest schema version written by this engine
pub(crate) const MANIFEST_SCHEMA_VERSION: &str = "1.0";

/// Progress callback payload, fired every 100 rows and per chunk
#[derive(Debug, Clone, Copy)]
pub struct BulkProgress {
    pub processed: usize,
    pub total: usize,
    pub elapsed: Duration,
}

/// Progress observer shared by the bulk operations
pub type ProgressFn<'a> = &'a (dyn Fn(BulkProgress) + Send + Sync);

// ---- import types --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStrategy {
    /// Truncate the table, then insert everything
    Replace,
    /// Keep existing rows; only new keys are inserted
    Merge,
    /// Insert new keys, update existing ones per conflict resolution
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    UseSource,
    UseTarget,
    /// Newer `LastWriteTime` wins; field priorities refine it
    Merge,
    /// Record the conflict and skip the row
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    Version,
    Data,
}

/// Per-field winner for `ConflictResolution::Merge`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePriority {
    Source,
    Target,
}

#[derive(Debug, Clone)]
pub struct BulkImportOptions {
    pub batch_size: usize,
    pub strategy: ImportStrategy,
    pub conflict_resolution: ConflictResolution,
    pub validate_before_import: bool,
    /// Keep source `Version`/`CreatedTime` values verbatim and advance
    /// the ledger past the maximum imported version
    pub preserve_version_chains: bool,
    pub expected_schema_version: Option<String>,
    pub csv: csv::CsvOptions,
    /// Per-column winners for merge resolution; unlisted columns fall
    /// back to the source
    pub field_merge_priorities: HashMap<String, MergePriority>,
    pub timeout: Option<Duration>,
}

impl Default for BulkImportOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            strategy: ImportStrategy::Upsert,
            conflict_resolution: ConflictResolution::UseSource,
            validate_before_import: false,
            preserve_version_chains: false,
            expected_schema_version: None,
            csv: csv::CsvOptions::default(),
            field_merge_priorities: HashMap::new(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConflict {
    pub key: String,
    pub conflict_type: ConflictType,
    pub resolution: ConflictResolution,
    pub source_version: i64,
    pub target_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ImportStatistics {
    pub duration: Duration,
    pub entities_per_second: f64,
    pub batches: usize,
}

#[derive(Debug, Default)]
pub struct BulkImportResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub conflicts: Vec<ImportConflict>,
    pub statistics: ImportStatistics,
    pub errors: Vec<String>,
    pub metadata: HashMap<String, String>,
}

// ---- export types --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Full,
    /// Rows written since `from_date`
    Incremental,
    /// Rows untouched for `older_than`, optionally stamped as exported
    Archive,
}

impl ExportMode {
    fn manifest_name(self) -> &'static str {
        match self {
            ExportMode::Full => "Full",
            ExportMode::Incremental => "Incremental",
            ExportMode::Archive => "Archive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone)]
pub struct BulkExportOptions {
    pub batch_size: usize,
    pub mode: ExportMode,
    pub from_date: Option<DateTime<Utc>>,
    pub older_than: Option<chrono::Duration>,
    pub include_deleted: bool,
    pub include_expired: bool,
    pub include_all_versions: bool,
    /// When set, chunked data files plus metadata and manifest are
    /// written here; otherwise entities are returned in memory
    pub export_folder: Option<PathBuf>,
    /// Defaults to the entity type name when empty
    pub file_prefix: String,
    pub format: ExportFormat,
    pub compress: bool,
    /// Archive mode: stamp `ExportedDate` on every exported row
    pub mark_as_exported: bool,
    pub csv: csv::CsvOptions,
}

impl Default for BulkExportOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            mode: ExportMode::Full,
            from_date: None,
            older_than: None,
            include_deleted: false,
            include_expired: false,
            include_all_versions: false,
            export_folder: None,
            file_prefix: String::new(),
            format: ExportFormat::Json,
            compress: false,
            mark_as_exported: false,
            csv: csv::CsvOptions::default(),
        }
    }
}

/// Manifest entry for one data file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFileEntry {
    pub file_name: String,
    pub file_size_bytes: i64,
    pub entity_count: i32,
    /// SHA-256 of the bytes on disk, hex uppercase, no separators
    pub checksum: String,
    pub is_compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub schema_version: String,
    pub export_timestamp: String,
    pub entity_type: String,
    pub entity_count: i64,
    pub soft_delete_enabled: bool,
    pub export_mode: String,
    pub filter_criteria: String,
    #[serde(default)]
    pub additional_properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatistics {
    pub total_entities_processed: i64,
    pub total_versions_exported: i64,
    pub deleted_entities_included: i64,
    pub total_file_size_bytes: i64,
    pub compression_ratio: f64,
}

/// Export manifest: metadata plus the data file inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    pub metadata: ExportMetadata,
    pub statistics: ExportStatistics,
    pub data_files: Vec<DataFileEntry>,
}

#[derive(Debug)]
pub struct BulkExportResult<T> {
    pub entity_count: i64,
    /// Populated when no export folder was configured
    pub entities: Option<Vec<T>>,
    pub files: Vec<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub total_bytes: u64,
    pub duration: Duration,
}

// ---- purge types ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStrategy {
    /// Rows past their `AbsoluteExpiration` (requires expiry)
    PurgeExpired,
    /// Tombstone rows only (requires soft-delete)
    PurgeDeletedOnly,
    /// Whole chains with a deleted head, plus non-head rows of live
    /// chains (requires soft-delete)
    PreserveActiveVersions,
    /// Every row matching the WHERE
    PurgeAllOldVersions,
}

#[derive(Debug, Clone)]
pub struct PurgeOptions {
    pub strategy: PurgeStrategy,
    /// Preview only; nothing is deleted
    pub safe_mode: bool,
    pub max_samples: usize,
    pub backup_before_purge: bool,
    /// Parent directory for the backup staging folder
    pub backup_folder: Option<PathBuf>,
    pub use_transaction: bool,
    /// REINDEX and VACUUM after a successful purge
    pub optimize_storage: bool,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            strategy: PurgeStrategy::PurgeAllOldVersions,
            safe_mode: true,
            max_samples: 10,
            backup_before_purge: false,
            backup_folder: None,
            use_transaction: true,
            optimize_storage: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PurgePreview {
    pub affected_entity_count: i64,
    pub affected_version_count: i64,
    pub sample_entities: Vec<String>,
    pub estimated_space_to_reclaim: u64,
    /// Row counts by state within the delete set
    pub stats_by_state: HashMap<String, i64>,
}

#[derive(Debug, Clone)]
pub struct PurgeBackup {
    pub folder: PathBuf,
    pub files: usize,
    pub manifest: Option<PathBuf>,
}

/// Summary stamped on the audit trail for a destructive purge
#[derive(Debug, Clone)]
pub struct PurgeAudit {
    pub strategy: PurgeStrategy,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PurgeResult {
    pub entities_purged: i64,
    pub versions_purged: i64,
    pub space_reclaimed: u64,
    pub duration: Duration,
    pub preview: Option<PurgePreview>,
    pub backup: Option<PurgeBackup>,
    pub errors: Vec<String>,
    pub aborted: bool,
    pub audit: Option<PurgeAudit>,
    /// Orphaned list mappings removed alongside the rows
    pub list_mappings_cleaned: i64,
}

// ---- shared helpers ------------------------------------------------------

/// SHA-256 of a byte slice, hex-encoded uppercase without separators
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:X}", hasher.finalize())
}

/// Column-keyed JSON record for one entity
pub(crate) fn record_from_entity<T: Entity>(
    schema: &EntitySchema,
    entity: &T,
) -> serde_json::Map<String, serde_json::Value> {
    let mut record = serde_json::Map::new();
    for column in schema.select_columns() {
        let value = crate::command::bind_value(entity, column);
        record.insert(column.to_string(), json_from_value(&value));
    }
    record
}

pub(crate) fn json_from_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I64(v) => serde_json::Value::Number((*v).into()),
        Value::F64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::String(hex_encode(b)),
        Value::Timestamp(t) => serde_json::Value::String(format_timestamp(*t)),
    }
}

/// Decode a column-keyed JSON record into typed values using the schema
///
/// Unknown keys are ignored; values convert by the column's logical type.
pub(crate) fn value_map_from_record(
    schema: &EntitySchema,
    record: &serde_json::Map<String, serde_json::Value>,
) -> ValueMap {
    use crate::schema::LogicalType;

    let mut values = ValueMap::default();
    for (key, json) in record {
        let Some(column) = schema.column(key) else {
            continue;
        };
        let value = match (column.logical_type, json) {
            (_, serde_json::Value::Null) => Value::Null,
            (LogicalType::Boolean, serde_json::Value::Bool(b)) => Value::Bool(*b),
            (LogicalType::Boolean, serde_json::Value::Number(n)) => {
                Value::Bool(n.as_i64().unwrap_or(0) != 0)
            }
            (LogicalType::Integer | LogicalType::TimeOfDay, serde_json::Value::Number(n)) => {
                Value::I64(n.as_i64().unwrap_or(0))
            }
            (LogicalType::Float | LogicalType::Decimal, serde_json::Value::Number(n)) => {
                Value::F64(n.as_f64().unwrap_or(0.0))
            }
            (LogicalType::DateTime, serde_json::Value::String(s)) => {
                match crate::value::parse_timestamp(s) {
                    Ok(t) => Value::Timestamp(t),
                    Err(_) => Value::Null,
                }
            }
            (LogicalType::Blob, serde_json::Value::String(s)) => {
                Value::Blob(hex_decode(s).unwrap_or_default())
            }
            (_, serde_json::Value::String(s)) => Value::Text(s.clone()),
            (_, serde_json::Value::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    Value::I64(v)
                } else {
                    Value::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            (_, other) => Value::Text(other.to_string()),
        };
        values.insert(key, value);
    }
    values
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

pub(crate) fn hex_decode(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(Error::Format("Odd-length hex string".to_string()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| Error::Format(format!("Invalid hex byte at {}", i)))
        })
        .collect()
}

/// Detected payload format of an import file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileFormat {
    Json,
    Csv,
}

/// JSON if the content starts with `{` or `[`; CSV if the first
/// non-empty line contains commas or tabs; JSON otherwise
pub(crate) fn detect_format(content: &str) -> FileFormat {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return FileFormat::Json;
    }
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.contains(',') || line.contains('\t') {
            return FileFormat::Csv;
        }
        break;
    }
    FileFormat::Json
}
