// src/schema/mod.rs

//! Entity schema metadata
//!
//! This module compiles a declarative entity description into an immutable
//! [`EntitySchema`]: ordered column definitions, primary key, indexes, and
//! per-table feature flags. Schemas are built once at provider-open time
//! (typically inside a `OnceLock`) and registered in a process-wide
//! registry keyed by entity type name.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use chrono::Duration;

use crate::error::{Error, Result};

pub mod ddl;

/// Base column: logical key
pub const COL_ID: &str = "Id";
/// Base column: row version
pub const COL_VERSION: &str = "Version";
/// Base column: first-write timestamp
pub const COL_CREATED: &str = "CreatedTime";
/// Base column: last-write timestamp
pub const COL_LAST_WRITE: &str = "LastWriteTime";
/// Flag column: soft-delete marker
pub const COL_IS_DELETED: &str = "IsDeleted";
/// Flag column: expiry deadline
pub const COL_EXPIRATION: &str = "AbsoluteExpiration";
/// Flag column: archive marker
pub const COL_IS_ARCHIVED: &str = "IsArchived";
/// Additive column stamped by archive exports
pub const COL_EXPORTED_DATE: &str = "ExportedDate";

/// Logical (client-side) column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Integer,
    Float,
    Decimal,
    Boolean,
    String,
    Guid,
    DateTime,
    /// Stored as integer ticks
    TimeOfDay,
    Blob,
}

/// SQLite storage class a logical type maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Integer,
    Real,
    Text,
    Blob,
}

impl LogicalType {
    /// Explicit logical-to-storage mapping
    pub fn storage(self) -> StorageType {
        match self {
            LogicalType::Integer | LogicalType::Boolean | LogicalType::TimeOfDay => {
                StorageType::Integer
            }
            LogicalType::Float | LogicalType::Decimal => StorageType::Real,
            LogicalType::String | LogicalType::Guid | LogicalType::DateTime => StorageType::Text,
            LogicalType::Blob => StorageType::Blob,
        }
    }
}

impl StorageType {
    pub fn sql_name(self) -> &'static str {
        match self {
            StorageType::Integer => "INTEGER",
            StorageType::Real => "REAL",
            StorageType::Text => "TEXT",
            StorageType::Blob => "BLOB",
        }
    }
}

/// One column of an entity table
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    pub is_pk: bool,
    /// Position within a composite primary key; meaningful when `is_pk`
    pub pk_order: usize,
    /// Computed columns are never written by INSERT or UPDATE
    pub is_computed: bool,
    /// Enum-valued columns emit `CHECK(col IN (...))`
    pub check_values: Option<Vec<String>>,
    /// Literal SQL default expression
    pub default_sql: Option<String>,
}

impl ColumnDef {
    pub fn storage_type(&self) -> StorageType {
        self.logical_type.storage()
    }
}

/// A secondary index on an entity table
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Per-table feature flags
#[derive(Debug, Clone, Default)]
pub struct TableFlags {
    /// Deletes append an `IsDeleted=true` version instead of removing rows
    pub soft_delete: bool,
    /// Rows carry an optional `AbsoluteExpiration` deadline
    pub expiry: bool,
    /// Default expiry span stamped onto created rows
    pub expiry_span: Option<Duration>,
    /// Rows carry an `IsArchived` marker
    pub archive: bool,
    /// Every CRUD effect appends an audit record
    pub audit: bool,
    /// Entities participate in list-association operations
    pub sync_with_list: bool,
}

/// Immutable compiled schema for one entity type
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub table_name: String,
    pub schema_prefix: Option<String>,
    pub columns: Vec<ColumnDef>,
    /// Ordered primary key column names (composite under soft-delete)
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexDef>,
    pub flags: TableFlags,
}

impl EntitySchema {
    /// Table name with optional schema prefix, quoted for SQL
    pub fn qualified_table(&self) -> String {
        match &self.schema_prefix {
            Some(prefix) => format!("\"{}\".\"{}\"", prefix, self.table_name),
            None => format!("\"{}\"", self.table_name),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Whether a column stores ISO-8601 timestamps (affects SQL rendering)
    pub fn is_timestamp_column(&self, name: &str) -> bool {
        self.column(name)
            .map(|c| c.logical_type == LogicalType::DateTime)
            .unwrap_or(false)
    }

    /// Column names in canonical select order
    pub fn select_columns(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns written by INSERT: everything except computed columns
    pub fn insert_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.is_computed)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Columns written by UPDATE: non-key, non-computed
    pub fn update_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.is_pk && !c.is_computed)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// User columns: everything past the base and flag columns
    pub fn user_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| {
                !matches!(
                    c.name.as_str(),
                    COL_ID
                        | COL_VERSION
                        | COL_CREATED
                        | COL_LAST_WRITE
                        | COL_IS_DELETED
                        | COL_EXPIRATION
                        | COL_IS_ARCHIVED
                )
            })
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Declarative schema construction
///
/// Base properties (`Id`, `Version`, `CreatedTime`, `LastWriteTime`) and
/// flag-gated columns are added automatically; callers declare user
/// columns, indexes, and feature flags.
pub struct SchemaBuilder {
    table_name: String,
    schema_prefix: Option<String>,
    key_type: LogicalType,
    user_columns: Vec<ColumnDef>,
    indexes: Vec<IndexDef>,
    flags: TableFlags,
}

impl SchemaBuilder {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            schema_prefix: None,
            key_type: LogicalType::String,
            user_columns: Vec::new(),
            indexes: Vec::new(),
            flags: TableFlags::default(),
        }
    }

    pub fn schema_prefix(mut self, prefix: &str) -> Self {
        self.schema_prefix = Some(prefix.to_string());
        self
    }

    /// Logical type of the `Id` column (defaults to `String`)
    pub fn key_type(mut self, logical_type: LogicalType) -> Self {
        self.key_type = logical_type;
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.flags.soft_delete = true;
        self
    }

    pub fn expiry(mut self, span: Option<Duration>) -> Self {
        self.flags.expiry = true;
        self.flags.expiry_span = span;
        self
    }

    pub fn archive(mut self) -> Self {
        self.flags.archive = true;
        self
    }

    pub fn audit(mut self) -> Self {
        self.flags.audit = true;
        self
    }

    pub fn sync_with_list(mut self) -> Self {
        self.flags.sync_with_list = true;
        self
    }

    /// Add a NOT NULL user column
    pub fn column(mut self, name: &str, logical_type: LogicalType) -> Self {
        self.user_columns.push(ColumnDef {
            name: name.to_string(),
            logical_type,
            nullable: false,
            is_pk: false,
            pk_order: 0,
            is_computed: false,
            check_values: None,
            default_sql: None,
        });
        self
    }

    /// Add a nullable user column
    pub fn nullable_column(mut self, name: &str, logical_type: LogicalType) -> Self {
        self.user_columns.push(ColumnDef {
            name: name.to_string(),
            logical_type,
            nullable: true,
            is_pk: false,
            pk_order: 0,
            is_computed: false,
            check_values: None,
            default_sql: None,
        });
        self
    }

    /// Restrict the most recently added column to an enum's value names
    pub fn check_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(last) = self.user_columns.last_mut() {
            last.check_values = Some(values.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Mark the most recently added column as computed (never written)
    pub fn computed(mut self) -> Self {
        if let Some(last) = self.user_columns.last_mut() {
            last.is_computed = true;
        }
        self
    }

    /// Literal SQL default for the most recently added column
    pub fn default_sql(mut self, sql: &str) -> Self {
        if let Some(last) = self.user_columns.last_mut() {
            last.default_sql = Some(sql.to_string());
        }
        self
    }

    pub fn index(mut self, name: &str, columns: &[&str], unique: bool) -> Self {
        self.indexes.push(IndexDef {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        });
        self
    }

    /// Validate and compile the schema
    pub fn build(self) -> Result<EntitySchema> {
        if self.table_name.is_empty() || !is_identifier(&self.table_name) {
            return Err(Error::ValidationFailed(format!(
                "Invalid table name: '{}'",
                self.table_name
            )));
        }

        let mut columns = Vec::new();

        columns.push(ColumnDef {
            name: COL_ID.to_string(),
            logical_type: self.key_type,
            nullable: false,
            is_pk: true,
            pk_order: 0,
            is_computed: false,
            check_values: None,
            default_sql: None,
        });
        columns.push(ColumnDef {
            name: COL_VERSION.to_string(),
            logical_type: LogicalType::Integer,
            nullable: false,
            is_pk: self.flags.soft_delete,
            pk_order: 1,
            is_computed: false,
            check_values: None,
            default_sql: None,
        });
        columns.push(ColumnDef {
            name: COL_CREATED.to_string(),
            logical_type: LogicalType::DateTime,
            nullable: false,
            is_pk: false,
            pk_order: 0,
            is_computed: false,
            check_values: None,
            default_sql: None,
        });
        columns.push(ColumnDef {
            name: COL_LAST_WRITE.to_string(),
            logical_type: LogicalType::DateTime,
            nullable: false,
            is_pk: false,
            pk_order: 0,
            is_computed: false,
            check_values: None,
            default_sql: None,
        });

        if self.flags.soft_delete {
            columns.push(ColumnDef {
                name: COL_IS_DELETED.to_string(),
                logical_type: LogicalType::Boolean,
                nullable: false,
                is_pk: false,
                pk_order: 0,
                is_computed: false,
                check_values: None,
                default_sql: Some("0".to_string()),
            });
        }
        if self.flags.expiry {
            columns.push(ColumnDef {
                name: COL_EXPIRATION.to_string(),
                logical_type: LogicalType::DateTime,
                nullable: true,
                is_pk: false,
                pk_order: 0,
                is_computed: false,
                check_values: None,
                default_sql: None,
            });
        }
        if self.flags.archive {
            columns.push(ColumnDef {
                name: COL_IS_ARCHIVED.to_string(),
                logical_type: LogicalType::Boolean,
                nullable: false,
                is_pk: false,
                pk_order: 0,
                is_computed: false,
                check_values: None,
                default_sql: Some("0".to_string()),
            });
        }

        for col in &self.user_columns {
            if !is_identifier(&col.name) {
                return Err(Error::ValidationFailed(format!(
                    "Invalid column name: '{}'",
                    col.name
                )));
            }
            if columns.iter().any(|c| c.name == col.name) {
                return Err(Error::ValidationFailed(format!(
                    "Duplicate column: '{}'",
                    col.name
                )));
            }
            if col.check_values.is_some() && col.storage_type() != StorageType::Text {
                return Err(Error::ValidationFailed(format!(
                    "Check values require a text column: '{}'",
                    col.name
                )));
            }
            columns.push(col.clone());
        }

        for idx in &self.indexes {
            for idx_col in &idx.columns {
                if !columns.iter().any(|c| &c.name == idx_col) {
                    return Err(Error::ValidationFailed(format!(
                        "Index '{}' references unknown column '{}'",
                        idx.name, idx_col
                    )));
                }
            }
        }

        let mut pk: Vec<&ColumnDef> = columns.iter().filter(|c| c.is_pk).collect();
        pk.sort_by_key(|c| c.pk_order);
        let primary_key: Vec<String> = pk.iter().map(|c| c.name.clone()).collect();

        Ok(EntitySchema {
            table_name: self.table_name,
            schema_prefix: self.schema_prefix,
            columns,
            primary_key,
            indexes: self.indexes,
            flags: self.flags,
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Process-wide schema registry keyed by entity type name
fn registry() -> &'static Mutex<HashMap<&'static str, &'static EntitySchema>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, &'static EntitySchema>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a compiled schema under its entity type name. Idempotent.
pub fn register(entity_type: &'static str, schema: &'static EntitySchema) {
    if let Ok(mut map) = registry().lock() {
        map.entry(entity_type).or_insert(schema);
    }
}

/// Look up a registered schema by entity type name
pub fn lookup(entity_type: &str) -> Option<&'static EntitySchema> {
    registry().lock().ok().and_then(|map| map.get(entity_type).copied())
}
