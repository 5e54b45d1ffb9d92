// src/schema/ddl.rs

//! DDL rendering and introspection
//!
//! Renders a compiled [`EntitySchema`] into `CREATE TABLE` and
//! `CREATE INDEX` statements, and rebuilds a schema model from a parsed
//! `CREATE TABLE` for diagnostics and import validation. All identifiers
//! are double-quoted so reserved words stay usable as table names.

use crate::error::{Error, Result};
use crate::sql;
use crate::sql::ast::{
    CreateTableStatement, Expr, InList, Literal, Statement, TableConstraint,
};

use super::{
    COL_CREATED, COL_EXPIRATION, COL_IS_ARCHIVED, COL_IS_DELETED, COL_LAST_WRITE, ColumnDef,
    EntitySchema, IndexDef, LogicalType, StorageType, TableFlags,
};

/// Render the CREATE TABLE statement for a schema
///
/// Includes NOT NULL flags, column defaults, enum `CHECK(col IN (...))`
/// table constraints, and the (possibly composite) primary key.
pub fn create_table_sql(schema: &EntitySchema) -> String {
    let mut parts: Vec<String> = Vec::new();

    for col in &schema.columns {
        let mut line = format!("\"{}\" {}", col.name, col.storage_type().sql_name());
        if !col.nullable {
            line.push_str(" NOT NULL");
        }
        if let Some(default_sql) = &col.default_sql {
            line.push_str(&format!(" DEFAULT {}", default_sql));
        }
        parts.push(line);
    }

    for col in &schema.columns {
        if let Some(values) = &col.check_values {
            let quoted: Vec<String> = values.iter().map(|v| format!("'{}'", escape(v))).collect();
            parts.push(format!(
                "CHECK(\"{}\" IN ({}))",
                col.name,
                quoted.join(", ")
            ));
        }
    }

    let pk: Vec<String> = schema
        .primary_key
        .iter()
        .map(|name| format!("\"{}\"", name))
        .collect();
    parts.push(format!("PRIMARY KEY ({})", pk.join(", ")));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        schema.qualified_table(),
        parts.join(",\n    ")
    )
}

/// Render one CREATE INDEX statement per index, ordered by index name
pub fn create_index_sql(schema: &EntitySchema) -> Vec<String> {
    let mut indexes: Vec<&IndexDef> = schema.indexes.iter().collect();
    indexes.sort_by(|a, b| a.name.cmp(&b.name));

    indexes
        .iter()
        .map(|idx| {
            let columns: Vec<String> = idx.columns.iter().map(|c| format!("\"{}\"", c)).collect();
            format!(
                "CREATE {}INDEX IF NOT EXISTS \"{}\" ON {} ({})",
                if idx.unique { "UNIQUE " } else { "" },
                idx.name,
                schema.qualified_table(),
                columns.join(", ")
            )
        })
        .collect()
}

/// Parse a CREATE TABLE statement and rebuild a schema model from it
///
/// Logical types are recovered from storage classes, with the engine's
/// base columns mapped back to their declared types. Feature flags are
/// inferred from the presence of their columns.
pub fn introspect(create_table: &str) -> Result<EntitySchema> {
    let statement = sql::parse(create_table)?;
    let Statement::CreateTable(table) = statement else {
        return Err(Error::ValidationFailed(
            "Expected a CREATE TABLE statement".to_string(),
        ));
    };
    schema_from_ast(&table)
}

fn schema_from_ast(table: &CreateTableStatement) -> Result<EntitySchema> {
    let mut primary_key: Vec<String> = Vec::new();
    let mut checks: Vec<(String, Vec<String>)> = Vec::new();

    for constraint in &table.constraints {
        match constraint {
            TableConstraint::PrimaryKey(columns) => primary_key = columns.clone(),
            TableConstraint::Check(expr) => {
                if let Some(check) = enum_check(expr) {
                    checks.push(check);
                }
            }
            _ => {}
        }
    }
    for col in &table.columns {
        if col.primary_key && !primary_key.contains(&col.name) {
            primary_key.push(col.name.clone());
        }
    }
    if primary_key.is_empty() {
        return Err(Error::ValidationFailed(format!(
            "Table '{}' declares no primary key",
            table.name
        )));
    }

    let mut columns = Vec::new();
    for col in &table.columns {
        let storage = match col.type_name.as_str() {
            "INTEGER" => StorageType::Integer,
            "REAL" => StorageType::Real,
            "TEXT" => StorageType::Text,
            "BLOB" => StorageType::Blob,
            other => {
                return Err(Error::ValidationFailed(format!(
                    "Unknown storage type '{}' on column '{}'",
                    other, col.name
                )));
            }
        };
        let logical_type = logical_for(&col.name, storage);
        let pk_order = primary_key.iter().position(|n| n == &col.name);
        let check_values = checks
            .iter()
            .find(|(name, _)| name == &col.name)
            .map(|(_, values)| values.clone());

        columns.push(ColumnDef {
            name: col.name.clone(),
            logical_type,
            nullable: !col.not_null,
            is_pk: pk_order.is_some(),
            pk_order: pk_order.unwrap_or(0),
            is_computed: false,
            check_values,
            default_sql: col.default_expr.as_ref().map(render_default),
        });
    }

    let flags = TableFlags {
        soft_delete: columns.iter().any(|c| c.name == COL_IS_DELETED),
        expiry: columns.iter().any(|c| c.name == COL_EXPIRATION),
        expiry_span: None,
        archive: columns.iter().any(|c| c.name == COL_IS_ARCHIVED),
        audit: false,
        sync_with_list: false,
    };

    Ok(EntitySchema {
        table_name: table.name.clone(),
        schema_prefix: None,
        columns,
        primary_key,
        indexes: Vec::new(),
        flags,
    })
}

/// Recover `(column, values)` from a `CHECK(col IN ('a', 'b'))` expression
fn enum_check(expr: &Expr) -> Option<(String, Vec<String>)> {
    let Expr::In {
        expr: target,
        list: InList::Values(values),
        negated: false,
    } = expr
    else {
        return None;
    };
    let Expr::Column { name, .. } = target.as_ref() else {
        return None;
    };
    let mut names = Vec::new();
    for value in values {
        match value {
            Expr::Literal(Literal::String(s)) => names.push(s.clone()),
            _ => return None,
        }
    }
    Some((name.clone(), names))
}

fn logical_for(name: &str, storage: StorageType) -> LogicalType {
    match name {
        COL_CREATED | COL_LAST_WRITE | COL_EXPIRATION => LogicalType::DateTime,
        COL_IS_DELETED | COL_IS_ARCHIVED => LogicalType::Boolean,
        _ => match storage {
            StorageType::Integer => LogicalType::Integer,
            StorageType::Real => LogicalType::Float,
            StorageType::Text => LogicalType::String,
            StorageType::Blob => LogicalType::Blob,
        },
    }
}

fn render_default(expr: &Expr) -> String {
    match expr {
        Expr::Literal(Literal::Null) => "NULL".to_string(),
        Expr::Literal(Literal::Integer(v)) => v.to_string(),
        Expr::Literal(Literal::Float(v)) => v.to_string(),
        Expr::Literal(Literal::String(s)) => format!("'{}'", escape(s)),
        Expr::Literal(Literal::Boolean(v)) => (*v as i64).to_string(),
        Expr::Function { name, args, .. } => {
            let rendered: Vec<String> = args.iter().map(render_default).collect();
            format!("({}({}))", name, rendered.join(", "))
        }
        Expr::Unary { expr, .. } => format!("-{}", render_default(expr)),
        _ => String::new(),
    }
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}
