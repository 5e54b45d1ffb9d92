// src/command.rs

//! Parameterized command construction
//!
//! The factory turns a [`CommandContext`] plus the entity schema into a
//! single [`SqlCommand`] ready to execute on a connection. Entities bind
//! their base properties through the [`Entity`] accessors and their user
//! columns through `column_value`; nothing is interpolated into SQL text.

use rusqlite::Connection;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::schema::{
    COL_CREATED, COL_EXPIRATION, COL_ID, COL_IS_ARCHIVED, COL_IS_DELETED, COL_LAST_WRITE,
    COL_VERSION, EntitySchema,
};
use crate::value::{Value, now};

/// Operation selector for the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    BatchInsert,
    Update,
    Delete,
    Select,
    Upsert,
    Merge,
}

/// Row-visibility options for key reads and queries
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    /// Return the whole version chain instead of only the head
    pub include_all_versions: bool,
    /// Include soft-deleted heads
    pub include_deleted: bool,
    /// Include rows past their `AbsoluteExpiration`
    pub include_expired: bool,
}

/// Inputs for building one command
pub struct CommandContext<'a, T: Entity> {
    pub operation: Operation,
    pub entity: Option<&'a T>,
    pub entities: &'a [T],
    /// Version read by the caller; enables the optimistic UPDATE guard
    pub old_version: Option<i64>,
    pub key: Option<&'a str>,
    pub select_options: SelectOptions,
}

impl<'a, T: Entity> CommandContext<'a, T> {
    fn base(operation: Operation) -> Self {
        Self {
            operation,
            entity: None,
            entities: &[],
            old_version: None,
            key: None,
            select_options: SelectOptions::default(),
        }
    }

    pub fn insert(entity: &'a T) -> Self {
        Self {
            entity: Some(entity),
            ..Self::base(Operation::Insert)
        }
    }

    pub fn batch_insert(entities: &'a [T]) -> Self {
        Self {
            entities,
            ..Self::base(Operation::BatchInsert)
        }
    }

    pub fn update(entity: &'a T, old_version: i64) -> Self {
        Self {
            entity: Some(entity),
            old_version: Some(old_version),
            ..Self::base(Operation::Update)
        }
    }

    pub fn delete(key: &'a str) -> Self {
        Self {
            key: Some(key),
            ..Self::base(Operation::Delete)
        }
    }

    pub fn select(key: &'a str, options: SelectOptions) -> Self {
        Self {
            key: Some(key),
            select_options: options,
            ..Self::base(Operation::Select)
        }
    }

    pub fn upsert(entity: &'a T) -> Self {
        Self {
            entity: Some(entity),
            ..Self::base(Operation::Upsert)
        }
    }

    pub fn merge(entity: &'a T) -> Self {
        Self {
            entity: Some(entity),
            ..Self::base(Operation::Merge)
        }
    }
}

/// A parameterized command ready to run on a connection
#[derive(Debug, Clone)]
pub struct SqlCommand {
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

impl SqlCommand {
    pub fn bind_args(&self) -> Vec<(&str, &dyn rusqlite::ToSql)> {
        self.params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql))
            .collect()
    }

    /// Execute as a non-query; returns rows affected
    pub fn execute(&self, conn: &Connection) -> Result<usize> {
        let mut stmt = conn.prepare(&self.sql)?;
        let affected = stmt.execute(self.bind_args().as_slice())?;
        Ok(affected)
    }

    /// Execute and read the first column of the first row, if any
    pub fn query_scalar(&self, conn: &Connection) -> Result<Option<Value>> {
        use rusqlite::OptionalExtension;
        let mut stmt = conn.prepare(&self.sql)?;
        let value = stmt
            .query_row(self.bind_args().as_slice(), |row| row.get::<_, Value>(0))
            .optional()?;
        Ok(value)
    }

    /// Execute and map every row through the entity's `from_row`
    pub fn query_entities<T: Entity>(&self, conn: &Connection) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(&self.sql)?;
        let rows = stmt
            .query_map(self.bind_args().as_slice(), T::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Build a command from a context and the entity's schema
pub fn build<T: Entity>(schema: &EntitySchema, ctx: &CommandContext<'_, T>) -> Result<SqlCommand> {
    match ctx.operation {
        Operation::Insert => {
            let entity = require_entity(ctx)?;
            Ok(insert_command(schema, std::slice::from_ref(entity), InsertMode::Plain))
        }
        Operation::BatchInsert => {
            if ctx.entities.is_empty() {
                return Err(Error::ValidationFailed(
                    "Batch insert requires at least one entity".to_string(),
                ));
            }
            Ok(insert_command(schema, ctx.entities, InsertMode::Plain))
        }
        Operation::Upsert => {
            let entity = require_entity(ctx)?;
            Ok(insert_command(schema, std::slice::from_ref(entity), InsertMode::Upsert))
        }
        Operation::Merge => {
            let entity = require_entity(ctx)?;
            Ok(insert_command(schema, std::slice::from_ref(entity), InsertMode::KeepExisting))
        }
        Operation::Update => update_command(schema, ctx),
        Operation::Delete => {
            let key = require_key(ctx)?;
            Ok(SqlCommand {
                sql: format!("DELETE FROM {} WHERE \"{}\" = @p0", schema.qualified_table(), COL_ID),
                params: vec![("@p0".to_string(), Value::Text(key.to_string()))],
            })
        }
        Operation::Select => select_command(schema, ctx),
    }
}

fn require_entity<'a, T: Entity>(ctx: &CommandContext<'a, T>) -> Result<&'a T> {
    ctx.entity.ok_or_else(|| {
        Error::ValidationFailed("Command context is missing its entity".to_string())
    })
}

fn require_key<'a, T: Entity>(ctx: &CommandContext<'a, T>) -> Result<&'a str> {
    ctx.key
        .ok_or_else(|| Error::ValidationFailed("Command context is missing its key".to_string()))
}

/// Value of any schema column for the given entity
pub fn bind_value<T: Entity>(entity: &T, column: &str) -> Value {
    match column {
        COL_ID => Value::Text(entity.key()),
        COL_VERSION => Value::I64(entity.version()),
        COL_CREATED => Value::Timestamp(entity.created_time()),
        COL_LAST_WRITE => Value::Timestamp(entity.last_write_time()),
        COL_IS_DELETED => Value::Bool(entity.is_deleted()),
        COL_EXPIRATION => entity
            .absolute_expiration()
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        COL_IS_ARCHIVED => Value::Bool(entity.is_archived()),
        other => entity.column_value(other),
    }
}

enum InsertMode {
    Plain,
    Upsert,
    KeepExisting,
}

fn insert_command<T: Entity>(
    schema: &EntitySchema,
    entities: &[T],
    mode: InsertMode,
) -> SqlCommand {
    let columns = schema.insert_columns();
    let column_list: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();

    let mut params = Vec::new();
    let mut rows = Vec::new();
    for entity in entities {
        let mut placeholders = Vec::new();
        for column in &columns {
            let name = format!("@p{}", params.len());
            params.push((name.clone(), bind_value(entity, column)));
            placeholders.push(name);
        }
        rows.push(format!("({})", placeholders.join(", ")));
    }

    let verb = match mode {
        InsertMode::KeepExisting => "INSERT OR IGNORE INTO",
        _ => "INSERT INTO",
    };
    let mut sql = format!(
        "{} {} ({}) VALUES {}",
        verb,
        schema.qualified_table(),
        column_list.join(", "),
        rows.join(", ")
    );

    if let InsertMode::Upsert = mode {
        let conflict_target: Vec<String> = schema
            .primary_key
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        let assignments: Vec<String> = schema
            .update_columns()
            .iter()
            .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
            .collect();
        sql.push_str(&format!(
            " ON CONFLICT({}) DO UPDATE SET {}",
            conflict_target.join(", "),
            assignments.join(", ")
        ));
    }

    SqlCommand { sql, params }
}

fn update_command<T: Entity>(
    schema: &EntitySchema,
    ctx: &CommandContext<'_, T>,
) -> Result<SqlCommand> {
    let entity = require_entity(ctx)?;

    let mut params = Vec::new();
    let mut assignments = Vec::new();
    for column in schema.update_columns() {
        let name = format!("@p{}", params.len());
        params.push((name.clone(), bind_value(entity, column)));
        assignments.push(format!("\"{}\" = {}", column, name));
    }

    let key_param = format!("@p{}", params.len());
    params.push((key_param.clone(), Value::Text(entity.key())));
    let mut sql = format!(
        "UPDATE {} SET {} WHERE \"{}\" = {}",
        schema.qualified_table(),
        assignments.join(", "),
        COL_ID,
        key_param
    );

    if let Some(old_version) = ctx.old_version {
        let version_param = format!("@p{}", params.len());
        params.push((version_param.clone(), Value::I64(old_version)));
        sql.push_str(&format!(" AND \"{}\" = {}", COL_VERSION, version_param));
    }

    Ok(SqlCommand { sql, params })
}

fn select_command<T: Entity>(
    schema: &EntitySchema,
    ctx: &CommandContext<'_, T>,
) -> Result<SqlCommand> {
    let key = require_key(ctx)?;
    let options = ctx.select_options;
    let columns: Vec<String> = schema
        .select_columns()
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect();
    let column_list = columns.join(", ");

    let mut params = vec![("@p0".to_string(), Value::Text(key.to_string()))];
    let mut filters = Vec::new();
    if schema.flags.soft_delete && !options.include_deleted {
        filters.push(format!("\"{}\" = 0", COL_IS_DELETED));
    }
    if schema.flags.expiry && !options.include_expired {
        let now_param = format!("@p{}", params.len());
        params.push((now_param.clone(), Value::Timestamp(now())));
        filters.push(format!(
            "(\"{col}\" IS NULL OR datetime(\"{col}\") > datetime({param}))",
            col = COL_EXPIRATION,
            param = now_param
        ));
    }

    let sql = if options.include_all_versions {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE \"{}\" = @p0",
            column_list,
            schema.qualified_table(),
            COL_ID
        );
        for filter in &filters {
            sql.push_str(&format!(" AND {}", filter));
        }
        sql.push_str(&format!(" ORDER BY \"{}\" ASC", COL_VERSION));
        sql
    } else {
        // Head filters apply outside the CTE: a deleted or expired head
        // must yield no row rather than fall back to an older version
        let mut sql = format!(
            "WITH LatestVersions AS (
    SELECT *, ROW_NUMBER() OVER (PARTITION BY \"{id}\" ORDER BY \"{version}\" DESC) AS rn
    FROM {table}
    WHERE \"{id}\" = @p0
)
SELECT {columns} FROM LatestVersions WHERE rn = 1",
            id = COL_ID,
            version = COL_VERSION,
            table = schema.qualified_table(),
            columns = column_list
        );
        for filter in &filters {
            sql.push_str(&format!(" AND {}", filter));
        }
        sql
    };

    Ok(SqlCommand { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LogicalType, SchemaBuilder};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: String,
        version: i64,
        created_time: DateTime<Utc>,
        last_write_time: DateTime<Utc>,
        is_deleted: bool,
        name: String,
        weight: f64,
    }

    impl Widget {
        fn new(id: &str, name: &str) -> Self {
            let t = crate::value::now();
            Self {
                id: id.to_string(),
                version: 0,
                created_time: t,
                last_write_time: t,
                is_deleted: false,
                name: name.to_string(),
                weight: 1.5,
            }
        }
    }

    impl Entity for Widget {
        fn entity_type() -> &'static str {
            "Widget"
        }

        fn schema() -> &'static EntitySchema {
            static SCHEMA: OnceLock<EntitySchema> = OnceLock::new();
            SCHEMA.get_or_init(|| {
                SchemaBuilder::new("Widgets")
                    .soft_delete()
                    .column("Name", LogicalType::String)
                    .column("Weight", LogicalType::Float)
                    .build()
                    .expect("widget schema")
            })
        }

        fn key(&self) -> String {
            self.id.clone()
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }

        fn created_time(&self) -> DateTime<Utc> {
            self.created_time
        }

        fn set_created_time(&mut self, t: DateTime<Utc>) {
            self.created_time = t;
        }

        fn last_write_time(&self) -> DateTime<Utc> {
            self.last_write_time
        }

        fn set_last_write_time(&mut self, t: DateTime<Utc>) {
            self.last_write_time = t;
        }

        fn is_deleted(&self) -> bool {
            self.is_deleted
        }

        fn set_is_deleted(&mut self, deleted: bool) {
            self.is_deleted = deleted;
        }

        fn column_value(&self, column: &str) -> Value {
            match column {
                "Name" => Value::from(self.name.as_str()),
                "Weight" => Value::from(self.weight),
                other => panic!("unknown column {other}"),
            }
        }

        fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
            Ok(Self {
                id: row.get(0)?,
                version: row.get(1)?,
                created_time: crate::value::parse_timestamp(&row.get::<_, String>(2)?)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        format!("{e}").into(),
                    ))?,
                last_write_time: crate::value::parse_timestamp(&row.get::<_, String>(3)?)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        format!("{e}").into(),
                    ))?,
                is_deleted: row.get::<_, i64>(4)? != 0,
                name: row.get(5)?,
                weight: row.get(6)?,
            })
        }

        fn from_values(values: &crate::value::ValueMap) -> crate::error::Result<Self> {
            Ok(Self {
                id: values.text("Id"),
                version: values.i64("Version"),
                created_time: values.timestamp("CreatedTime"),
                last_write_time: values.timestamp("LastWriteTime"),
                is_deleted: values.bool("IsDeleted"),
                name: values.text("Name"),
                weight: values.f64("Weight"),
            })
        }
    }

    fn widget_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            &crate::schema::ddl::create_table_sql(Widget::schema()),
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_round_trip() {
        let conn = widget_conn();
        let mut widget = Widget::new("w1", "anchor");
        widget.set_version(7);

        let insert = build(Widget::schema(), &CommandContext::insert(&widget)).unwrap();
        assert_eq!(insert.execute(&conn).unwrap(), 1);

        let select = build(
            Widget::schema(),
            &CommandContext::<Widget>::select("w1", SelectOptions::default()),
        )
        .unwrap();
        let rows: Vec<Widget> = select.query_entities(&conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "anchor");
        assert_eq!(rows[0].version, 7);
    }

    #[test]
    fn test_select_latest_version_only() {
        let conn = widget_conn();
        for version in [1i64, 3, 5] {
            let mut widget = Widget::new("w1", &format!("rev{version}"));
            widget.set_version(version);
            build(Widget::schema(), &CommandContext::insert(&widget))
                .unwrap()
                .execute(&conn)
                .unwrap();
        }

        let head: Vec<Widget> = build(
            Widget::schema(),
            &CommandContext::<Widget>::select("w1", SelectOptions::default()),
        )
        .unwrap()
        .query_entities(&conn)
        .unwrap();
        assert_eq!(head.len(), 1);
        assert_eq!(head[0].version, 5);

        let all: Vec<Widget> = build(
            Widget::schema(),
            &CommandContext::<Widget>::select(
                "w1",
                SelectOptions {
                    include_all_versions: true,
                    ..Default::default()
                },
            ),
        )
        .unwrap()
        .query_entities(&conn)
        .unwrap();
        assert_eq!(
            all.iter().map(|w| w.version).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );
    }

    #[test]
    fn test_deleted_head_hides_row() {
        let conn = widget_conn();
        let mut live = Widget::new("w1", "live");
        live.set_version(1);
        build(Widget::schema(), &CommandContext::insert(&live))
            .unwrap()
            .execute(&conn)
            .unwrap();

        let mut tombstone = Widget::new("w1", "gone");
        tombstone.set_version(2);
        tombstone.set_is_deleted(true);
        build(Widget::schema(), &CommandContext::insert(&tombstone))
            .unwrap()
            .execute(&conn)
            .unwrap();

        let visible: Vec<Widget> = build(
            Widget::schema(),
            &CommandContext::<Widget>::select("w1", SelectOptions::default()),
        )
        .unwrap()
        .query_entities(&conn)
        .unwrap();
        // The deleted head hides the key entirely; older live versions do
        // not resurface
        assert!(visible.is_empty());

        let with_deleted: Vec<Widget> = build(
            Widget::schema(),
            &CommandContext::<Widget>::select(
                "w1",
                SelectOptions {
                    include_deleted: true,
                    ..Default::default()
                },
            ),
        )
        .unwrap()
        .query_entities(&conn)
        .unwrap();
        assert_eq!(with_deleted.len(), 1);
        assert!(with_deleted[0].is_deleted);
    }

    #[test]
    fn test_update_with_optimistic_guard() {
        let conn = widget_conn();
        let mut widget = Widget::new("w1", "v1");
        widget.set_version(1);
        build(Widget::schema(), &CommandContext::insert(&widget))
            .unwrap()
            .execute(&conn)
            .unwrap();

        let mut changed = widget.clone();
        changed.name = "v2".to_string();
        changed.set_version(2);

        let stale = build(Widget::schema(), &CommandContext::update(&changed, 99)).unwrap();
        assert_eq!(stale.execute(&conn).unwrap(), 0);

        let fresh = build(Widget::schema(), &CommandContext::update(&changed, 1)).unwrap();
        assert_eq!(fresh.execute(&conn).unwrap(), 1);
    }

    #[test]
    fn test_batch_insert_binds_every_row() {
        let conn = widget_conn();
        let widgets: Vec<Widget> = (0..3)
            .map(|i| {
                let mut w = Widget::new(&format!("w{i}"), "bulk");
                w.set_version(i + 1);
                w
            })
            .collect();
        let command = build(
            Widget::schema(),
            &CommandContext::batch_insert(&widgets),
        )
        .unwrap();
        assert_eq!(command.execute(&conn).unwrap(), 3);
        assert_eq!(
            command.params.len(),
            Widget::schema().insert_columns().len() * 3
        );
    }

    #[test]
    fn test_upsert_overwrites_same_pk() {
        let conn = widget_conn();
        let mut widget = Widget::new("w1", "first");
        widget.set_version(1);
        build(Widget::schema(), &CommandContext::insert(&widget))
            .unwrap()
            .execute(&conn)
            .unwrap();

        widget.name = "second".to_string();
        build(Widget::schema(), &CommandContext::upsert(&widget))
            .unwrap()
            .execute(&conn)
            .unwrap();

        let rows: Vec<Widget> = build(
            Widget::schema(),
            &CommandContext::<Widget>::select("w1", SelectOptions::default()),
        )
        .unwrap()
        .query_entities(&conn)
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "second");
    }

    #[test]
    fn test_merge_keeps_existing() {
        let conn = widget_conn();
        let mut widget = Widget::new("w1", "first");
        widget.set_version(1);
        build(Widget::schema(), &CommandContext::insert(&widget))
            .unwrap()
            .execute(&conn)
            .unwrap();

        widget.name = "ignored".to_string();
        let affected = build(Widget::schema(), &CommandContext::merge(&widget))
            .unwrap()
            .execute(&conn)
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn test_delete_removes_chain() {
        let conn = widget_conn();
        for version in [1i64, 2] {
            let mut w = Widget::new("w1", "x");
            w.set_version(version);
            build(Widget::schema(), &CommandContext::insert(&w))
                .unwrap()
                .execute(&conn)
                .unwrap();
        }
        let delete = build(Widget::schema(), &CommandContext::<Widget>::delete("w1")).unwrap();
        assert_eq!(delete.execute(&conn).unwrap(), 2);
    }
}
