// src/value.rs

//! Tagged value union used for parameter binding and column reads
//!
//! Parameters travel through the engine as [`Value`] instances and convert
//! to SQLite types at the boundary. Timestamps are stored as ISO-8601
//! strings in UTC with seven fractional digits and an explicit offset so
//! that SQLite's `datetime()` can normalize them for comparisons.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use rusqlite::ToSql;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};

use crate::error::{Error, Result};

/// A parameter or column value in transit between entities and the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Whether this value is the SQL NULL marker
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Interpret the value as an i64 where the storage class allows it
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Interpret the value as text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as a timestamp, parsing stored text if needed
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            Value::Text(s) => parse_timestamp(s).ok(),
            _ => None,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*b as i64)),
            Value::I64(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Value::F64(v) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*v)),
            Value::Text(s) => ToSqlOutput::Owned(rusqlite::types::Value::Text(s.clone())),
            Value::Blob(b) => ToSqlOutput::Owned(rusqlite::types::Value::Blob(b.clone())),
            Value::Timestamp(t) => {
                ToSqlOutput::Owned(rusqlite::types::Value::Text(format_timestamp(*t)))
            }
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::I64(v),
            ValueRef::Real(v) => Value::F64(v),
            ValueRef::Text(s) => Value::Text(
                std::str::from_utf8(s)
                    .map_err(|e| FromSqlError::Other(Box::new(e)))?
                    .to_string(),
            ),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => Value::from(inner),
            None => Value::Null,
        }
    }
}

/// Render a timestamp as an ISO-8601 round-trip string in UTC
///
/// Seven fractional digits with an explicit `+00:00` offset, e.g.
/// `2024-03-01T08:15:30.1234567+00:00`. Offset inputs must be converted
/// to UTC before encoding.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}+00:00",
        t.format("%Y-%m-%dT%H:%M:%S"),
        t.nanosecond() / 100
    )
}

/// Parse a stored timestamp string back into UTC
///
/// Accepts the round-trip format written by [`format_timestamp`], any
/// RFC 3339 string, and SQLite's own `datetime('now')` rendering.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(Error::Format(format!("Invalid timestamp: {}", s)))
}

/// Current time in UTC
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Column-keyed values decoded from an import record
///
/// Accessors fall back to the type's zero value when a column is absent
/// or null, matching the CSV contract: unknown headers are ignored and
/// missing fields default to type-zero.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    values: std::collections::HashMap<String, Value>,
}

impl ValueMap {
    pub fn new(values: std::collections::HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, column: &str, value: Value) {
        self.values.insert(column.to_string(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn text(&self, column: &str) -> String {
        match self.values.get(column) {
            Some(Value::Text(s)) => s.clone(),
            Some(Value::I64(v)) => v.to_string(),
            Some(Value::F64(v)) => v.to_string(),
            _ => String::new(),
        }
    }

    pub fn i64(&self, column: &str) -> i64 {
        match self.values.get(column) {
            Some(Value::I64(v)) => *v,
            Some(Value::Bool(b)) => *b as i64,
            Some(Value::F64(v)) => *v as i64,
            Some(Value::Text(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn f64(&self, column: &str) -> f64 {
        match self.values.get(column) {
            Some(Value::F64(v)) => *v,
            Some(Value::I64(v)) => *v as f64,
            Some(Value::Text(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn bool(&self, column: &str) -> bool {
        match self.values.get(column) {
            Some(Value::Bool(b)) => *b,
            Some(Value::I64(v)) => *v != 0,
            Some(Value::Text(s)) => s == "true" || s == "1",
            _ => false,
        }
    }

    pub fn timestamp(&self, column: &str) -> DateTime<Utc> {
        self.timestamp_opt(column)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn timestamp_opt(&self, column: &str) -> Option<DateTime<Utc>> {
        match self.values.get(column) {
            Some(Value::Timestamp(t)) => Some(*t),
            Some(Value::Text(s)) => parse_timestamp(s).ok(),
            _ => None,
        }
    }
}

/// Read a stored timestamp column from a result row
pub fn read_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("{e}").into(),
        )
    })
}

/// Read a nullable stored timestamp column from a result row
pub fn read_timestamp_opt(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(text) => parse_timestamp(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("{e}").into(),
            )
        }),
    }
}
