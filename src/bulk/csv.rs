// src/bulk/csv.rs

//! Minimal CSV codec for bulk data files
//!
//! Honors the configurable delimiter, quote character, header row, and
//! date format. Quoted fields may contain the delimiter, doubled quotes,
//! and newlines. Unknown headers are ignored on import; missing fields
//! fall back to type-zero through [`ValueMap`].

use chrono::TimeZone;

use crate::command::bind_value;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::schema::{EntitySchema, LogicalType};
use crate::value::{Value, ValueMap, parse_timestamp};

/// CSV rendering and parsing options
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub delimiter: char,
    pub has_headers: bool,
    pub quote: char,
    pub skip_empty_rows: bool,
    /// chrono format string for timestamp fields
    pub date_format: String,
    pub trim_fields: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            has_headers: true,
            quote: '"',
            skip_empty_rows: true,
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
            trim_fields: true,
        }
    }
}

/// Render entities as CSV in canonical column order
pub(crate) fn render<T: Entity>(
    schema: &EntitySchema,
    entities: &[T],
    options: &CsvOptions,
) -> String {
    let columns = schema.select_columns();
    let mut out = String::new();

    if options.has_headers {
        let header: Vec<String> = columns
            .iter()
            .map(|c| quote_field(c, options))
            .collect();
        out.push_str(&header.join(&options.delimiter.to_string()));
        out.push('\n');
    }

    for entity in entities {
        let fields: Vec<String> = columns
            .iter()
            .map(|column| {
                let rendered = render_value(&bind_value(entity, column), options);
                quote_field(&rendered, options)
            })
            .collect();
        out.push_str(&fields.join(&options.delimiter.to_string()));
        out.push('\n');
    }
    out
}

fn render_value(value: &Value, options: &CsvOptions) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::I64(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => super::hex_encode(b),
        Value::Timestamp(t) => t.format(&options.date_format).to_string(),
    }
}

fn quote_field(field: &str, options: &CsvOptions) -> String {
    let needs_quoting = field.contains(options.delimiter)
        || field.contains(options.quote)
        || field.contains('\n')
        || field.contains('\r');
    if needs_quoting {
        let doubled = field.replace(
            options.quote,
            &format!("{}{}", options.quote, options.quote),
        );
        format!("{}{}{}", options.quote, doubled, options.quote)
    } else {
        field.to_string()
    }
}

/// Parse CSV content into column-keyed value maps
///
/// With headers, fields map by header name; without, fields map by the
/// schema's canonical column order.
pub(crate) fn parse(
    schema: &EntitySchema,
    content: &str,
    options: &CsvOptions,
) -> Result<Vec<ValueMap>> {
    let mut rows = split_rows(content, options)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let columns: Vec<String> = if options.has_headers {
        let header = rows.remove(0);
        header
            .into_iter()
            .map(|field| {
                if options.trim_fields {
                    field.trim().to_string()
                } else {
                    field
                }
            })
            .collect()
    } else {
        schema
            .select_columns()
            .iter()
            .map(|c| c.to_string())
            .collect()
    };

    let mut maps = Vec::with_capacity(rows.len());
    for row in rows {
        if options.skip_empty_rows && row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let mut values = ValueMap::default();
        for (index, raw) in row.into_iter().enumerate() {
            let Some(column_name) = columns.get(index) else {
                break;
            };
            // Unknown headers are ignored
            let Some(column) = schema.column(column_name) else {
                continue;
            };
            let field = if options.trim_fields {
                raw.trim().to_string()
            } else {
                raw
            };
            values.insert(column_name, parse_field(&field, column.logical_type, options));
        }
        maps.push(values);
    }
    Ok(maps)
}

fn parse_field(field: &str, logical_type: LogicalType, options: &CsvOptions) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    match logical_type {
        LogicalType::Integer | LogicalType::TimeOfDay => {
            field.parse::<i64>().map(Value::I64).unwrap_or(Value::Null)
        }
        LogicalType::Float | LogicalType::Decimal => {
            field.parse::<f64>().map(Value::F64).unwrap_or(Value::Null)
        }
        LogicalType::Boolean => Value::Bool(field == "true" || field == "1"),
        LogicalType::DateTime => {
            if let Ok(naive) =
                chrono::NaiveDateTime::parse_from_str(field, &options.date_format)
            {
                Value::Timestamp(chrono::Utc.from_utc_datetime(&naive))
            } else if let Ok(t) = parse_timestamp(field) {
                Value::Timestamp(t)
            } else {
                Value::Null
            }
        }
        LogicalType::Blob => super::hex_decode(field)
            .map(Value::Blob)
            .unwrap_or(Value::Null),
        LogicalType::String | LogicalType::Guid => Value::Text(field.to_string()),
    }
}

/// Split content into rows of fields, honoring quoted fields
fn split_rows(content: &str, options: &CsvOptions) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();
    let mut saw_any = false;

    while let Some(c) = chars.next() {
        saw_any = true;
        if in_quotes {
            if c == options.quote {
                if chars.peek() == Some(&options.quote) {
                    chars.next();
                    field.push(options.quote);
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == options.quote {
            in_quotes = true;
        } else if c == options.delimiter {
            row.push(std::mem::take(&mut field));
        } else if c == '\n' || c == '\r' {
            if c == '\r' && chars.peek() == Some(&'\n') {
                chars.next();
            }
            row.push(std::mem::take(&mut field));
            rows.push(std::mem::take(&mut row));
        } else {
            field.push(c);
        }
    }
    if in_quotes {
        return Err(Error::Format("Unterminated quoted CSV field".to_string()));
    }
    if saw_any && (!field.is_empty() || !row.is_empty()) {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}
