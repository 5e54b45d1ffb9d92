// src/query/translate.rs

//! Compile predicate trees into parameterized SQL fragments
//!
//! The translator walks a [`Filter`] tree and emits a WHERE fragment plus
//! its parameters, allocating fresh names `@p0, @p1, ...` as it descends.
//! Timestamp columns and timestamp parameters are wrapped in `datetime()`
//! so SQLite compares them in a normalized form; timestamps are encoded as
//! ISO-8601 UTC strings before binding.

use crate::error::{Error, Result};
use crate::filter::{BinaryOp, Filter, OrderBy, StringFunction, UnaryOp};
use crate::schema::EntitySchema;
use crate::value::Value;

/// A SQL fragment plus the parameters it references
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

impl SqlFragment {
    /// Parameter slice in the form rusqlite expects for named binding
    pub fn bind_args(&self) -> Vec<(&str, &dyn rusqlite::ToSql)> {
        self.params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql))
            .collect()
    }
}

/// Translate a predicate tree into a WHERE fragment
pub fn translate_where(schema: &EntitySchema, filter: &Filter) -> Result<SqlFragment> {
    let mut translator = Translator {
        schema,
        params: Vec::new(),
        counter: 0,
    };
    let sql = translator.walk(filter)?;
    Ok(SqlFragment {
        sql,
        params: translator.params,
    })
}

/// Render an ORDER BY clause body from ordering keys, in declared order
pub fn translate_order_by(schema: &EntitySchema, order: &[OrderBy]) -> Result<String> {
    let mut parts = Vec::new();
    for key in order {
        if !schema.has_column(&key.column) {
            return Err(Error::ValidationFailed(format!(
                "Unknown order-by column: '{}'",
                key.column
            )));
        }
        parts.push(format!(
            "\"{}\" {}",
            key.column,
            if key.descending { "DESC" } else { "ASC" }
        ));
    }
    Ok(parts.join(", "))
}

struct Translator<'a> {
    schema: &'a EntitySchema,
    params: Vec<(String, Value)>,
    counter: usize,
}

impl Translator<'_> {
    fn walk(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::Column(name) => self.column(name),
            Filter::Literal(value) => Ok(self.parameter(value.clone())),
            Filter::Binary { op, left, right } => self.binary(*op, left, right),
            Filter::Unary {
                op: UnaryOp::Not,
                expr,
            } => {
                let inner = self.walk(expr)?;
                Ok(format!("(NOT {})", inner))
            }
            Filter::Call { function, args } => self.call(*function, args),
            Filter::In { column, values } => self.in_values(column, values),
            Filter::Between { column, low, high } => self.between(column, low, high),
            Filter::IsNull { column, negated } => {
                let rendered = self.column(column)?;
                Ok(format!(
                    "({} IS {}NULL)",
                    rendered,
                    if *negated { "NOT " } else { "" }
                ))
            }
        }
    }

    fn column(&self, name: &str) -> Result<String> {
        if !self.schema.has_column(name) {
            return Err(Error::ValidationFailed(format!(
                "Unknown column in predicate: '{}'",
                name
            )));
        }
        if self.schema.is_timestamp_column(name) {
            Ok(format!("datetime(\"{}\")", name))
        } else {
            Ok(format!("\"{}\"", name))
        }
    }

    /// Append a parameter with a fresh name; timestamps get `datetime()`
    fn parameter(&mut self, value: Value) -> String {
        let name = format!("@p{}", self.counter);
        self.counter += 1;
        let wrapped = matches!(value, Value::Timestamp(_));
        self.params.push((name.clone(), value));
        if wrapped {
            format!("datetime({})", name)
        } else {
            name
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Filter, right: &Filter) -> Result<String> {
        // x == null lowers to IS NULL, x != null to IS NOT NULL
        if matches!(op, BinaryOp::Eq | BinaryOp::NotEq) {
            let null_test = match (left, right) {
                (other, Filter::Literal(Value::Null)) => Some(other),
                (Filter::Literal(Value::Null), other) => Some(other),
                _ => None,
            };
            if let Some(target) = null_test {
                let rendered = self.walk(target)?;
                return Ok(format!(
                    "({} IS {}NULL)",
                    rendered,
                    if op == BinaryOp::NotEq { "NOT " } else { "" }
                ));
            }
        }

        let left_sql = self.walk(left)?;
        let right_sql = self.walk(right)?;
        let op_sql = match op {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        };
        Ok(format!("({} {} {})", left_sql, op_sql, right_sql))
    }

    fn call(&mut self, function: StringFunction, args: &[Filter]) -> Result<String> {
        let [Filter::Column(column), Filter::Literal(Value::Text(pattern))] = args else {
            return Err(Error::ValidationFailed(
                "String predicates take a column and a text pattern".to_string(),
            ));
        };
        if !self.schema.has_column(column) {
            return Err(Error::ValidationFailed(format!(
                "Unknown column in predicate: '{}'",
                column
            )));
        }
        let like_pattern = match function {
            StringFunction::StartsWith => format!("{}%", pattern),
            StringFunction::EndsWith => format!("%{}", pattern),
            StringFunction::Contains => format!("%{}%", pattern),
        };
        let param = self.parameter(Value::Text(like_pattern));
        Ok(format!("(\"{}\" LIKE {})", column, param))
    }

    fn in_values(&mut self, column: &str, values: &[Value]) -> Result<String> {
        let rendered = self.column(column)?;
        if values.is_empty() {
            // IN over an empty set matches nothing
            return Ok("(1 = 0)".to_string());
        }
        let params: Vec<String> = values
            .iter()
            .map(|v| self.parameter(v.clone()))
            .collect();
        Ok(format!("({} IN ({}))", rendered, params.join(", ")))
    }

    fn between(&mut self, column: &str, low: &Value, high: &Value) -> Result<String> {
        let rendered = self.column(column)?;
        let low_param = self.parameter(low.clone());
        let high_param = self.parameter(high.clone());
        Ok(format!(
            "({} BETWEEN {} AND {})",
            rendered, low_param, high_param
        ))
    }
}
