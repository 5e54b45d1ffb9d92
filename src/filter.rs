// src/filter.rs

//! Abstract predicate and ordering trees
//!
//! Callers describe query predicates as a small expression tree instead of
//! raw SQL; the translator in [`crate::query`] compiles the tree to a
//! parameterized WHERE fragment. Trees are built programmatically through
//! the helpers here, e.g.
//! `col("Status").eq("New").and(col("TotalAmount").gt(10.0))`.

use crate::value::Value;

/// A predicate expression over one entity type
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Reference to a schema column
    Column(String),
    /// Constant, parameterized at translation time
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<Filter>,
        right: Box<Filter>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Filter>,
    },
    /// String method call; `args[0]` is the column, `args[1]` the pattern
    Call {
        function: StringFunction,
        args: Vec<Filter>,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    IsNull {
        column: String,
        negated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
}

/// String predicates translated to LIKE patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFunction {
    StartsWith,
    EndsWith,
    Contains,
}

/// One ORDER BY key
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Ascending order on a column
pub fn asc(column: &str) -> OrderBy {
    OrderBy {
        column: column.to_string(),
        descending: false,
    }
}

/// Descending order on a column
pub fn desc(column: &str) -> OrderBy {
    OrderBy {
        column: column.to_string(),
        descending: true,
    }
}

/// Start a predicate from a column reference
pub fn col(name: &str) -> Filter {
    Filter::Column(name.to_string())
}

/// Negate a predicate
pub fn not(expr: Filter) -> Filter {
    Filter::Unary {
        op: UnaryOp::Not,
        expr: Box::new(expr),
    }
}

impl Filter {
    fn binary(self, op: BinaryOp, right: Filter) -> Filter {
        Filter::Binary {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Filter {
        self.binary(BinaryOp::Eq, Filter::Literal(value.into()))
    }

    pub fn ne(self, value: impl Into<Value>) -> Filter {
        self.binary(BinaryOp::NotEq, Filter::Literal(value.into()))
    }

    pub fn lt(self, value: impl Into<Value>) -> Filter {
        self.binary(BinaryOp::Lt, Filter::Literal(value.into()))
    }

    pub fn lte(self, value: impl Into<Value>) -> Filter {
        self.binary(BinaryOp::LtEq, Filter::Literal(value.into()))
    }

    pub fn gt(self, value: impl Into<Value>) -> Filter {
        self.binary(BinaryOp::Gt, Filter::Literal(value.into()))
    }

    pub fn gte(self, value: impl Into<Value>) -> Filter {
        self.binary(BinaryOp::GtEq, Filter::Literal(value.into()))
    }

    pub fn and(self, other: Filter) -> Filter {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: Filter) -> Filter {
        self.binary(BinaryOp::Or, other)
    }

    fn call(self, function: StringFunction, pattern: &str) -> Filter {
        Filter::Call {
            function,
            args: vec![self, Filter::Literal(Value::from(pattern))],
        }
    }

    pub fn starts_with(self, pattern: &str) -> Filter {
        self.call(StringFunction::StartsWith, pattern)
    }

    pub fn ends_with(self, pattern: &str) -> Filter {
        self.call(StringFunction::EndsWith, pattern)
    }

    pub fn contains(self, pattern: &str) -> Filter {
        self.call(StringFunction::Contains, pattern)
    }

    /// `column IN (values...)`; only valid on a column reference
    pub fn in_values<I, V>(self, values: I) -> Filter
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let column = self.column_name();
        Filter::In {
            column,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `column BETWEEN low AND high`; only valid on a column reference
    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Filter {
        Filter::Between {
            column: self.column_name(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn is_null(self) -> Filter {
        Filter::IsNull {
            column: self.column_name(),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Filter {
        Filter::IsNull {
            column: self.column_name(),
            negated: true,
        }
    }

    fn column_name(self) -> String {
        match self {
            Filter::Column(name) => name,
            other => panic!("expected a column reference, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_shapes() {
        let filter = col("Status").eq("New").and(col("TotalAmount").gt(10.0));
        let Filter::Binary {
            op: BinaryOp::And,
            left,
            right,
        } = filter
        else {
            panic!("expected AND at the top");
        };
        assert!(matches!(
            *left,
            Filter::Binary {
                op: BinaryOp::Eq,
                ..
            }
        ));
        assert!(matches!(
            *right,
            Filter::Binary {
                op: BinaryOp::Gt,
                ..
            }
        ));
    }

    #[test]
    fn test_string_calls() {
        let filter = col("Name").starts_with("ab");
        let Filter::Call { function, args } = filter else {
            panic!("expected a call");
        };
        assert_eq!(function, StringFunction::StartsWith);
        assert_eq!(args[0], Filter::Column("Name".to_string()));
        assert_eq!(args[1], Filter::Literal(Value::from("ab")));
    }

    #[test]
    fn test_in_between_null() {
        assert_eq!(
            col("Status").in_values(["A", "B"]),
            Filter::In {
                column: "Status".to_string(),
                values: vec![Value::from("A"), Value::from("B")],
            }
        );
        assert!(matches!(
            col("TotalAmount").between(1.0, 2.0),
            Filter::Between { .. }
        ));
        assert!(matches!(
            col("Notes").is_null(),
            Filter::IsNull { negated: false, .. }
        ));
    }

    #[test]
    fn test_null_literal_comparison() {
        let filter = col("Notes").eq(None::<String>);
        assert!(matches!(
            filter,
            Filter::Binary {
                op: BinaryOp::Eq,
                ..
            }
        ));
    }

    #[test]
    fn test_order_helpers() {
        assert!(!asc("Name").descending);
        assert!(desc("Version").descending);
    }
}
