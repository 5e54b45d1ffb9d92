// src/sql/token.rs

//! Token set for the restricted SQL dialect

/// A token with its source position (1-based line and column)
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

/// Fixed token kinds emitted by the lexer
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Select,
    From,
    Where,
    With,
    As,
    Distinct,
    Join,
    Inner,
    Left,
    Right,
    Full,
    Cross,
    Outer,
    On,
    Group,
    By,
    Having,
    Order,
    Asc,
    Desc,
    Limit,
    Offset,
    Create,
    Table,
    Index,
    Unique,
    If,
    Not,
    Exists,
    Primary,
    Key,
    Autoincrement,
    Default,
    Check,
    References,
    Foreign,
    Constraint,
    Null,
    In,
    Between,
    Like,
    Is,
    And,
    Or,
    Case,
    When,
    Then,
    Else,
    End,
    Over,
    Partition,

    // Operators
    Equal,              // =
    NotEqual,           // != or <>
    LessThan,           // <
    LessThanOrEqual,    // <=
    GreaterThan,        // >
    GreaterThanOrEqual, // >=
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Punctuation
    LeftParen,
    RightParen,
    Comma,
    Dot,
    Semicolon,

    // Literals
    IntegerLit(i64),
    FloatLit(f64),
    StringLit(String),
    BooleanLit(bool),

    /// Named parameter placeholder such as `@p0` or `:name`
    Parameter(String),

    /// Bare or double-quoted identifier
    Identifier(String),

    /// End of input
    Eof,
}

impl TokenKind {
    /// Map an uppercased bare identifier onto its keyword token, if any
    pub fn keyword(upper: &str) -> Option<TokenKind> {
        let kind = match upper {
            "SELECT" => TokenKind::Select,
            "FROM" => TokenKind::From,
            "WHERE" => TokenKind::Where,
            "WITH" => TokenKind::With,
            "AS" => TokenKind::As,
            "DISTINCT" => TokenKind::Distinct,
            "JOIN" => TokenKind::Join,
            "INNER" => TokenKind::Inner,
            "LEFT" => TokenKind::Left,
            "RIGHT" => TokenKind::Right,
            "FULL" => TokenKind::Full,
            "CROSS" => TokenKind::Cross,
            "OUTER" => TokenKind::Outer,
            "ON" => TokenKind::On,
            "GROUP" => TokenKind::Group,
            "BY" => TokenKind::By,
            "HAVING" => TokenKind::Having,
            "ORDER" => TokenKind::Order,
            "ASC" => TokenKind::Asc,
            "DESC" => TokenKind::Desc,
            "LIMIT" => TokenKind::Limit,
            "OFFSET" => TokenKind::Offset,
            "CREATE" => TokenKind::Create,
            "TABLE" => TokenKind::Table,
            "INDEX" => TokenKind::Index,
            "UNIQUE" => TokenKind::Unique,
            "IF" => TokenKind::If,
            "NOT" => TokenKind::Not,
            "EXISTS" => TokenKind::Exists,
            "PRIMARY" => TokenKind::Primary,
            "KEY" => TokenKind::Key,
            "AUTOINCREMENT" => TokenKind::Autoincrement,
            "DEFAULT" => TokenKind::Default,
            "CHECK" => TokenKind::Check,
            "REFERENCES" => TokenKind::References,
            "FOREIGN" => TokenKind::Foreign,
            "CONSTRAINT" => TokenKind::Constraint,
            "NULL" => TokenKind::Null,
            "IN" => TokenKind::In,
            "BETWEEN" => TokenKind::Between,
            "LIKE" => TokenKind::Like,
            "IS" => TokenKind::Is,
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "CASE" => TokenKind::Case,
            "WHEN" => TokenKind::When,
            "THEN" => TokenKind::Then,
            "ELSE" => TokenKind::Else,
            "END" => TokenKind::End,
            "OVER" => TokenKind::Over,
            "PARTITION" => TokenKind::Partition,
            "TRUE" => TokenKind::BooleanLit(true),
            "FALSE" => TokenKind::BooleanLit(false),
            _ => return None,
        };
        Some(kind)
    }

    /// Short description used in parser error messages
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{}'", name),
            TokenKind::StringLit(_) => "string literal".to_string(),
            TokenKind::IntegerLit(v) => format!("integer {}", v),
            TokenKind::FloatLit(v) => format!("number {}", v),
            TokenKind::BooleanLit(v) => format!("boolean {}", v),
            TokenKind::Parameter(name) => format!("parameter '{}'", name),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("{:?}", other).to_uppercase(),
        }
    }
}
