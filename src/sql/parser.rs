// src/sql/parser.rs

//! Recursive-descent parser for the restricted SQL dialect
//!
//! Precedence, loosest to tightest: OR, AND, NOT, comparison
//! (=, !=, <, >, <=, >=, LIKE, IN, BETWEEN, IS), additive, multiplicative,
//! unary, primary. On failure the parser reports a message with the source
//! position of the offending token; it never guesses.

use crate::error::{Error, Result};

use super::ast::*;
use super::lexer::tokenize;
use super::token::{Token, TokenKind};

/// Parse a single statement
pub fn parse(sql: &str) -> Result<Statement> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.statement()?;
    parser.consume_if(&TokenKind::Semicolon);
    parser.expect_eof()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_ahead(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error_here(&self, message: impl Into<String>) -> Error {
        let token = self.peek();
        Error::SqlParse {
            message: message.into(),
            line: token.line,
            column: token.column,
        }
    }

    fn consume_if(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.peek_kind() == &kind {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!(
                "Expected {}, found {}",
                kind.describe(),
                self.peek_kind().describe()
            )))
        }
    }

    fn expect_eof(&mut self) -> Result<()> {
        if self.peek_kind() == &TokenKind::Eof {
            Ok(())
        } else {
            Err(self.error_here(format!(
                "Unexpected trailing {}",
                self.peek_kind().describe()
            )))
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!("Expected identifier, found {}", other.describe()))),
        }
    }

    // ---- statements ------------------------------------------------------

    fn statement(&mut self) -> Result<Statement> {
        match self.peek_kind() {
            TokenKind::Select | TokenKind::With => Ok(Statement::Select(self.select_statement()?)),
            TokenKind::Create => self.create_statement(),
            other => Err(self.error_here(format!(
                "Expected SELECT, WITH, or CREATE, found {}",
                other.describe()
            ))),
        }
    }

    fn select_statement(&mut self) -> Result<SelectStatement> {
        let mut ctes = Vec::new();
        if self.consume_if(&TokenKind::With) {
            loop {
                let name = self.identifier()?;
                self.expect(TokenKind::As)?;
                self.expect(TokenKind::LeftParen)?;
                let query = self.select_statement()?;
                self.expect(TokenKind::RightParen)?;
                ctes.push(CommonTableExpr { name, query });
                if !self.consume_if(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(TokenKind::Select)?;
        let distinct = self.consume_if(&TokenKind::Distinct);

        let mut projection = Vec::new();
        loop {
            if self.consume_if(&TokenKind::Star) {
                projection.push(SelectItem::Wildcard);
            } else {
                let expr = self.expr()?;
                let alias = self.alias()?;
                projection.push(SelectItem::Expr { expr, alias });
            }
            if !self.consume_if(&TokenKind::Comma) {
                break;
            }
        }

        let mut from = None;
        let mut joins = Vec::new();
        if self.consume_if(&TokenKind::From) {
            from = Some(self.table_factor()?);
            while let Some(kind) = self.join_kind()? {
                let table = self.table_factor()?;
                let on = if kind == JoinKind::Cross {
                    None
                } else {
                    self.expect(TokenKind::On)?;
                    Some(self.expr()?)
                };
                joins.push(Join { kind, table, on });
            }
        }

        let where_clause = if self.consume_if(&TokenKind::Where) {
            Some(self.expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.consume_if(&TokenKind::Group) {
            self.expect(TokenKind::By)?;
            loop {
                group_by.push(self.expr()?);
                if !self.consume_if(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let having = if self.consume_if(&TokenKind::Having) {
            Some(self.expr()?)
        } else {
            None
        };

        let order_by = if self.consume_if(&TokenKind::Order) {
            self.expect(TokenKind::By)?;
            self.order_exprs()?
        } else {
            Vec::new()
        };

        let mut limit = None;
        let mut offset = None;
        if self.consume_if(&TokenKind::Limit) {
            limit = Some(self.expr()?);
            if self.consume_if(&TokenKind::Offset) {
                offset = Some(self.expr()?);
            }
        }

        Ok(SelectStatement {
            ctes,
            distinct,
            projection,
            from,
            joins,
            where_clause,
            group_by,
            having,
            order_by,
            limit,
            offset,
        })
    }

    fn join_kind(&mut self) -> Result<Option<JoinKind>> {
        let kind = match self.peek_kind() {
            TokenKind::Join => {
                self.advance();
                JoinKind::Inner
            }
            TokenKind::Inner => {
                self.advance();
                self.expect(TokenKind::Join)?;
                JoinKind::Inner
            }
            TokenKind::Left => {
                self.advance();
                self.consume_if(&TokenKind::Outer);
                self.expect(TokenKind::Join)?;
                JoinKind::Left
            }
            TokenKind::Right => {
                self.advance();
                self.consume_if(&TokenKind::Outer);
                self.expect(TokenKind::Join)?;
                JoinKind::Right
            }
            TokenKind::Full => {
                self.advance();
                self.consume_if(&TokenKind::Outer);
                self.expect(TokenKind::Join)?;
                JoinKind::Full
            }
            TokenKind::Cross => {
                self.advance();
                self.expect(TokenKind::Join)?;
                JoinKind::Cross
            }
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }

    fn table_factor(&mut self) -> Result<TableFactor> {
        if self.consume_if(&TokenKind::LeftParen) {
            let query = self.select_statement()?;
            self.expect(TokenKind::RightParen)?;
            let alias = self.alias()?;
            return Ok(TableFactor::Derived {
                query: Box::new(query),
                alias,
            });
        }
        let name = self.identifier()?;
        let alias = self.alias()?;
        Ok(TableFactor::Table { name, alias })
    }

    /// Optional `AS alias` or bare alias identifier
    fn alias(&mut self) -> Result<Option<String>> {
        if self.consume_if(&TokenKind::As) {
            return Ok(Some(self.identifier()?));
        }
        if let TokenKind::Identifier(name) = self.peek_kind().clone() {
            self.advance();
            return Ok(Some(name));
        }
        Ok(None)
    }

    fn order_exprs(&mut self) -> Result<Vec<OrderExpr>> {
        let mut items = Vec::new();
        loop {
            let expr = self.expr()?;
            let descending = if self.consume_if(&TokenKind::Desc) {
                true
            } else {
                self.consume_if(&TokenKind::Asc);
                false
            };
            items.push(OrderExpr { expr, descending });
            if !self.consume_if(&TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }

    // ---- expressions -----------------------------------------------------

    fn expr(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.consume_if(&TokenKind::Or) {
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        while self.consume_if(&TokenKind::And) {
            let right = self.not_expr()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.consume_if(&TokenKind::Not) {
            let inner = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(inner),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.additive()?;

        let op = match self.peek_kind() {
            TokenKind::Equal => Some(BinaryOp::Eq),
            TokenKind::NotEqual => Some(BinaryOp::NotEq),
            TokenKind::LessThan => Some(BinaryOp::Lt),
            TokenKind::LessThanOrEqual => Some(BinaryOp::LtEq),
            TokenKind::GreaterThan => Some(BinaryOp::Gt),
            TokenKind::GreaterThanOrEqual => Some(BinaryOp::GtEq),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.additive()?;
            return Ok(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }

        // NOT LIKE / NOT IN / NOT BETWEEN
        let negated = matches!(self.peek_kind(), TokenKind::Not)
            && matches!(
                self.peek_ahead(1),
                TokenKind::Like | TokenKind::In | TokenKind::Between
            );
        if negated {
            self.advance();
        }

        match self.peek_kind() {
            TokenKind::Like => {
                self.advance();
                let pattern = self.additive()?;
                Ok(Expr::Like {
                    expr: Box::new(left),
                    pattern: Box::new(pattern),
                    negated,
                })
            }
            TokenKind::In => {
                self.advance();
                self.expect(TokenKind::LeftParen)?;
                let list = if matches!(self.peek_kind(), TokenKind::Select | TokenKind::With) {
                    InList::Subquery(Box::new(self.select_statement()?))
                } else {
                    let mut values = Vec::new();
                    loop {
                        values.push(self.expr()?);
                        if !self.consume_if(&TokenKind::Comma) {
                            break;
                        }
                    }
                    InList::Values(values)
                };
                self.expect(TokenKind::RightParen)?;
                Ok(Expr::In {
                    expr: Box::new(left),
                    list,
                    negated,
                })
            }
            TokenKind::Between => {
                self.advance();
                let low = self.additive()?;
                self.expect(TokenKind::And)?;
                let high = self.additive()?;
                Ok(Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                })
            }
            TokenKind::Is => {
                self.advance();
                let negated = self.consume_if(&TokenKind::Not);
                self.expect(TokenKind::Null)?;
                Ok(Expr::IsNull {
                    expr: Box::new(left),
                    negated,
                })
            }
            _ => Ok(left),
        }
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                let inner = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(inner),
                })
            }
            TokenKind::Plus => {
                self.advance();
                let inner = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Plus,
                    expr: Box::new(inner),
                })
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.peek_kind().clone() {
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            TokenKind::IntegerLit(v) => {
                self.advance();
                Ok(Expr::Literal(Literal::Integer(v)))
            }
            TokenKind::FloatLit(v) => {
                self.advance();
                Ok(Expr::Literal(Literal::Float(v)))
            }
            TokenKind::StringLit(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::String(s)))
            }
            TokenKind::BooleanLit(v) => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(v)))
            }
            TokenKind::Parameter(name) => {
                self.advance();
                Ok(Expr::Parameter(name))
            }
            TokenKind::Case => self.case_expr(),
            TokenKind::LeftParen => {
                self.advance();
                if matches!(self.peek_kind(), TokenKind::Select | TokenKind::With) {
                    let query = self.select_statement()?;
                    self.expect(TokenKind::RightParen)?;
                    Ok(Expr::Subquery(Box::new(query)))
                } else {
                    let inner = self.expr()?;
                    self.expect(TokenKind::RightParen)?;
                    Ok(inner)
                }
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if self.peek_kind() == &TokenKind::LeftParen {
                    self.function_call(name)
                } else if self.consume_if(&TokenKind::Dot) {
                    let column = self.identifier()?;
                    Ok(Expr::Column {
                        table: Some(name),
                        name: column,
                    })
                } else {
                    Ok(Expr::Column { table: None, name })
                }
            }
            other => Err(self.error_here(format!(
                "Expected expression, found {}",
                other.describe()
            ))),
        }
    }

    fn function_call(&mut self, name: String) -> Result<Expr> {
        self.expect(TokenKind::LeftParen)?;
        let mut args = Vec::new();
        if self.peek_kind() != &TokenKind::RightParen {
            loop {
                if self.consume_if(&TokenKind::Star) {
                    args.push(Expr::Wildcard);
                } else {
                    args.push(self.expr()?);
                }
                if !self.consume_if(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen)?;

        let over = if self.consume_if(&TokenKind::Over) {
            self.expect(TokenKind::LeftParen)?;
            let mut spec = WindowSpec::default();
            if self.consume_if(&TokenKind::Partition) {
                self.expect(TokenKind::By)?;
                loop {
                    spec.partition_by.push(self.expr()?);
                    if !self.consume_if(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            if self.consume_if(&TokenKind::Order) {
                self.expect(TokenKind::By)?;
                spec.order_by = self.order_exprs()?;
            }
            self.expect(TokenKind::RightParen)?;
            Some(spec)
        } else {
            None
        };

        Ok(Expr::Function { name, args, over })
    }

    fn case_expr(&mut self) -> Result<Expr> {
        self.expect(TokenKind::Case)?;
        let operand = if self.peek_kind() != &TokenKind::When {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        let mut branches = Vec::new();
        while self.consume_if(&TokenKind::When) {
            let condition = self.expr()?;
            self.expect(TokenKind::Then)?;
            let result = self.expr()?;
            branches.push((condition, result));
        }
        if branches.is_empty() {
            return Err(self.error_here("CASE requires at least one WHEN branch"));
        }
        let else_expr = if self.consume_if(&TokenKind::Else) {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect(TokenKind::End)?;
        Ok(Expr::Case {
            operand,
            branches,
            else_expr,
        })
    }

    // ---- CREATE ----------------------------------------------------------

    fn create_statement(&mut self) -> Result<Statement> {
        self.expect(TokenKind::Create)?;
        match self.peek_kind() {
            TokenKind::Table => Ok(Statement::CreateTable(self.create_table()?)),
            TokenKind::Index | TokenKind::Unique => {
                Ok(Statement::CreateIndex(self.create_index()?))
            }
            other => Err(self.error_here(format!(
                "Expected TABLE or INDEX after CREATE, found {}",
                other.describe()
            ))),
        }
    }

    fn if_not_exists(&mut self) -> Result<bool> {
        if self.consume_if(&TokenKind::If) {
            self.expect(TokenKind::Not)?;
            self.expect(TokenKind::Exists)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn create_table(&mut self) -> Result<CreateTableStatement> {
        self.expect(TokenKind::Table)?;
        let if_not_exists = self.if_not_exists()?;
        let name = self.identifier()?;
        self.expect(TokenKind::LeftParen)?;

        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Primary
                | TokenKind::Unique
                | TokenKind::Check
                | TokenKind::Foreign
                | TokenKind::Constraint => {
                    constraints.push(self.table_constraint()?);
                }
                _ => columns.push(self.column_spec()?),
            }
            if !self.consume_if(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen)?;

        Ok(CreateTableStatement {
            name,
            if_not_exists,
            columns,
            constraints,
        })
    }

    fn column_spec(&mut self) -> Result<ColumnSpec> {
        let name = self.identifier()?;
        let type_name = self.identifier()?.to_uppercase();
        // Length arguments such as VARCHAR(255) are accepted and discarded
        if self.consume_if(&TokenKind::LeftParen) {
            loop {
                match self.peek_kind() {
                    TokenKind::IntegerLit(_) => {
                        self.advance();
                    }
                    other => {
                        return Err(self.error_here(format!(
                            "Expected integer length, found {}",
                            other.describe()
                        )));
                    }
                }
                if !self.consume_if(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RightParen)?;
        }

        let mut spec = ColumnSpec {
            name,
            type_name,
            not_null: false,
            primary_key: false,
            autoincrement: false,
            unique: false,
            default_expr: None,
            check: None,
        };

        loop {
            match self.peek_kind() {
                TokenKind::Not => {
                    self.advance();
                    self.expect(TokenKind::Null)?;
                    spec.not_null = true;
                }
                TokenKind::Null => {
                    self.advance();
                }
                TokenKind::Primary => {
                    self.advance();
                    self.expect(TokenKind::Key)?;
                    spec.primary_key = true;
                    if self.consume_if(&TokenKind::Autoincrement) {
                        spec.autoincrement = true;
                    }
                }
                TokenKind::Unique => {
                    self.advance();
                    spec.unique = true;
                }
                TokenKind::Default => {
                    self.advance();
                    let expr = if self.consume_if(&TokenKind::LeftParen) {
                        let inner = self.expr()?;
                        self.expect(TokenKind::RightParen)?;
                        inner
                    } else {
                        self.unary()?
                    };
                    spec.default_expr = Some(expr);
                }
                TokenKind::Check => {
                    self.advance();
                    self.expect(TokenKind::LeftParen)?;
                    spec.check = Some(self.expr()?);
                    self.expect(TokenKind::RightParen)?;
                }
                TokenKind::References => {
                    self.advance();
                    self.identifier()?;
                    if self.consume_if(&TokenKind::LeftParen) {
                        self.identifier_list_tail()?;
                    }
                }
                _ => break,
            }
        }

        Ok(spec)
    }

    fn table_constraint(&mut self) -> Result<TableConstraint> {
        if self.consume_if(&TokenKind::Constraint) {
            self.identifier()?;
        }
        match self.peek_kind() {
            TokenKind::Primary => {
                self.advance();
                self.expect(TokenKind::Key)?;
                self.expect(TokenKind::LeftParen)?;
                let columns = self.identifier_list_tail()?;
                Ok(TableConstraint::PrimaryKey(columns))
            }
            TokenKind::Unique => {
                self.advance();
                self.expect(TokenKind::LeftParen)?;
                let columns = self.identifier_list_tail()?;
                Ok(TableConstraint::Unique(columns))
            }
            TokenKind::Check => {
                self.advance();
                self.expect(TokenKind::LeftParen)?;
                let expr = self.expr()?;
                self.expect(TokenKind::RightParen)?;
                Ok(TableConstraint::Check(expr))
            }
            TokenKind::Foreign => {
                self.advance();
                self.expect(TokenKind::Key)?;
                self.expect(TokenKind::LeftParen)?;
                let columns = self.identifier_list_tail()?;
                self.expect(TokenKind::References)?;
                let ref_table = self.identifier()?;
                let ref_columns = if self.consume_if(&TokenKind::LeftParen) {
                    self.identifier_list_tail()?
                } else {
                    Vec::new()
                };
                Ok(TableConstraint::ForeignKey {
                    columns,
                    ref_table,
                    ref_columns,
                })
            }
            other => Err(self.error_here(format!(
                "Expected table constraint, found {}",
                other.describe()
            ))),
        }
    }

    /// Comma-separated identifiers up to and including the closing paren
    fn identifier_list_tail(&mut self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        loop {
            names.push(self.identifier()?);
            if !self.consume_if(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen)?;
        Ok(names)
    }

    fn create_index(&mut self) -> Result<CreateIndexStatement> {
        let unique = self.consume_if(&TokenKind::Unique);
        self.expect(TokenKind::Index)?;
        let if_not_exists = self.if_not_exists()?;
        let name = self.identifier()?;
        self.expect(TokenKind::On)?;
        let table = self.identifier()?;
        self.expect(TokenKind::LeftParen)?;
        let columns = self.identifier_list_tail()?;
        Ok(CreateIndexStatement {
            name,
            table,
            columns,
            unique,
            if_not_exists,
        })
    }
}
