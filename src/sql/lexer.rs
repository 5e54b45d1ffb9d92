// src/sql/lexer.rs

//! Lexer for the restricted SQL dialect
//!
//! Produces the fixed token set in [`super::token`]. Keywords are matched
//! case-insensitively; identifiers may be bare or double-quoted; string
//! literals use single quotes with `''` as the escape; `--` and `/* */`
//! comments are skipped. Every token carries its source position.

use crate::error::{Error, Result};

use super::token::{Token, TokenKind};

/// Tokenize a SQL string
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let kind = if c == '\'' {
                self.string_literal()?
            } else if c == '"' {
                self.quoted_identifier()?
            } else if c.is_ascii_digit() {
                self.number()?
            } else if c.is_ascii_alphabetic() || c == '_' {
                self.identifier_or_keyword()
            } else if c == '@' || c == ':' {
                self.parameter()?
            } else {
                self.operator()?
            };

            tokens.push(Token { kind, line, column });
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::SqlParse {
            message: message.into(),
            line: self.line,
            column: self.column,
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.peek_ahead(1) == Some('-') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_ahead(1) == Some('*') => {
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            Some('*') if self.peek_ahead(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                            None => return Err(self.error("Unterminated block comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn string_literal(&mut self) -> Result<TokenKind> {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.advance() {
                Some('\'') => {
                    // '' escapes a single quote
                    if self.peek() == Some('\'') {
                        self.advance();
                        value.push('\'');
                    } else {
                        return Ok(TokenKind::StringLit(value));
                    }
                }
                Some(c) => value.push(c),
                None => return Err(self.error("Unterminated string literal")),
            }
        }
    }

    fn quoted_identifier(&mut self) -> Result<TokenKind> {
        self.advance(); // opening quote
        let mut name = String::new();
        loop {
            match self.advance() {
                Some('"') => {
                    if self.peek() == Some('"') {
                        self.advance();
                        name.push('"');
                    } else {
                        return Ok(TokenKind::Identifier(name));
                    }
                }
                Some(c) => name.push(c),
                None => return Err(self.error("Unterminated quoted identifier")),
            }
        }
    }

    fn number(&mut self) -> Result<TokenKind> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else if c == '.' && !is_float && self.peek_ahead(1).is_some_and(|d| d.is_ascii_digit())
            {
                is_float = true;
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(format!("Invalid number: {}", text)))?;
            Ok(TokenKind::FloatLit(value))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(format!("Invalid integer: {}", text)))?;
            Ok(TokenKind::IntegerLit(value))
        }
    }

    fn identifier_or_keyword(&mut self) -> TokenKind {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        TokenKind::keyword(&name.to_uppercase()).unwrap_or(TokenKind::Identifier(name))
    }

    fn parameter(&mut self) -> Result<TokenKind> {
        let sigil = self.advance().unwrap_or('@');
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.error(format!("Expected parameter name after '{}'", sigil)));
        }
        Ok(TokenKind::Parameter(format!("{}{}", sigil, name)))
    }

    fn operator(&mut self) -> Result<TokenKind> {
        let Some(c) = self.advance() else {
            return Err(self.error("Unexpected end of input"));
        };
        let kind = match c {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ';' => TokenKind::Semicolon,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => TokenKind::Equal,
            '<' => match self.peek() {
                Some('=') => {
                    self.advance();
                    TokenKind::LessThanOrEqual
                }
                Some('>') => {
                    self.advance();
                    TokenKind::NotEqual
                }
                _ => TokenKind::LessThan,
            },
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::GreaterThanOrEqual
                } else {
                    TokenKind::GreaterThan
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::NotEqual
                } else {
                    return Err(self.error("Unexpected character: !"));
                }
            }
            other => return Err(self.error(format!("Unexpected character: {}", other))),
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            kinds("select FROM Where"),
            vec![
                TokenKind::Select,
                TokenKind::From,
                TokenKind::Where,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_identifiers_and_literals() {
        assert_eq!(
            kinds("Status = 'New'"),
            vec![
                TokenKind::Identifier("Status".to_string()),
                TokenKind::Equal,
                TokenKind::StringLit("New".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_quoted_identifier() {
        assert_eq!(
            kinds("\"Order\""),
            vec![TokenKind::Identifier("Order".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_string_escape() {
        assert_eq!(
            kinds("'it''s'"),
            vec![TokenKind::StringLit("it's".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 3.25"),
            vec![
                TokenKind::IntegerLit(42),
                TokenKind::FloatLit(3.25),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            kinds("a <= b <> c != d >= e"),
            vec![
                TokenKind::Identifier("a".to_string()),
                TokenKind::LessThanOrEqual,
                TokenKind::Identifier("b".to_string()),
                TokenKind::NotEqual,
                TokenKind::Identifier("c".to_string()),
                TokenKind::NotEqual,
                TokenKind::Identifier("d".to_string()),
                TokenKind::GreaterThanOrEqual,
                TokenKind::Identifier("e".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_parameters() {
        assert_eq!(
            kinds("@p0 :name"),
            vec![
                TokenKind::Parameter("@p0".to_string()),
                TokenKind::Parameter(":name".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("SELECT -- trailing\n/* block */ 1"),
            vec![TokenKind::Select, TokenKind::IntegerLit(1), TokenKind::Eof]
        );
    }

    #[test]
    fn test_position_tracking() {
        let tokens = tokenize("SELECT\n  Name").unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn test_unterminated_string_reports_position() {
        let err = tokenize("'abc").unwrap_err();
        match err {
            Error::SqlParse { message, .. } => assert!(message.contains("Unterminated")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
