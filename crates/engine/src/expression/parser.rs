//! Recursive descent parser producing an [`Expr`] tree.
//!
//! Precedence, loosest first: `||`, `&&`, comparisons (`== != < <= > >= in`),
//! unary (`!`, `-`), then literals, paths and parenthesised groups.

use serde_json::Value;

use crate::expression::{
    lexer::{Lexer, Token},
    ExpressionError,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            Token::Eof => Ok(expr),
            other => Err(parser.unexpected(other.clone(), "end of expression")),
        }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, found: Token, expected: &str) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.pos,
            message: format!("expected {}, found {:?}", expected, found),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(Box::new(left), BinaryOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::NotEq,
            Token::Lt => BinaryOp::Lt,
            Token::LtEq => BinaryOp::LtEq,
            Token::Gt => BinaryOp::Gt,
            Token::GtEq => BinaryOp::GtEq,
            Token::In => BinaryOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::Binary(Box::new(left), op, Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Token::Not => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Negate(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::String(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::OpenParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Token::CloseParen => Ok(inner),
                    other => Err(self.unexpected(other, "')'")),
                }
            }
            Token::Identifier(name) => self.parse_path(name),
            other => Err(self.unexpected(other, "a value")),
        }
    }

    fn parse_path(&mut self, head: String) -> Result<Expr, ExpressionError> {
        let mut segments = vec![Segment::Key(head)];
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    match self.advance() {
                        Token::Identifier(key) => segments.push(Segment::Key(key)),
                        other => return Err(self.unexpected(other, "a property name")),
                    }
                }
                Token::OpenBracket => {
                    self.advance();
                    let segment = match self.advance() {
                        Token::Number(n) if n >= 0.0 && n.fract() == 0.0 => {
                            Segment::Index(n as usize)
                        }
                        Token::String(key) => Segment::Key(key),
                        other => return Err(self.unexpected(other, "an index or quoted key")),
                    };
                    match self.advance() {
                        Token::CloseBracket => segments.push(segment),
                        other => return Err(self.unexpected(other, "']'")),
                    }
                }
                _ => return Ok(Expr::Path(segments)),
            }
        }
    }
}

/// Integral literals stay integers so they compare equal to JSON integers.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
