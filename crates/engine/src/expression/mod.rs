//! A small, side-effect free expression language for condition, switch and
//! await-filter nodes.
//!
//! Expressions only read from the scope they are given: there are no function
//! calls, assignments or loops. Missing paths evaluate to `null`.

mod lexer;
mod parser;

pub use parser::{BinaryOp, Expr, Segment};

use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use parser::Parser;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("cannot negate {0}")]
    NotANumber(String),
}

/// A parsed expression, ready to evaluate against any number of scopes.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            source: source.to_string(),
            root: Parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &Value) -> Result<Value, ExpressionError> {
        eval(&self.root, scope)
    }

    pub fn evaluate_bool(&self, scope: &Value) -> Result<bool, ExpressionError> {
        Ok(truthy(&self.evaluate(scope)?))
    }
}

pub fn evaluate(source: &str, scope: &Value) -> Result<Value, ExpressionError> {
    Expression::parse(source)?.evaluate(scope)
}

pub fn evaluate_bool(source: &str, scope: &Value) -> Result<bool, ExpressionError> {
    Expression::parse(source)?.evaluate_bool(scope)
}

/// `null`, `false`, `0`, `""` and empty arrays/objects are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Renders a value as a switch case key: strings verbatim, everything else
/// as compact JSON.
pub fn case_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval(expr: &Expr, scope: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(resolve(scope, segments).cloned().unwrap_or(Value::Null)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?))),
        Expr::Negate(inner) => {
            let value = eval(inner, scope)?;
            match value.as_f64() {
                Some(n) => Ok(serde_json::Number::from_f64(-n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)),
                None => Err(ExpressionError::NotANumber(value.to_string())),
            }
        }
        Expr::Binary(left, BinaryOp::And, right) => {
            let left = eval(left, scope)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(right, scope)?)))
        }
        Expr::Binary(left, BinaryOp::Or, right) => {
            let left = eval(left, scope)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(right, scope)?)))
        }
        Expr::Binary(left, op, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            Ok(Value::Bool(compare(&left, *op, &right)))
        }
    }
}

fn resolve<'a>(scope: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(scope, |current, segment| match segment {
        Segment::Key(key) => current.get(key.as_str()),
        Segment::Index(index) => current.get(*index),
    })
}

fn compare(left: &Value, op: BinaryOp, right: &Value) -> bool {
    match op {
        BinaryOp::Eq => loosely_equal(left, right),
        BinaryOp::NotEq => !loosely_equal(left, right),
        BinaryOp::In => contains(right, left),
        BinaryOp::Lt => order(left, right) == Some(Ordering::Less),
        BinaryOp::LtEq => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        BinaryOp::Gt => order(left, right) == Some(Ordering::Greater),
        BinaryOp::GtEq => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
        BinaryOp::And => truthy(left) && truthy(right),
        BinaryOp::Or => truthy(left) || truthy(right),
    }
}

/// Numbers compare by value regardless of integer/float representation.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}
