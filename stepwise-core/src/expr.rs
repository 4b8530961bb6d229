//! Expression evaluation.
//!
//! The core only depends on the [`ExpressionEngine`] trait: guards and export
//! expressions are opaque strings evaluated against a set of named bindings
//! (`input` and `output` for guards, `input` for exports).
//!
//! [`ExprEngine`] is the default implementation. Its language supports:
//!
//! - `input.field` / `output.field.nested` - path access rooted at a binding
//! - `input.items.0` - array index
//! - `"text"`, `42`, `-1.5`, `true`, `false`, `null` - literals
//! - `a == b`, `a != b` - equality
//! - `a > b`, `a >= b`, `a < b`, `a <= b` - ordering (numbers or strings)
//! - `a + b`, `a - b` - arithmetic (`+` also joins strings)
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping
//!
//! Examples:
//! - `input.needs_transcode` - true if the flag is truthy
//! - `input.size > 1024 && !input.skip` - compound condition
//! - `output.attempts + 1` - computed export value
//!
//! Missing fields evaluate to `null`. Referencing a binding that does not
//! exist is an evaluation error.

use parking_lot::RwLock;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Named variables visible to an expression.
pub type Bindings = Map<String, Value>;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("parse error at offset {offset}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("{reason}")]
    Evaluation { reason: String },
}

impl ExpressionError {
    fn parse(offset: usize, reason: impl Into<String>) -> Self {
        ExpressionError::Parse {
            offset,
            reason: reason.into(),
        }
    }

    fn evaluation(reason: impl Into<String>) -> Self {
        ExpressionError::Evaluation {
            reason: reason.into(),
        }
    }
}

/// An injected expression evaluator.
pub trait ExpressionEngine: Send + Sync + fmt::Debug {
    /// Evaluates `expression` with `bindings` in scope.
    fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value, ExpressionError>;

    /// Evaluates `expression` and coerces the result to a boolean.
    fn evaluate_bool(&self, expression: &str, bindings: &Bindings) -> Result<bool, ExpressionError> {
        self.evaluate(expression, bindings).map(|v| is_truthy(&v))
    }

    /// Checks that `expression` is well-formed without evaluating it.
    fn check(&self, _expression: &str) -> Result<(), ExpressionError> {
        Ok(())
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Binding lookup followed by field/index accesses.
    Path { root: String, fields: Vec<String> },
    /// Logical NOT.
    Not(Box<Expr>),
    /// Logical AND.
    And(Box<Expr>, Box<Expr>),
    /// Logical OR.
    Or(Box<Expr>, Box<Expr>),
    /// Comparison.
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    /// Addition or string concatenation.
    Add(Box<Expr>, Box<Expr>),
    /// Subtraction.
    Sub(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, ExpressionError> {
        if s.trim().is_empty() {
            return Err(ExpressionError::parse(0, "empty expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(ExpressionError::parse(
                parser.pos,
                format!("unexpected trailing input '{}'", &s[parser.pos..]),
            ));
        }
        Ok(expr)
    }

    /// Evaluates the expression against `bindings`.
    pub fn evaluate(&self, bindings: &Bindings) -> Result<Value, ExpressionError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path { root, fields } => {
                let value = bindings.get(root).ok_or_else(|| {
                    ExpressionError::evaluation(format!("unknown variable '{}'", root))
                })?;
                Ok(get_field(value, fields))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(bindings)?))),
            Expr::And(left, right) => {
                if !is_truthy(&left.evaluate(bindings)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(bindings)?)))
            }
            Expr::Or(left, right) => {
                if is_truthy(&left.evaluate(bindings)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(bindings)?)))
            }
            Expr::Compare(op, left, right) => {
                let left = left.evaluate(bindings)?;
                let right = right.evaluate(bindings)?;
                Ok(Value::Bool(compare(*op, &left, &right)))
            }
            Expr::Add(left, right) => add(&left.evaluate(bindings)?, &right.evaluate(bindings)?),
            Expr::Sub(left, right) => {
                subtract(&left.evaluate(bindings)?, &right.evaluate(bindings)?)
            }
        }
    }
}

/// JSON truthiness: null, false, 0, "" and empty containers are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn get_field(value: &Value, fields: &[String]) -> Value {
    let mut current = value;

    for field in fields {
        current = match current {
            Value::Object(map) => map.get(field).unwrap_or(&Value::Null),
            Value::Array(items) => match field.parse::<usize>() {
                Ok(index) => items.get(index).unwrap_or(&Value::Null),
                Err(_) => return Value::Null,
            },
            _ => return Value::Null,
        };
    }

    current.clone()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Gt => ordering.map(|o| o.is_gt()).unwrap_or(false),
        CmpOp::Ge => ordering.map(|o| o.is_ge()).unwrap_or(false),
        CmpOp::Lt => ordering.map(|o| o.is_lt()).unwrap_or(false),
        CmpOp::Le => ordering.map(|o| o.is_le()).unwrap_or(false),
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(sum) = a.checked_add(b) {
                    return Ok(Value::from(sum));
                }
            }
            float_result(a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN))
        }
        _ => Err(ExpressionError::evaluation(format!(
            "cannot add {} and {}",
            left, right
        ))),
    }
}

fn subtract(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(diff) = a.checked_sub(b) {
                    return Ok(Value::from(diff));
                }
            }
            float_result(a.as_f64().unwrap_or(f64::NAN) - b.as_f64().unwrap_or(f64::NAN))
        }
        _ => Err(ExpressionError::evaluation(format!(
            "cannot subtract {} from {}",
            right, left
        ))),
    }
}

fn float_result(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::evaluation("arithmetic produced a non-finite number"))
}

/// Simple recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            self.pos += 2;
            CmpOp::Eq
        } else if self.peek_str("!=") {
            self.pos += 2;
            CmpOp::Ne
        } else if self.peek_str(">=") {
            self.pos += 2;
            CmpOp::Ge
        } else if self.peek_str("<=") {
            self.pos += 2;
            CmpOp::Le
        } else if self.peek_char() == Some('>') {
            self.pos += 1;
            CmpOp::Gt
        } else if self.peek_char() == Some('<') {
            self.pos += 1;
            CmpOp::Lt
        } else {
            return Ok(left);
        };

        let right = self.parse_additive()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        loop {
            match self.peek_char() {
                Some('+') => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = Expr::Add(Box::new(left), Box::new(right));
                }
                Some('-') => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = Expr::Sub(Box::new(left), Box::new(right));
                }
                _ => break,
            }
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?; // Recursive to allow !!input.a
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(ExpressionError::parse(self.pos, "expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('"') => self.parse_string().map(Expr::Literal),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number().map(Expr::Literal),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_identifier_or_path(),
            Some(c) => Err(ExpressionError::parse(
                self.pos,
                format!("unexpected character '{}'", c),
            )),
            None => Err(ExpressionError::parse(self.pos, "unexpected end of expression")),
        }
    }

    fn parse_identifier_or_path(&mut self) -> Result<Expr, ExpressionError> {
        let root = self.parse_segment()?;
        match root.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        let mut fields = Vec::new();
        while self.peek_char() == Some('.') {
            self.pos += 1;
            fields.push(self.parse_segment()?);
        }

        Ok(Expr::Path { root, fields })
    }

    fn parse_segment(&mut self) -> Result<String, ExpressionError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        if start == self.pos {
            return Err(ExpressionError::parse(self.pos, "empty field name"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<Value, ExpressionError> {
        let start = self.pos;
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            match c {
                '"' => return Ok(Value::String(out)),
                '\\' => {
                    let escaped = self
                        .peek_char()
                        .ok_or_else(|| ExpressionError::parse(self.pos, "dangling escape"))?;
                    self.pos += escaped.len_utf8();
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                other => out.push(other),
            }
        }

        Err(ExpressionError::parse(start, "unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, ExpressionError> {
        let start = self.pos;

        // Optional negative sign
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }

        let num_str = &self.input[start..self.pos];
        if !is_float {
            if let Ok(n) = num_str.parse::<i64>() {
                return Ok(Value::from(n));
            }
        }
        num_str
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| ExpressionError::parse(start, format!("invalid number: '{}'", num_str)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

/// Default expression engine with a parse cache.
#[derive(Debug, Default)]
pub struct ExprEngine {
    cache: RwLock<HashMap<String, Arc<Expr>>>,
}

impl ExprEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `expression`, reusing a previously parsed tree when available.
    pub fn compile(&self, expression: &str) -> Result<Arc<Expr>, ExpressionError> {
        if let Some(expr) = self.cache.read().get(expression) {
            return Ok(expr.clone());
        }

        let expr = Arc::new(Expr::parse(expression)?);
        self.cache
            .write()
            .insert(expression.to_string(), expr.clone());
        Ok(expr)
    }

    /// Number of cached expressions.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

impl ExpressionEngine for ExprEngine {
    fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value, ExpressionError> {
        self.compile(expression)?.evaluate(bindings)
    }

    fn check(&self, expression: &str) -> Result<(), ExpressionError> {
        self.compile(expression).map(|_| ())
    }
}
