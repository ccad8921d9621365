//! Closed condition grammar for Decision steps.
//!
//! Conditions are data ([`Condition`]); the only free-form form is
//! [`Condition::Expression`], a boolean expression over literals and `${...}`
//! references with `&&`, `||`, `!`, parentheses and comparisons. No calls, no
//! attribute access beyond reference paths.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::resolve::{self, parse_path, resolve_reference, type_name};
use crate::core::variables::VariableStore;
use crate::error::{ResolveError, StepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "eq", alias = "==")]
    Eq,
    #[serde(rename = "ne", alias = "!=")]
    Ne,
    #[serde(rename = "gt", alias = ">")]
    Gt,
    #[serde(rename = "ge", alias = ">=")]
    Ge,
    #[serde(rename = "lt", alias = "<")]
    Lt,
    #[serde(rename = "le", alias = "<=")]
    Le,
}

/// Output field inspected by [`Condition::Contains`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    #[default]
    Stdout,
    Stderr,
    Body,
    Content,
}

impl OutputStream {
    fn field(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Body => "body",
            Self::Content => "content",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Condition {
    /// String operands are templates; other JSON values are literals.
    Compare {
        left: Value,
        op: CompareOp,
        right: Value,
    },
    /// Path (template) exists relative to the working directory.
    Exists { path: String },
    Succeeded { step: String },
    Contains {
        step: String,
        #[serde(default)]
        stream: OutputStream,
        text: String,
    },
    Literal { value: bool },
    Expression { expr: String },
}

impl Condition {
    /// Syntax errors detectable at plan acceptance.
    pub fn check(&self) -> Vec<String> {
        let templates: Vec<&str> = match self {
            Self::Compare { left, right, .. } => [left, right]
                .into_iter()
                .filter_map(Value::as_str)
                .collect(),
            Self::Exists { path } => vec![path.as_str()],
            Self::Contains { text, .. } => vec![text.as_str()],
            Self::Succeeded { .. } | Self::Literal { .. } => Vec::new(),
            Self::Expression { expr } => {
                return parse_expression(expr).err().into_iter().collect();
            }
        };
        templates
            .into_iter()
            .filter_map(|template| resolve::references(template).err())
            .map(|err| err.to_string())
            .collect()
    }

    /// Step ids this condition inspects.
    pub fn referenced_steps(&self) -> Vec<&str> {
        match self {
            Self::Succeeded { step } | Self::Contains { step, .. } => vec![step.as_str()],
            _ => Vec::new(),
        }
    }

    /// Evaluate against the store; `exists` answers filesystem queries.
    pub fn evaluate(
        &self,
        store: &VariableStore,
        exists: &dyn Fn(&str) -> bool,
    ) -> Result<bool, StepError> {
        match self {
            Self::Compare { left, op, right } => {
                let left = operand(left, store)?;
                let right = operand(right, store)?;
                compare(&left, *op, &right).map_err(StepError::permanent)
            }
            Self::Exists { path } => Ok(exists(&resolve::resolve_string(path, store)?)),
            Self::Succeeded { step } => Ok(store
                .step_result(step)
                .and_then(|result| result.get("success").and_then(Value::as_bool))
                .unwrap_or(false)),
            Self::Contains { step, stream, text } => {
                let needle = resolve::resolve_string(text, store)?;
                Ok(store
                    .step_result(step)
                    .and_then(|result| result.get(stream.field()).map(resolve::render))
                    .is_some_and(|haystack| haystack.contains(&needle)))
            }
            Self::Literal { value } => Ok(*value),
            Self::Expression { expr } => {
                let parsed = parse_expression(expr).map_err(StepError::InvalidParams)?;
                let value = parsed.eval(store)?;
                Ok(truthy(&value))
            }
        }
    }
}

fn operand(value: &Value, store: &VariableStore) -> Result<Value, ResolveError> {
    match value {
        Value::String(template) => resolve::resolve_template(template, store),
        other => Ok(other.clone()),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Compare numerically when both sides are numeric, otherwise as strings.
pub fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, String> {
    let ordering = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left, right) {
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            _ => None,
        },
    };
    match (op, ordering) {
        (CompareOp::Eq, Some(ord)) => Ok(ord == Ordering::Equal),
        (CompareOp::Ne, Some(ord)) => Ok(ord != Ordering::Equal),
        (CompareOp::Eq, None) => Ok(left == right),
        (CompareOp::Ne, None) => Ok(left != right),
        (CompareOp::Gt, Some(ord)) => Ok(ord == Ordering::Greater),
        (CompareOp::Ge, Some(ord)) => Ok(ord != Ordering::Less),
        (CompareOp::Lt, Some(ord)) => Ok(ord == Ordering::Less),
        (CompareOp::Le, Some(ord)) => Ok(ord != Ordering::Greater),
        (_, None) => Err(format!(
            "cannot order {} and {}",
            type_name(left),
            type_name(right)
        )),
    }
}

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

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Reference(String),
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    And,
    Or,
    Not,
    Op(CompareOp),
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Reference(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

impl Expr {
    fn eval(&self, store: &VariableStore) -> Result<Value, StepError> {
        Ok(match self {
            Self::Literal(value) => value.clone(),
            Self::Reference(path) => resolve_reference(path, store)?,
            Self::Not(inner) => Value::Bool(!truthy(&inner.eval(store)?)),
            Self::And(l, r) => Value::Bool(truthy(&l.eval(store)?) && truthy(&r.eval(store)?)),
            Self::Or(l, r) => Value::Bool(truthy(&l.eval(store)?) || truthy(&r.eval(store)?)),
            Self::Compare(l, op, r) => {
                let left = l.eval(store)?;
                let right = r.eval(store)?;
                Value::Bool(compare(&left, *op, &right).map_err(StepError::permanent)?)
            }
        })
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '$' if next == Some('{') => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|offset| i + offset)
                    .ok_or_else(|| "unterminated '${' in expression".to_string())?;
                let path: String = chars[i + 2..close].iter().collect();
                parse_path(&path).map_err(|err| err.to_string())?;
                tokens.push(Token::Reference(path.trim().to_string()));
                i = close + 1;
            }
            '"' | '\'' => {
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(j + 1) {
                                text.push(*escaped);
                            }
                            j += 2;
                        }
                        Some(q) if *q == c => break,
                        Some(other) => {
                            text.push(*other);
                            j += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
                i = j + 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '>' | '<' => {
                let inclusive = next == Some('=');
                let op = match (c, inclusive) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if inclusive { 2 } else { 1 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => return Err(format!("unsupported identifier '{word}' in expression")),
                });
            }
            other => return Err(format!("unexpected character '{other}' in expression")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Reference(path)) => Ok(Expr::Reference(path)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Open) => {
                let inner = self.or()?;
                match self.advance() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn parse_expression(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input).map_err(|err| format!("expression '{input}': {err}"))?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser
        .or()
        .map_err(|err| format!("expression '{input}': {err}"))?;
    if parser.pos < parser.tokens.len() {
        return Err(format!("expression '{input}': trailing tokens"));
    }
    Ok(expr)
}
