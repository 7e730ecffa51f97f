//! Condition evaluator for `variable OPERATOR literal` expressions.
//!
//! Grammar: `identifier (==|!=|>=|<=|>|<) literal` where the literal is a
//! quoted string, `true`/`false`, an integer or a float. Unquoted literals
//! that are none of those compare as strings and may not contain whitespace,
//! so compound forms such as `a == 1 && b == 2` do not parse. Bare
//! truthiness (`vip`) has no operator and does not parse either.
//!
//! Failure policy: an expression that does not parse evaluates to `true`
//! (the branch proceeds), while a parsed expression that cannot be evaluated
//! (missing variable, type mismatch) evaluates to `false`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use autoflow_types::execution::ExecutionContext;
use serde_json::Value;
use thiserror::Error;

use super::resolver::walk_path;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl CompareOp {
    /// Two-character operators first so `>=` is not read as `>`.
    const TOKENS: [(&'static str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Lt => ordering == Ordering::Less,
        }
    }

    fn is_equality(self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = Self::TOKENS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(t, _)| *t)
            .unwrap_or("?");
        f.write_str(token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Literal {
    fn parse(raw: &str) -> Self {
        if let Some(inner) = unquote(raw) {
            return Literal::Str(inner.to_string());
        }
        match raw {
            "true" => return Literal::Bool(true),
            "false" => return Literal::Bool(false),
            _ => {}
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Literal::Int(i);
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => Literal::Float(f),
            _ => Literal::Str(raw.to_string()),
        }
    }
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub variable: String,
    pub op: CompareOp,
    pub literal: Literal,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("cannot parse condition '{0}'")]
    Parse(String),

    #[error("variable '{0}' is not set")]
    MissingVariable(String),

    #[error("cannot compare {found} with {literal:?} using '{op}'")]
    TypeMismatch {
        found: String,
        literal: Literal,
        op: CompareOp,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let parse_err = || ConditionError::Parse(input.to_string());

        let (pos, token, op) = input
            .char_indices()
            .find_map(|(i, _)| {
                CompareOp::TOKENS
                    .iter()
                    .find(|(t, _)| input[i..].starts_with(t))
                    .map(|(t, op)| (i, *t, *op))
            })
            .ok_or_else(parse_err)?;

        let variable = input[..pos].trim();
        let literal = input[pos + token.len()..].trim();
        if !is_identifier(variable) || literal.is_empty() {
            return Err(parse_err());
        }
        if unquote(literal).is_none() && literal.contains(char::is_whitespace) {
            return Err(parse_err());
        }

        Ok(Self {
            variable: variable.to_string(),
            op,
            literal: Literal::parse(literal),
        })
    }

    /// Evaluate against a variables map.
    pub fn evaluate(&self, variables: &HashMap<String, Value>) -> Result<bool, ConditionError> {
        let value = lookup_variable(variables, &self.variable)
            .ok_or_else(|| ConditionError::MissingVariable(self.variable.clone()))?;
        let mismatch = || ConditionError::TypeMismatch {
            found: type_name(value).to_string(),
            literal: self.literal.clone(),
            op: self.op,
        };

        let ordering = match (value, &self.literal) {
            (Value::Number(n), Literal::Int(i)) => match n.as_i64() {
                Some(v) => v.cmp(i),
                None => compare_f64(n.as_f64().ok_or_else(mismatch)?, *i as f64)
                    .ok_or_else(mismatch)?,
            },
            (Value::Number(n), Literal::Float(f)) => {
                compare_f64(n.as_f64().ok_or_else(mismatch)?, *f).ok_or_else(mismatch)?
            }
            (Value::String(s), Literal::Str(lit)) => s.as_str().cmp(lit.as_str()),
            (Value::Bool(b), Literal::Bool(lit)) if self.op.is_equality() => b.cmp(lit),
            _ => return Err(mismatch()),
        };

        Ok(self.op.holds(ordering))
    }
}

fn unquote(raw: &str) -> Option<&str> {
    ['"', '\''].iter().find_map(|q| {
        raw.strip_prefix(*q)
            .and_then(|rest| rest.strip_suffix(*q))
    })
}

fn compare_f64(a: f64, b: f64) -> Option<Ordering> {
    a.partial_cmp(&b)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn lookup_variable<'a>(variables: &'a HashMap<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(name) {
        return Some(value);
    }
    let (head, path) = name.split_once('.')?;
    walk_path(variables.get(head)?, path)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Evaluate a condition string against an execution's variables.
pub fn evaluate(condition: &str, ctx: &ExecutionContext) -> bool {
    evaluate_variables(condition, &ctx.variables)
}

/// Evaluate a condition string against a variables map.
pub fn evaluate_variables(condition: &str, variables: &HashMap<String, Value>) -> bool {
    let parsed = match Condition::parse(condition) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(condition, error = %e, "unparsable condition, proceeding");
            return true;
        }
    };
    match parsed.evaluate(variables) {
        Ok(matched) => matched,
        Err(e) => {
            tracing::warn!(condition, error = %e, "condition evaluation failed, treating as not matched");
            false
        }
    }
}
