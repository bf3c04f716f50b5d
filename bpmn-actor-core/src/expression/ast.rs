use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ExpressionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `root.member.member`
    Path { root: String, members: Vec<String> },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Root names of every object path, in no particular order.
    pub fn roots(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_roots(&mut out);
        out
    }

    fn collect_roots(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path { root, .. } => {
                out.insert(root.clone());
            }
            Expr::Not(inner) | Expr::Neg(inner) => inner.collect_roots(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_roots(out);
                rhs.collect_roots(out);
            }
        }
    }

    /// Evaluate against bound objects. Pure.
    pub fn eval(&self, context: &BTreeMap<String, Value>) -> Result<Value, ExpressionError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path { root, members } => {
                let mut current = context
                    .get(root)
                    .ok_or_else(|| ExpressionError::MissingObject(root.clone()))?;
                for member in members {
                    match current.get(member) {
                        Some(next) => current = next,
                        None => return Ok(Value::Null),
                    }
                }
                Ok(current.clone())
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(context)?))),
            Expr::Neg(inner) => match inner.eval(context)? {
                Value::Number(n) => negate(&n),
                other => Err(ExpressionError::Type(format!("cannot negate {}", kind(&other)))),
            },
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                if !truthy(&lhs.eval(context)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&rhs.eval(context)?)))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                if truthy(&lhs.eval(context)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&rhs.eval(context)?)))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(context)?;
                let rhs = rhs.eval(context)?;
                binary(*op, &lhs, &rhs)
            }
        }
    }
}

/// Boolean coercion used by guards.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn float(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type(format!("{f} is not a finite number")))
}

fn negate(n: &Number) -> Result<Value, ExpressionError> {
    if let Some(i) = n.as_i64().and_then(i64::checked_neg) {
        return Ok(Value::from(i));
    }
    float(-n.as_f64().unwrap_or(0.0))
}

fn numbers(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<(Number, Number), ExpressionError> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Ok((a.clone(), b.clone())),
        _ => Err(ExpressionError::Type(format!(
            "{op:?} needs numbers, got {} and {}",
            kind(lhs),
            kind(rhs)
        ))),
    }
}

fn arithmetic(op: BinaryOp, a: &Number, b: &Number) -> Result<Value, ExpressionError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Rem if y == 0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Rem => x.checked_rem(y),
            BinaryOp::Div if y == 0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Div if x % y == 0 => x.checked_div(y),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    match op {
        BinaryOp::Add => float(x + y),
        BinaryOp::Sub => float(x - y),
        BinaryOp::Mul => float(x * y),
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => float(x / y),
        BinaryOp::Rem => float(x % y),
        _ => Err(ExpressionError::Type(format!("{op:?} is not arithmetic"))),
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality with numeric normalization (`1 == 1.0`).
fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(lhs, rhs).ok_or_else(|| {
                ExpressionError::Type(format!("cannot compare {} with {}", kind(lhs), kind(rhs)))
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            (Value::Object(a), Value::Object(b)) => {
                let mut merged: Map<String, Value> = a.clone();
                merged.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(Value::Object(merged))
            }
            _ => {
                let (a, b) = numbers(op, lhs, rhs)?;
                arithmetic(op, &a, &b)
            }
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numbers(op, lhs, rhs)?;
            arithmetic(op, &a, &b)
        }
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(match op {
            BinaryOp::And => truthy(lhs) && truthy(rhs),
            _ => truthy(lhs) || truthy(rhs),
        })),
    }
}
