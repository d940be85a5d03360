//! Core value types for the skein runtime.
//!
//! This module defines the fundamental data types:
//! - Value: the typed variant every variable, literal, and expression result carries
//! - CmpOp: the comparison operators shared by conditions and the evaluator
//! - ArithOp: the arithmetic operators with numeric promotion

use serde::{Deserialize, Serialize};
use std::fmt;

/// A runtime value: exactly one of bool, 32-bit int, 32-bit float, string,
/// or ordered list of strings.
///
/// Lists hold strings only; non-string items are stringified on insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
    List(Vec<String>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => write!(f, "{}", items.join(", ")),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Arithmetic operators subject to numeric promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Value {
    /// Truthiness: bool true, non-zero int, non-zero float, non-empty string,
    /// non-empty list.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
        }
    }

    /// Numeric view with bool promoted to 0/1. Strings and lists read as 0.
    fn as_int(&self) -> i32 {
        match self {
            Value::Bool(b) => *b as i32,
            Value::Int(i) => *i,
            Value::Float(x) => *x as i32,
            _ => 0,
        }
    }

    fn as_float(&self) -> f32 {
        match self {
            Value::Bool(b) => *b as i32 as f32,
            Value::Int(i) => *i as f32,
            Value::Float(x) => *x,
            _ => 0.0,
        }
    }

    /// String view for comparisons: non-strings compare as the empty string.
    fn as_cmp_str(&self) -> &str {
        match self {
            Value::Str(s) => s.as_str(),
            _ => "",
        }
    }
}

/// Compare two values under the promotion ladder: bool, then string, then
/// float, then int. Bool and string admit only equality tests; the ordering
/// operators evaluate to false for them.
pub fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    if matches!(lhs, Value::Bool(_)) || matches!(rhs, Value::Bool(_)) {
        let a = lhs.truthy();
        let b = rhs.truthy();
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => false,
        };
    }

    if matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)) {
        let a = lhs.as_cmp_str();
        let b = rhs.as_cmp_str();
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => false,
        };
    }

    if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
        let a = lhs.as_float();
        let b = rhs.as_float();
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Lt => a < b,
            CmpOp::Ge => a >= b,
            CmpOp::Le => a <= b,
        };
    }

    let a = lhs.as_int();
    let b = rhs.as_int();
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Lt => a < b,
        CmpOp::Ge => a >= b,
        CmpOp::Le => a <= b,
    }
}

/// Apply an arithmetic operator with numeric promotion.
///
/// If either operand is float both promote to float; bool promotes to 0/1.
/// Division and modulo by zero yield the zero of the result type rather than
/// faulting. Modulo is always an integer operation.
pub fn arithmetic(lhs: &Value, op: ArithOp, rhs: &Value) -> Value {
    if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
        let a = lhs.as_float();
        let b = rhs.as_float();
        return match op {
            ArithOp::Add => Value::Float(a + b),
            ArithOp::Sub => Value::Float(a - b),
            ArithOp::Mul => Value::Float(a * b),
            ArithOp::Div => {
                if b != 0.0 {
                    Value::Float(a / b)
                } else {
                    Value::Float(0.0)
                }
            }
            ArithOp::Mod => {
                let (ai, bi) = (a as i32, b as i32);
                if bi != 0 {
                    Value::Int(ai % bi)
                } else {
                    Value::Int(0)
                }
            }
        };
    }

    let a = lhs.as_int();
    let b = rhs.as_int();
    match op {
        ArithOp::Add => Value::Int(a.wrapping_add(b)),
        ArithOp::Sub => Value::Int(a.wrapping_sub(b)),
        ArithOp::Mul => Value::Int(a.wrapping_mul(b)),
        ArithOp::Div => {
            if b != 0 {
                Value::Int(a.wrapping_div(b))
            } else {
                Value::Int(0)
            }
        }
        ArithOp::Mod => {
            if b != 0 {
                Value::Int(a.wrapping_rem(b))
            } else {
                Value::Int(0)
            }
        }
    }
}

/// Negate a value: floats stay float, everything else negates as int.
pub fn negate(val: &Value) -> Value {
    match val {
        Value::Float(x) => Value::Float(-x),
        other => Value::Int(other.as_int().wrapping_neg()),
    }
}
