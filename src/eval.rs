//! RPN expression evaluator.
//!
//! A single-valued variant stack machine over compiled token streams. The
//! evaluator never faults: an ill-formed stream (operand missing for a
//! binary operator) aborts the whole evaluation and yields `Int(0)`, unknown
//! variables read as `Int(0)`, and division by zero produces the zero of the
//! result type. Authoring mistakes degrade, they do not crash the host.

use crate::expr::{Expr, ExprOp};
use crate::value::{self, ArithOp, CmpOp, Value};
use std::collections::HashMap;

/// Read-only state an expression can observe.
pub struct EvalContext<'a> {
    pub pool: &'a [String],
    pub variables: &'a HashMap<String, Value>,
    pub visit_counts: &'a HashMap<String, u32>,
}

impl<'a> EvalContext<'a> {
    fn name(&self, idx: i32) -> &str {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.pool.get(i))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    fn visit_count(&self, node: &str) -> i32 {
        self.visit_counts.get(node).copied().unwrap_or(0) as i32
    }
}

/// Evaluate a compiled expression. Returns the top of stack, or `Int(0)` for
/// an empty or aborted evaluation.
pub fn evaluate(expr: &Expr, ctx: &EvalContext) -> Value {
    let mut stack: Vec<Value> = Vec::new();

    for token in &expr.tokens {
        match token.op {
            ExprOp::PushLiteral => match &token.literal {
                Some(lit) => stack.push(lit.to_value(ctx.pool)),
                None => stack.push(Value::Int(0)),
            },
            ExprOp::PushVar => {
                let name = ctx.name(token.name_id);
                stack.push(ctx.variables.get(name).cloned().unwrap_or(Value::Int(0)));
            }
            ExprOp::Add | ExprOp::Sub | ExprOp::Mul | ExprOp::Div | ExprOp::Mod => {
                let (lhs, rhs) = match pop_pair(&mut stack) {
                    Some(pair) => pair,
                    None => return Value::Int(0),
                };
                let op = match token.op {
                    ExprOp::Add => ArithOp::Add,
                    ExprOp::Sub => ArithOp::Sub,
                    ExprOp::Mul => ArithOp::Mul,
                    ExprOp::Div => ArithOp::Div,
                    _ => ArithOp::Mod,
                };
                stack.push(value::arithmetic(&lhs, op, &rhs));
            }
            ExprOp::Negate => {
                let val = match stack.pop() {
                    Some(v) => v,
                    None => return Value::Int(0),
                };
                stack.push(value::negate(&val));
            }
            ExprOp::CmpEq
            | ExprOp::CmpNe
            | ExprOp::CmpGt
            | ExprOp::CmpLt
            | ExprOp::CmpGe
            | ExprOp::CmpLe => {
                let (lhs, rhs) = match pop_pair(&mut stack) {
                    Some(pair) => pair,
                    None => return Value::Int(0),
                };
                let op = match token.op {
                    ExprOp::CmpEq => CmpOp::Eq,
                    ExprOp::CmpNe => CmpOp::Ne,
                    ExprOp::CmpGt => CmpOp::Gt,
                    ExprOp::CmpLt => CmpOp::Lt,
                    ExprOp::CmpGe => CmpOp::Ge,
                    _ => CmpOp::Le,
                };
                stack.push(Value::Bool(value::compare(&lhs, op, &rhs)));
            }
            ExprOp::And => {
                let (lhs, rhs) = match pop_pair(&mut stack) {
                    Some(pair) => pair,
                    None => return Value::Int(0),
                };
                stack.push(Value::Bool(lhs.truthy() && rhs.truthy()));
            }
            ExprOp::Or => {
                let (lhs, rhs) = match pop_pair(&mut stack) {
                    Some(pair) => pair,
                    None => return Value::Int(0),
                };
                stack.push(Value::Bool(lhs.truthy() || rhs.truthy()));
            }
            ExprOp::Not => {
                let val = match stack.pop() {
                    Some(v) => v,
                    None => return Value::Int(0),
                };
                stack.push(Value::Bool(!val.truthy()));
            }
            ExprOp::VisitCount => {
                let node = ctx.name(token.name_id);
                stack.push(Value::Int(ctx.visit_count(node)));
            }
            ExprOp::Visited => {
                let node = ctx.name(token.name_id);
                stack.push(Value::Bool(ctx.visit_count(node) > 0));
            }
            ExprOp::ListLen => {
                let name = ctx.name(token.name_id);
                let len = match ctx.variables.get(name) {
                    Some(Value::List(items)) => items.len() as i32,
                    _ => 0,
                };
                stack.push(Value::Int(len));
            }
            ExprOp::ListContains => {
                let (needle, list) = match pop_pair(&mut stack) {
                    Some(pair) => pair,
                    None => return Value::Int(0),
                };
                let found = match list {
                    Value::List(items) => {
                        let needle = match needle {
                            Value::Str(s) => s,
                            other => other.to_string(),
                        };
                        items.contains(&needle)
                    }
                    _ => false,
                };
                stack.push(Value::Bool(found));
            }
        }
    }

    stack.pop().unwrap_or(Value::Int(0))
}

fn pop_pair(stack: &mut Vec<Value>) -> Option<(Value, Value)> {
    if stack.len() < 2 {
        return None;
    }
    let rhs = stack.pop()?;
    let lhs = stack.pop()?;
    Some((lhs, rhs))
}
