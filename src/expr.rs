//! Expression compiler: infix source to reverse-Polish token streams.
//!
//! Grammar (loosest binding last):
//! - unary `-`, `not` (right associative)
//! - `*`, `/`, `mod`
//! - `+`, `-`
//! - `==`, `!=`, `<`, `<=`, `>`, `>=`, `in`
//! - `and`
//! - `or`
//!
//! Parentheses force grouping. Built-in calls (`visit_count("n")`,
//! `visited("n")`, `len(listvar)`) compile to a single specialized token.
//! Literals are inlined into push-literal tokens; identifiers become
//! push-variable tokens referencing the string pool.

use crate::pool::StringPool;
use crate::story::Literal;
use serde::{Deserialize, Serialize};

/// Opcode of one RPN token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprOp {
    PushLiteral,
    PushVar,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Negate,
    CmpEq,
    CmpNe,
    CmpGt,
    CmpLt,
    CmpGe,
    CmpLe,
    And,
    Or,
    Not,
    VisitCount,
    Visited,
    ListLen,
    ListContains,
}

/// One token of a linearized expression. `literal` is set for `PushLiteral`;
/// `name_id` points at a variable or node name for `PushVar`, `VisitCount`,
/// `Visited`, and `ListLen`, and is -1 otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprToken {
    pub op: ExprOp,
    pub literal: Option<Literal>,
    pub name_id: i32,
}

impl ExprToken {
    pub fn op(op: ExprOp) -> Self {
        ExprToken { op, literal: None, name_id: -1 }
    }

    pub fn literal(lit: Literal) -> Self {
        ExprToken { op: ExprOp::PushLiteral, literal: Some(lit), name_id: -1 }
    }

    pub fn named(op: ExprOp, name_id: i32) -> Self {
        ExprToken { op, literal: None, name_id }
    }
}

/// A compiled expression: an ordered RPN token sequence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Expr {
    pub tokens: Vec<ExprToken>,
}

// ---------------------------------------------------------------------------
// Lexing

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Int(i32),
    Float(f32),
    Str(String),
    Ident(String),
    Sym(&'static str),
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Lexeme>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' => i += 1,
            '(' => {
                out.push(Lexeme::LParen);
                i += 1;
            }
            ')' => {
                out.push(Lexeme::RParen);
                i += 1;
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                        match chars[i] {
                            'n' => s.push('\n'),
                            't' => s.push('\t'),
                            '"' => s.push('"'),
                            '\\' => s.push('\\'),
                            c => s.push(c),
                        }
                    } else {
                        s.push(chars[i]);
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                out.push(Lexeme::Str(s));
            }
            '+' => {
                out.push(Lexeme::Sym("+"));
                i += 1;
            }
            '-' => {
                out.push(Lexeme::Sym("-"));
                i += 1;
            }
            '*' => {
                out.push(Lexeme::Sym("*"));
                i += 1;
            }
            '/' => {
                out.push(Lexeme::Sym("/"));
                i += 1;
            }
            '=' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                out.push(Lexeme::Sym("=="));
                i += 2;
            }
            '!' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                out.push(Lexeme::Sym("!="));
                i += 2;
            }
            '<' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    out.push(Lexeme::Sym("<="));
                    i += 2;
                } else {
                    out.push(Lexeme::Sym("<"));
                    i += 1;
                }
            }
            '>' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    out.push(Lexeme::Sym(">="));
                    i += 2;
                } else {
                    out.push(Lexeme::Sym(">"));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i < chars.len() && chars[i] == '.' {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let v = text
                        .parse::<f32>()
                        .map_err(|_| format!("bad float literal: {}", text))?;
                    out.push(Lexeme::Float(v));
                } else {
                    let v = text
                        .parse::<i32>()
                        .map_err(|_| format!("bad integer literal: {}", text))?;
                    out.push(Lexeme::Int(v));
                }
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Lexeme::Ident(chars[start..i].iter().collect()));
            }
            c => return Err(format!("unexpected character in expression: '{}'", c)),
        }
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Shunting-yard

#[derive(Debug, Clone, Copy, PartialEq)]
enum StackOp {
    Bin(ExprOp, u8),
    Unary(ExprOp),
    Paren,
}

fn binary_op(sym: &str) -> Option<(ExprOp, u8)> {
    // Higher binds tighter. Unary operators sit above all of these.
    match sym {
        "*" => Some((ExprOp::Mul, 5)),
        "/" => Some((ExprOp::Div, 5)),
        "mod" => Some((ExprOp::Mod, 5)),
        "+" => Some((ExprOp::Add, 4)),
        "-" => Some((ExprOp::Sub, 4)),
        "==" => Some((ExprOp::CmpEq, 3)),
        "!=" => Some((ExprOp::CmpNe, 3)),
        ">" => Some((ExprOp::CmpGt, 3)),
        "<" => Some((ExprOp::CmpLt, 3)),
        ">=" => Some((ExprOp::CmpGe, 3)),
        "<=" => Some((ExprOp::CmpLe, 3)),
        "in" => Some((ExprOp::ListContains, 3)),
        "and" => Some((ExprOp::And, 2)),
        "or" => Some((ExprOp::Or, 1)),
        _ => None,
    }
}

fn builtin_op(name: &str) -> Option<ExprOp> {
    match name {
        "visit_count" => Some(ExprOp::VisitCount),
        "visited" => Some(ExprOp::Visited),
        "len" => Some(ExprOp::ListLen),
        _ => None,
    }
}

fn pop_stack_op(op: StackOp, out: &mut Vec<ExprToken>) {
    match op {
        StackOp::Bin(e, _) => out.push(ExprToken::op(e)),
        StackOp::Unary(e) => out.push(ExprToken::op(e)),
        StackOp::Paren => {}
    }
}

/// Compile an infix expression to RPN, interning string literals and
/// identifier names into the pool.
pub fn compile_expr(src: &str, pool: &mut StringPool) -> Result<Expr, String> {
    let lexemes = lex(src)?;
    if lexemes.is_empty() {
        return Err("empty expression".to_string());
    }

    let mut output: Vec<ExprToken> = Vec::new();
    let mut ops: Vec<StackOp> = Vec::new();
    let mut expect_operand = true;
    let mut i = 0;

    while i < lexemes.len() {
        match &lexemes[i] {
            Lexeme::Int(v) => {
                if !expect_operand {
                    return Err("expected operator before number".to_string());
                }
                output.push(ExprToken::literal(Literal::Int(*v)));
                expect_operand = false;
            }
            Lexeme::Float(v) => {
                if !expect_operand {
                    return Err("expected operator before number".to_string());
                }
                output.push(ExprToken::literal(Literal::Float(*v)));
                expect_operand = false;
            }
            Lexeme::Str(s) => {
                if !expect_operand {
                    return Err("expected operator before string".to_string());
                }
                let idx = pool.intern(s);
                output.push(ExprToken::literal(Literal::StringRef(idx)));
                expect_operand = false;
            }
            Lexeme::Ident(word) => {
                if expect_operand {
                    match word.as_str() {
                        "true" => {
                            output.push(ExprToken::literal(Literal::Bool(true)));
                            expect_operand = false;
                        }
                        "false" => {
                            output.push(ExprToken::literal(Literal::Bool(false)));
                            expect_operand = false;
                        }
                        "not" => ops.push(StackOp::Unary(ExprOp::Not)),
                        name => {
                            if let Some(op) = builtin_op(name) {
                                let (arg, consumed) = parse_builtin_arg(&lexemes, i + 1)?;
                                output.push(ExprToken::named(op, pool.intern(&arg)));
                                i += consumed;
                            } else {
                                output.push(ExprToken::named(ExprOp::PushVar, pool.intern(name)));
                            }
                            expect_operand = false;
                        }
                    }
                } else {
                    // Word operators: mod / and / or / in.
                    let (op, prec) = binary_op(word)
                        .ok_or_else(|| format!("unknown operator: {}", word))?;
                    while let Some(top) = ops.last().copied() {
                        match top {
                            StackOp::Unary(_) => {
                                ops.pop();
                                pop_stack_op(top, &mut output);
                            }
                            StackOp::Bin(_, top_prec) if top_prec >= prec => {
                                ops.pop();
                                pop_stack_op(top, &mut output);
                            }
                            _ => break,
                        }
                    }
                    ops.push(StackOp::Bin(op, prec));
                    expect_operand = true;
                }
            }
            Lexeme::Sym(sym) => {
                if expect_operand {
                    if *sym == "-" {
                        ops.push(StackOp::Unary(ExprOp::Negate));
                    } else {
                        return Err(format!("expected operand, found '{}'", sym));
                    }
                } else {
                    let (op, prec) =
                        binary_op(sym).ok_or_else(|| format!("unknown operator: {}", sym))?;
                    while let Some(top) = ops.last().copied() {
                        match top {
                            StackOp::Unary(_) => {
                                ops.pop();
                                pop_stack_op(top, &mut output);
                            }
                            StackOp::Bin(_, top_prec) if top_prec >= prec => {
                                ops.pop();
                                pop_stack_op(top, &mut output);
                            }
                            _ => break,
                        }
                    }
                    ops.push(StackOp::Bin(op, prec));
                    expect_operand = true;
                }
            }
            Lexeme::LParen => {
                if !expect_operand {
                    return Err("unexpected '('".to_string());
                }
                ops.push(StackOp::Paren);
            }
            Lexeme::RParen => {
                if expect_operand {
                    return Err("unexpected ')'".to_string());
                }
                loop {
                    match ops.pop() {
                        Some(StackOp::Paren) => break,
                        Some(op) => pop_stack_op(op, &mut output),
                        None => return Err("unbalanced ')'".to_string()),
                    }
                }
            }
        }
        i += 1;
    }

    if expect_operand {
        return Err("expression ends with an operator".to_string());
    }
    while let Some(op) = ops.pop() {
        if op == StackOp::Paren {
            return Err("unbalanced '('".to_string());
        }
        pop_stack_op(op, &mut output);
    }

    Ok(Expr { tokens: output })
}

/// Parse the `("name")` argument of a built-in call starting at `pos`.
/// Quotes around the argument are optional. Returns the argument text and
/// how many lexemes were consumed.
fn parse_builtin_arg(lexemes: &[Lexeme], pos: usize) -> Result<(String, usize), String> {
    match lexemes.get(pos) {
        Some(Lexeme::LParen) => {}
        _ => return Err("expected '(' after built-in function".to_string()),
    }
    let arg = match lexemes.get(pos + 1) {
        Some(Lexeme::Str(s)) => s.clone(),
        Some(Lexeme::Ident(s)) => s.clone(),
        _ => return Err("expected argument in built-in call".to_string()),
    };
    match lexemes.get(pos + 2) {
        Some(Lexeme::RParen) => {}
        _ => return Err("expected ')' after built-in argument".to_string()),
    }
    Ok((arg, 3))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops_of(expr: &Expr) -> Vec<ExprOp> {
        expr.tokens.iter().map(|t| t.op).collect()
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let mut pool = StringPool::new();
        let expr = compile_expr("1 + 2 * 3", &mut pool).unwrap();
        assert_eq!(
            ops_of(&expr),
            vec![
                ExprOp::PushLiteral,
                ExprOp::PushLiteral,
                ExprOp::PushLiteral,
                ExprOp::Mul,
                ExprOp::Add,
            ]
        );
    }

    #[test]
    fn test_parentheses_force_grouping() {
        let mut pool = StringPool::new();
        let expr = compile_expr("(1 + 2) * 3", &mut pool).unwrap();
        assert_eq!(
            ops_of(&expr),
            vec![
                ExprOp::PushLiteral,
                ExprOp::PushLiteral,
                ExprOp::Add,
                ExprOp::PushLiteral,
                ExprOp::Mul,
            ]
        );
    }

    #[test]
    fn test_unary_minus() {
        let mut pool = StringPool::new();
        let expr = compile_expr("-x + 1", &mut pool).unwrap();
        assert_eq!(
            ops_of(&expr),
            vec![
                ExprOp::PushVar,
                ExprOp::Negate,
                ExprOp::PushLiteral,
                ExprOp::Add,
            ]
        );
    }

    #[test]
    fn test_logical_precedence() {
        // and binds tighter than or
        let mut pool = StringPool::new();
        let expr = compile_expr("a or b and c", &mut pool).unwrap();
        assert_eq!(
            ops_of(&expr),
            vec![
                ExprOp::PushVar,
                ExprOp::PushVar,
                ExprOp::PushVar,
                ExprOp::And,
                ExprOp::Or,
            ]
        );
    }

    #[test]
    fn test_not_then_comparison() {
        let mut pool = StringPool::new();
        let expr = compile_expr("not flag and hp > 0", &mut pool).unwrap();
        assert_eq!(
            ops_of(&expr),
            vec![
                ExprOp::PushVar,
                ExprOp::Not,
                ExprOp::PushVar,
                ExprOp::PushLiteral,
                ExprOp::CmpGt,
                ExprOp::And,
            ]
        );
    }

    #[test]
    fn test_builtin_call_single_token() {
        let mut pool = StringPool::new();
        let expr = compile_expr("visit_count(\"shop\") > 2", &mut pool).unwrap();
        assert_eq!(expr.tokens[0].op, ExprOp::VisitCount);
        assert_eq!(pool.get(expr.tokens[0].name_id), Some("shop"));
        // Quotes optional.
        let expr2 = compile_expr("visited(shop)", &mut pool).unwrap();
        assert_eq!(expr2.tokens[0].op, ExprOp::Visited);
    }

    #[test]
    fn test_membership_operator() {
        let mut pool = StringPool::new();
        let expr = compile_expr("\"sword\" in inventory", &mut pool).unwrap();
        assert_eq!(
            ops_of(&expr),
            vec![ExprOp::PushLiteral, ExprOp::PushVar, ExprOp::ListContains]
        );
    }

    #[test]
    fn test_string_literals_are_pooled() {
        let mut pool = StringPool::new();
        let a = compile_expr("\"x\" == \"x\"", &mut pool).unwrap();
        let lit0 = a.tokens[0].literal.clone().unwrap();
        let lit1 = a.tokens[1].literal.clone().unwrap();
        assert_eq!(lit0, lit1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_errors() {
        let mut pool = StringPool::new();
        assert!(compile_expr("", &mut pool).is_err());
        assert!(compile_expr("1 +", &mut pool).is_err());
        assert!(compile_expr("(1 + 2", &mut pool).is_err());
        assert!(compile_expr("1 ~ 2", &mut pool).is_err());
    }
}
