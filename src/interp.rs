//! Text interpolation for dialogue and choice strings.
//!
//! Recognized inside any presented string:
//! - `{name}` — variable lookup, stringified
//! - `{visit_count("n")}`, `{visited("n")}`, `{len("var")}` — built-in calls,
//!   quotes optional
//! - `{if cond}...{else}...{endif}` — inline conditional; nests, and the
//!   chosen branch is re-interpolated recursively up to a fixed depth
//!
//! An unmatched `{` is kept as literal text; interpolation never fails.

use crate::value::{self, CmpOp, Value};
use std::collections::HashMap;

/// Maximum `{if}` re-interpolation depth.
const MAX_DEPTH: usize = 16;

/// Read-only state interpolation can observe.
pub struct InterpEnv<'a> {
    pub variables: &'a HashMap<String, Value>,
    pub visit_counts: &'a HashMap<String, u32>,
}

impl<'a> InterpEnv<'a> {
    fn visit_count(&self, node: &str) -> i32 {
        self.visit_counts.get(node).copied().unwrap_or(0) as i32
    }

    fn list_len(&self, name: &str) -> i32 {
        match self.variables.get(name) {
            Some(Value::List(items)) => items.len() as i32,
            _ => 0,
        }
    }
}

/// Interpolate a string against the given environment.
pub fn interpolate(text: &str, env: &InterpEnv) -> String {
    interpolate_depth(text, env, 0)
}

fn interpolate_depth(text: &str, env: &InterpEnv, depth: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '{' {
            result.push(chars[i]);
            i += 1;
            continue;
        }

        let close = match find_close(&chars, i + 1) {
            Some(pos) => pos,
            None => {
                // Unmatched brace: keep the rest as literal text.
                result.extend(&chars[i..]);
                break;
            }
        };
        let tag: String = chars[i + 1..close].iter().collect();
        i = close + 1;

        if let Some(cond) = tag.strip_prefix("if ") {
            let chosen = collect_branch(&chars, &mut i, evaluate_inline_condition(cond, env));
            if depth < MAX_DEPTH {
                result.push_str(&interpolate_depth(&chosen, env, depth + 1));
            } else {
                result.push_str(&chosen);
            }
        } else if let Some(arg) = call_argument(&tag, "visit_count") {
            result.push_str(&env.visit_count(&arg).to_string());
        } else if let Some(arg) = call_argument(&tag, "visited") {
            result.push_str(if env.visit_count(&arg) > 0 {
                "true"
            } else {
                "false"
            });
        } else if let Some(arg) = call_argument(&tag, "len") {
            result.push_str(&env.list_len(&arg).to_string());
        } else if let Some(val) = env.variables.get(tag.as_str()) {
            result.push_str(&val.to_string());
        }
        // Undefined variables interpolate to nothing.
    }

    result
}

fn find_close(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len()).find(|&j| chars[j] == '}')
}

/// Collect the branch text of an inline conditional starting right after its
/// `{if ...}` tag. Counts nesting so inner conditionals stay intact for the
/// recursive pass; `{else}` switches sides only at depth one. Returns the
/// taken branch and leaves `i` past the matching `{endif}` (or at end of
/// input when the conditional is unterminated).
fn collect_branch(chars: &[char], i: &mut usize, condition: bool) -> String {
    let mut true_branch = String::new();
    let mut false_branch = String::new();
    let mut in_else = false;
    let mut depth = 1usize;

    while *i < chars.len() && depth > 0 {
        if chars[*i] == '{' {
            if let Some(close) = find_close(chars, *i + 1) {
                let inner: String = chars[*i + 1..close].iter().collect();
                let raw: String = chars[*i..=close].iter().collect();
                if inner.starts_with("if ") {
                    depth += 1;
                    branch_push(&mut true_branch, &mut false_branch, in_else, &raw);
                } else if inner == "else" && depth == 1 {
                    in_else = true;
                } else if inner == "endif" {
                    depth -= 1;
                    if depth > 0 {
                        branch_push(&mut true_branch, &mut false_branch, in_else, &raw);
                    }
                } else {
                    branch_push(&mut true_branch, &mut false_branch, in_else, &raw);
                }
                *i = close + 1;
                continue;
            }
        }
        let ch = chars[*i];
        if in_else {
            false_branch.push(ch);
        } else {
            true_branch.push(ch);
        }
        *i += 1;
    }

    if condition {
        true_branch
    } else {
        false_branch
    }
}

fn branch_push(true_branch: &mut String, false_branch: &mut String, in_else: bool, text: &str) {
    if in_else {
        false_branch.push_str(text);
    } else {
        true_branch.push_str(text);
    }
}

/// Extract the argument of `name(...)`, stripping optional quotes.
fn call_argument(tag: &str, name: &str) -> Option<String> {
    let rest = tag.strip_prefix(name)?;
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(strip_quotes(inner).to_string())
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Evaluate the condition of an inline `{if ...}`.
///
/// Grammar: `VAR`, `VAR OP LITERAL`, `FUNC(...)` with optional comparison,
/// and `VALUE in LISTVAR` membership.
pub fn evaluate_inline_condition(cond: &str, env: &InterpEnv) -> bool {
    let cond = cond.trim();
    let (first, rest) = match cond.find(' ') {
        Some(pos) => (&cond[..pos], cond[pos..].trim_start()),
        None => (cond, ""),
    };

    // Left side: built-in call or variable.
    let mut lhs = Value::Int(0);
    let mut is_call = false;
    if let Some(arg) = call_argument(first, "visit_count") {
        lhs = Value::Int(env.visit_count(&arg));
        is_call = true;
    } else if let Some(arg) = call_argument(first, "visited") {
        lhs = Value::Bool(env.visit_count(&arg) > 0);
        is_call = true;
    } else if let Some(arg) = call_argument(first, "len") {
        lhs = Value::Int(env.list_len(&arg));
        is_call = true;
    }

    if rest.is_empty() {
        // Bare form: truthiness. An undefined variable is false.
        if is_call {
            return lhs.truthy();
        }
        return env
            .variables
            .get(first)
            .map(Value::truthy)
            .unwrap_or(false);
    }

    let (op_str, rhs_str) = match rest.find(' ') {
        Some(pos) => (&rest[..pos], rest[pos..].trim()),
        None => (rest, ""),
    };

    if !is_call {
        if let Some(val) = env.variables.get(first) {
            lhs = val.clone();
        }
    }

    // Membership: left side is a value, right side names a list variable.
    if op_str == "in" {
        let needle = if first.starts_with('"') {
            strip_quotes(first).to_string()
        } else if is_call {
            lhs.to_string()
        } else {
            match &lhs {
                Value::Str(s) => s.clone(),
                other => other.to_string(),
            }
        };
        return match env.variables.get(rhs_str) {
            Some(Value::List(items)) => items.contains(&needle),
            _ => false,
        };
    }

    let rhs = parse_literal(rhs_str);
    let op = match op_str {
        "==" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        ">" => CmpOp::Gt,
        "<" => CmpOp::Lt,
        ">=" => CmpOp::Ge,
        "<=" => CmpOp::Le,
        _ => CmpOp::Eq,
    };
    value::compare(&lhs, op, &rhs)
}

fn parse_literal(text: &str) -> Value {
    if text == "true" {
        return Value::Bool(true);
    }
    if text == "false" {
        return Value::Bool(false);
    }
    if text.starts_with('"') {
        return Value::Str(strip_quotes(text).to_string());
    }
    if text.contains('.') {
        return Value::Float(text.parse().unwrap_or(0.0));
    }
    Value::Int(text.parse().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        variables: HashMap<String, Value>,
        visit_counts: HashMap<String, u32>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                variables: HashMap::new(),
                visit_counts: HashMap::new(),
            }
        }

        fn var(mut self, name: &str, val: Value) -> Self {
            self.variables.insert(name.to_string(), val);
            self
        }

        fn run(&self, text: &str) -> String {
            let env = InterpEnv {
                variables: &self.variables,
                visit_counts: &self.visit_counts,
            };
            interpolate(text, &env)
        }
    }

    #[test]
    fn test_basic_substitution() {
        let fx = Fixture::new().var("name", Value::Str("Rin".into()));
        assert_eq!(fx.run("Hello {name}!"), "Hello Rin!");
    }

    #[test]
    fn test_multiple_and_typed() {
        let fx = Fixture::new()
            .var("hp", Value::Int(30))
            .var("brave", Value::Bool(true));
        assert_eq!(fx.run("{hp}/{brave}"), "30/true");
    }

    #[test]
    fn test_undefined_variable_is_empty() {
        let fx = Fixture::new();
        assert_eq!(fx.run("[{ghost}]"), "[]");
    }

    #[test]
    fn test_list_stringification() {
        let fx = Fixture::new().var(
            "bag",
            Value::List(vec!["rope".to_string(), "torch".to_string()]),
        );
        assert_eq!(fx.run("{bag}"), "rope, torch");
    }

    #[test]
    fn test_builtin_calls() {
        let mut fx = Fixture::new().var("bag", Value::List(vec!["rope".to_string()]));
        fx.visit_counts.insert("shop".to_string(), 2);
        assert_eq!(fx.run("{visit_count(\"shop\")}"), "2");
        assert_eq!(fx.run("{visited(shop)}"), "true");
        assert_eq!(fx.run("{visited(\"cave\")}"), "false");
        assert_eq!(fx.run("{len(bag)}"), "1");
    }

    #[test]
    fn test_inline_if_true_branch() {
        let fx = Fixture::new().var("hp", Value::Int(30));
        assert_eq!(fx.run("HP: {hp} {if hp < 50}(low){endif}"), "HP: 30 (low)");
    }

    #[test]
    fn test_inline_if_else_branch() {
        let fx = Fixture::new().var("hp", Value::Int(80));
        assert_eq!(fx.run("{if hp < 50}low{else}fine{endif}"), "fine");
    }

    #[test]
    fn test_inline_if_truthiness_and_undefined() {
        let fx = Fixture::new().var("key", Value::Bool(true));
        assert_eq!(fx.run("{if key}unlocked{endif}"), "unlocked");
        assert_eq!(fx.run("{if missing}x{else}y{endif}"), "y");
    }

    #[test]
    fn test_nested_inline_if() {
        let fx = Fixture::new()
            .var("a", Value::Int(1))
            .var("b", Value::Int(0));
        assert_eq!(
            fx.run("{if a}A{if b}B{else}nb{endif}{else}na{endif}"),
            "Anb"
        );
    }

    #[test]
    fn test_branch_reinterpolates_variables() {
        let fx = Fixture::new()
            .var("ok", Value::Bool(true))
            .var("name", Value::Str("Rin".into()));
        assert_eq!(fx.run("{if ok}hi {name}{endif}"), "hi Rin");
    }

    #[test]
    fn test_membership_condition() {
        let fx = Fixture::new().var("bag", Value::List(vec!["rope".to_string()]));
        assert_eq!(fx.run("{if \"rope\" in bag}have it{endif}"), "have it");
        assert_eq!(fx.run("{if \"gem\" in bag}x{else}no gem{endif}"), "no gem");
    }

    #[test]
    fn test_string_comparison_condition() {
        let fx = Fixture::new().var("mood", Value::Str("angry".into()));
        assert_eq!(fx.run("{if mood == \"angry\"}grr{endif}"), "grr");
    }

    #[test]
    fn test_unmatched_brace_is_literal() {
        let fx = Fixture::new().var("x", Value::Int(1));
        assert_eq!(fx.run("tail {unclosed"), "tail {unclosed");
        assert_eq!(fx.run("{x} then {oops"), "1 then {oops");
    }

    #[test]
    fn test_unterminated_if_consumes_rest() {
        let fx = Fixture::new().var("ok", Value::Bool(true));
        assert_eq!(fx.run("{if ok}rest of line"), "rest of line");
    }
}
