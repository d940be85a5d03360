//! Line-oriented compiler front end for `.skein` source.
//!
//! Recognized line kinds (leading token after trimming):
//! - `label NAME[(p1, p2)][:][ #tag[=value]…]` — opens a node
//! - `$ name = expr` — assignment; before the first label it initializes a global
//! - `char "text"` / `"text"` — dialogue / narration, with `#key[:value]` tags
//! - `jump NAME` / `call NAME[(args)]` / `$ var = call NAME[(args)]` / `return [expr]`
//! - `menu:` with indented `"text" -> NAME [if var] [once|sticky|fallback]` lines
//! - `random:` with indented `[weight] -> NAME` lines (missing weight = 1)
//! - `if cond -> TRUE [else FALSE]`, then optional `elif … -> T` / `else -> T`
//! - `@ cmd params…` — host command
//! - `import "path"` — registered; resolution belongs to the embedding layer
//! - `character ID [#key:value…]` — character definition
//! - comments (`#…`) and blank lines are skipped
//!
//! Errors accumulate and parsing continues with the next line, so one bad
//! line does not hide downstream problems. Compilation fails iff any
//! diagnostic was emitted.

use crate::expr::{compile_expr, Expr};
use crate::locale::csv_field;
use crate::pool::{format_line_id, StringPool};
use crate::story::{
    AssignMode, Character, ChoiceModifier, CondOperand, CondTest, GlobalVar, Instruction, Literal,
    Node, RandomBranch, Story, Tag, STORY_FORMAT_VERSION,
};
use crate::validate::check_references;
use crate::value::CmpOp;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// One compiler diagnostic, tied to a source position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{file}:{line}: {message}")]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub message: String,
}

/// Row type of the translatable-string export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Line,
    Choice,
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportKind::Line => write!(f, "LINE"),
            ExportKind::Choice => write!(f, "CHOICE"),
        }
    }
}

/// One translatable string, as exported to the localization CSV.
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub line_id: String,
    pub kind: ExportKind,
    pub node: String,
    pub character: String,
    pub text: String,
}

/// Maps emitted instructions back to source lines for late diagnostics.
#[derive(Debug, Default)]
pub struct SourceMap {
    instr: HashMap<(usize, usize), u32>,
    branches: HashMap<(usize, usize, usize), u32>,
}

impl SourceMap {
    pub fn instr_line(&self, node: usize, instr: usize) -> u32 {
        self.instr.get(&(node, instr)).copied().unwrap_or(0)
    }

    pub fn branch_line(&self, node: usize, instr: usize, branch: usize) -> Option<u32> {
        self.branches.get(&(node, instr, branch)).copied()
    }
}

/// Result of a successful compilation.
#[derive(Debug)]
pub struct Compilation {
    pub story: Story,
    pub imports: Vec<String>,
    pub exports: Vec<ExportEntry>,
    pub source_map: SourceMap,
}

impl Compilation {
    /// Render the translatable-string export CSV
    /// (`line_id,type,node,character,text`).
    pub fn strings_csv(&self) -> String {
        let mut out = String::from("line_id,type,node,character,text\n");
        for entry in &self.exports {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                csv_field(&entry.line_id),
                entry.kind,
                csv_field(&entry.node),
                csv_field(&entry.character),
                csv_field(&entry.text)
            ));
        }
        out
    }
}

/// Compile skein source into a story tree, validating references.
pub fn compile_source(source: &str, filename: &str) -> Result<Compilation, Vec<Diagnostic>> {
    Parser::new(filename).run(source)
}

#[derive(Debug, Clone, Copy)]
struct IfChain {
    inline_else: bool,
}

struct Parser {
    filename: String,
    pool: StringPool,
    nodes: Vec<Node>,
    global_vars: Vec<GlobalVar>,
    characters: Vec<Character>,
    start_node_name: String,
    errors: Vec<Diagnostic>,
    imports: Vec<String>,
    exports: Vec<ExportEntry>,
    map: SourceMap,
    current: Option<usize>,
    seen_first_label: bool,
    in_menu: bool,
    random: Option<(usize, usize)>,
    if_chain: Option<IfChain>,
    /// Per-node counter of translatable strings, part of the line id.
    ordinal: u32,
}

impl Parser {
    fn new(filename: &str) -> Self {
        Parser {
            filename: filename.to_string(),
            pool: StringPool::new(),
            nodes: Vec::new(),
            global_vars: Vec::new(),
            characters: Vec::new(),
            start_node_name: String::new(),
            errors: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            map: SourceMap::default(),
            current: None,
            seen_first_label: false,
            in_menu: false,
            random: None,
            if_chain: None,
            ordinal: 0,
        }
    }

    fn run(mut self, source: &str) -> Result<Compilation, Vec<Diagnostic>> {
        for (i, raw) in source.lines().enumerate() {
            self.handle_line(raw, (i + 1) as u32);
        }

        if self.nodes.is_empty() {
            self.error(0, "source defines no label");
        }

        let (string_pool, line_ids) = self.pool.into_tables();
        let story = Story {
            version: STORY_FORMAT_VERSION.to_string(),
            start_node_name: self.start_node_name,
            string_pool,
            line_ids,
            nodes: self.nodes,
            global_vars: self.global_vars,
            characters: self.characters,
        };

        let mut errors = self.errors;
        errors.extend(check_references(&story, &self.map, &self.filename));
        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Compilation {
            story,
            imports: self.imports,
            exports: self.exports,
            source_map: self.map,
        })
    }

    fn error(&mut self, line: u32, message: impl Into<String>) {
        self.errors.push(Diagnostic {
            file: self.filename.clone(),
            line,
            message: message.into(),
        });
    }

    fn handle_line(&mut self, raw: &str, line_no: u32) {
        let content = raw.trim();
        if content.is_empty() || content.starts_with('#') {
            return;
        }

        if self.random.is_some() {
            if self.try_random_branch(content, line_no) {
                return;
            }
            self.random = None;
        }

        if self.in_menu && content.starts_with('"') && find_arrow_str(content).is_some() {
            self.parse_menu_choice(content, line_no);
            return;
        }
        self.in_menu = false;

        let first = content.split_whitespace().next().unwrap_or("");
        if first != "elif" && first != "else" {
            self.if_chain = None;
        }

        match first {
            "label" => self.parse_label(&content[5..], line_no),
            "jump" => self.parse_jump(&content[4..], line_no),
            "call" => self.parse_call(&content[4..], line_no),
            "return" => self.parse_return(&content[6..], line_no),
            "menu:" => self.open_menu(line_no),
            "random:" => self.open_random(line_no),
            "if" => self.parse_if(&content[2..], line_no, false),
            "elif" => self.parse_elif(&content[4..], line_no),
            "else" => self.parse_else(&content[4..], line_no),
            "import" => self.parse_import(&content[6..], line_no),
            "character" => self.parse_character(&content[9..], line_no),
            _ => {
                if content.starts_with('$') {
                    self.parse_dollar(&content[1..], line_no);
                } else if content.starts_with('@') {
                    self.parse_command(&content[1..], line_no);
                } else {
                    self.parse_dialogue(content, line_no);
                }
            }
        }
    }

    // --- node management ---

    fn require_node(&mut self, line_no: u32, what: &str) -> Option<usize> {
        match self.current {
            Some(idx) => Some(idx),
            None => {
                self.error(line_no, format!("{} outside of label", what));
                None
            }
        }
    }

    fn push_instr(&mut self, node: usize, instr: Instruction, line_no: u32) -> usize {
        let idx = self.nodes[node].lines.len();
        self.nodes[node].lines.push(instr);
        self.map.instr.insert((node, idx), line_no);
        idx
    }

    /// Intern a translatable string, assigning its stable line id and export
    /// row on first sight. Deduplicated strings keep their first id.
    fn add_translatable(&mut self, text: &str, kind: ExportKind, character: &str) -> i32 {
        let idx = self.pool.intern(text);
        let node = match self.current {
            Some(n) => self.nodes[n].name.clone(),
            None => String::new(),
        };
        let line_id = format_line_id(&node, self.ordinal, text);
        if self.pool.set_line_id(idx, &line_id) {
            self.ordinal += 1;
            self.exports.push(ExportEntry {
                line_id,
                kind,
                node,
                character: character.to_string(),
                text: text.to_string(),
            });
        }
        idx
    }

    // --- line parsers ---

    fn parse_label(&mut self, rest: &str, line_no: u32) {
        let chars: Vec<char> = rest.chars().collect();
        let mut pos = 0;
        skip_spaces(&chars, &mut pos);

        let mut name = String::new();
        while pos < chars.len()
            && !chars[pos].is_whitespace()
            && chars[pos] != '('
            && chars[pos] != ':'
        {
            name.push(chars[pos]);
            pos += 1;
        }
        if name.is_empty() {
            self.error(line_no, "label name is empty");
            return;
        }

        let mut params = Vec::new();
        if pos < chars.len() && chars[pos] == '(' {
            pos += 1;
            loop {
                skip_spaces(&chars, &mut pos);
                if pos >= chars.len() {
                    self.error(line_no, "expected ')' in parameter list");
                    break;
                }
                if chars[pos] == ')' {
                    pos += 1;
                    break;
                }
                if chars[pos] == ',' {
                    pos += 1;
                    continue;
                }
                let param = parse_ident(&chars, &mut pos);
                if param.is_empty() {
                    self.error(line_no, "expected parameter name");
                    break;
                }
                params.push(self.pool.intern(&param));
            }
        }
        if pos < chars.len() && chars[pos] == ':' {
            pos += 1;
        }

        let tags = self.parse_tags(&chars, &mut pos, '=');

        if self.nodes.iter().any(|n| n.name == name) {
            self.error(line_no, format!("duplicate node name: {}", name));
        }

        self.nodes.push(Node {
            name: name.clone(),
            params,
            tags,
            lines: Vec::new(),
        });
        self.current = Some(self.nodes.len() - 1);
        self.ordinal = 0;
        self.in_menu = false;
        self.random = None;

        if !self.seen_first_label {
            self.start_node_name = name;
            self.seen_first_label = true;
        }
    }

    fn parse_dialogue(&mut self, content: &str, line_no: u32) {
        let node = match self.require_node(line_no, "dialogue") {
            Some(n) => n,
            None => return,
        };

        let chars: Vec<char> = content.chars().collect();
        let mut pos = 0;
        skip_spaces(&chars, &mut pos);

        let (character_id, character_name) = if chars.get(pos) == Some(&'"') {
            (-1, String::new())
        } else {
            let name = parse_word(&chars, &mut pos);
            skip_spaces(&chars, &mut pos);
            if chars.get(pos) != Some(&'"') {
                self.error(line_no, format!("unrecognized line: {}", content));
                return;
            }
            let id = self.pool.intern(&name);
            (id, name)
        };

        let text = match parse_quoted(&chars, &mut pos) {
            Some(t) => t,
            None => {
                self.error(line_no, "expected quoted string");
                return;
            }
        };

        skip_spaces(&chars, &mut pos);
        if chars.get(pos) == Some(&'-') && chars.get(pos + 1) == Some(&'>') {
            self.error(line_no, "choice outside of menu");
            return;
        }

        let tags = self.parse_tags(&chars, &mut pos, ':');
        let voice_asset_id = tags
            .iter()
            .find(|t| self.pool.get(t.key_id) == Some("voice"))
            .map(|t| t.value_id)
            .unwrap_or(-1);

        let text_id = self.add_translatable(&text, ExportKind::Line, &character_name);
        self.push_instr(
            node,
            Instruction::Line {
                character_id,
                text_id,
                voice_asset_id,
                tags,
            },
            line_no,
        );
    }

    fn open_menu(&mut self, line_no: u32) {
        if self.require_node(line_no, "menu").is_some() {
            self.in_menu = true;
        }
    }

    fn parse_menu_choice(&mut self, content: &str, line_no: u32) {
        let node = match self.require_node(line_no, "choice") {
            Some(n) => n,
            None => return,
        };

        let chars: Vec<char> = content.chars().collect();
        let mut pos = 0;
        let text = match parse_quoted(&chars, &mut pos) {
            Some(t) => t,
            None => {
                self.error(line_no, "expected quoted string for choice text");
                return;
            }
        };

        skip_spaces(&chars, &mut pos);
        if chars.get(pos) != Some(&'-') || chars.get(pos + 1) != Some(&'>') {
            self.error(line_no, "expected '->' after choice text");
            return;
        }
        pos += 2;

        let target = parse_word(&chars, &mut pos);
        if target.is_empty() {
            self.error(line_no, "expected target node name after '->'");
            return;
        }

        let mut condition_var_id = -1;
        let mut modifier = ChoiceModifier::Default;
        loop {
            skip_spaces(&chars, &mut pos);
            if pos >= chars.len() {
                break;
            }
            let word = parse_word(&chars, &mut pos);
            match word.as_str() {
                "if" => {
                    let var = parse_word(&chars, &mut pos);
                    if var.is_empty() {
                        self.error(line_no, "expected variable name after 'if'");
                    } else {
                        condition_var_id = self.pool.intern(&var);
                    }
                }
                "once" => modifier = ChoiceModifier::Once,
                "sticky" => modifier = ChoiceModifier::Sticky,
                "fallback" => modifier = ChoiceModifier::Fallback,
                "" => break,
                other => {
                    self.error(line_no, format!("unexpected token after choice: {}", other));
                    break;
                }
            }
        }

        let text_id = self.add_translatable(&text, ExportKind::Choice, "");
        let target_id = self.pool.intern(&target);
        self.push_instr(
            node,
            Instruction::Choice {
                text_id,
                target_id,
                condition_var_id,
                modifier,
            },
            line_no,
        );
    }

    fn parse_jump(&mut self, rest: &str, line_no: u32) {
        let node = match self.require_node(line_no, "jump") {
            Some(n) => n,
            None => return,
        };
        let target = rest.trim();
        if target.is_empty() {
            self.error(line_no, "expected target node name");
            return;
        }
        let target_id = self.pool.intern(target);
        self.push_instr(
            node,
            Instruction::Jump {
                target_id,
                is_call: false,
                args: Vec::new(),
            },
            line_no,
        );
    }

    fn parse_call(&mut self, rest: &str, line_no: u32) {
        let node = match self.require_node(line_no, "call") {
            Some(n) => n,
            None => return,
        };
        if let Some((target_id, args)) = self.parse_call_target(rest, line_no) {
            self.push_instr(
                node,
                Instruction::Jump {
                    target_id,
                    is_call: true,
                    args,
                },
                line_no,
            );
        }
    }

    /// Parse `NAME[(arg, …)]`, compiling each argument expression.
    fn parse_call_target(&mut self, src: &str, line_no: u32) -> Option<(i32, Vec<Expr>)> {
        let src = src.trim();
        let (name, args_src) = match src.find('(') {
            Some(p) => {
                if !src.ends_with(')') {
                    self.error(line_no, "expected ')' after call arguments");
                    return None;
                }
                (src[..p].trim(), Some(&src[p + 1..src.len() - 1]))
            }
            None => (src, None),
        };
        if name.is_empty() {
            self.error(line_no, "expected target node name");
            return None;
        }

        let mut args = Vec::new();
        if let Some(list) = args_src {
            for part in split_args(list) {
                if part.trim().is_empty() {
                    continue;
                }
                match compile_expr(&part, &mut self.pool) {
                    Ok(expr) => args.push(expr),
                    Err(msg) => self.error(line_no, format!("invalid argument: {}", msg)),
                }
            }
        }
        Some((self.pool.intern(name), args))
    }

    fn parse_return(&mut self, rest: &str, line_no: u32) {
        let node = match self.require_node(line_no, "return") {
            Some(n) => n,
            None => return,
        };
        let rest = rest.trim();
        let (expr, value) = if rest.is_empty() {
            (None, None)
        } else if let Some(lit) = self.parse_literal_text(rest) {
            (None, Some(lit))
        } else {
            match compile_expr(rest, &mut self.pool) {
                Ok(e) => (Some(e), None),
                Err(msg) => {
                    self.error(line_no, format!("invalid return expression: {}", msg));
                    return;
                }
            }
        };
        self.push_instr(node, Instruction::Return { expr, value }, line_no);
    }

    fn parse_dollar(&mut self, rest: &str, line_no: u32) {
        let chars: Vec<char> = rest.chars().collect();
        let mut pos = 0;
        skip_spaces(&chars, &mut pos);
        let name = parse_ident(&chars, &mut pos);
        if name.is_empty() {
            self.error(line_no, "expected variable name after '$'");
            return;
        }

        skip_spaces(&chars, &mut pos);
        let mode = if chars.get(pos) == Some(&'+') && chars.get(pos + 1) == Some(&'=') {
            pos += 2;
            AssignMode::Append
        } else if chars.get(pos) == Some(&'-') && chars.get(pos + 1) == Some(&'=') {
            pos += 2;
            AssignMode::Remove
        } else if chars.get(pos) == Some(&'=') {
            pos += 1;
            AssignMode::Assign
        } else {
            self.error(line_no, "expected '=' after variable name");
            return;
        };

        let value_src: String = chars[pos..].iter().collect();
        let value_src = value_src.trim().to_string();
        if value_src.is_empty() {
            self.error(line_no, "expected value after '='");
            return;
        }

        // $ var = call NAME(args) lowers to a call with a return binding.
        if value_src == "call" || value_src.starts_with("call ") || value_src.starts_with("call(")
        {
            let node = match self.require_node(line_no, "call") {
                Some(n) => n,
                None => return,
            };
            if mode != AssignMode::Assign {
                self.error(line_no, "call result requires plain assignment");
                return;
            }
            let call_src = value_src.trim_start_matches("call");
            if let Some((target_id, args)) = self.parse_call_target(call_src, line_no) {
                let return_var_id = self.pool.intern(&name);
                self.push_instr(
                    node,
                    Instruction::CallWithReturn {
                        target_id,
                        return_var_id,
                        args,
                    },
                    line_no,
                );
            }
            return;
        }

        let (expr, value) = if let Some(lit) = self.parse_literal_text(&value_src) {
            (None, Some(lit))
        } else {
            match compile_expr(&value_src, &mut self.pool) {
                Ok(e) => (Some(e), None),
                Err(msg) => {
                    self.error(line_no, format!("invalid expression: {}", msg));
                    return;
                }
            }
        };

        let var_id = self.pool.intern(&name);
        match self.current {
            Some(node) => {
                self.push_instr(
                    node,
                    Instruction::SetVar {
                        var_id,
                        mode,
                        expr,
                        value,
                    },
                    line_no,
                );
            }
            None => {
                // Before the first label: a global initializer.
                if mode != AssignMode::Assign {
                    self.error(line_no, "global initializer requires plain assignment");
                    return;
                }
                self.global_vars.push(GlobalVar { var_id, expr, value });
            }
        }
    }

    fn parse_if(&mut self, rest: &str, line_no: u32, is_elif: bool) {
        let node = match self.require_node(line_no, if is_elif { "elif" } else { "if" }) {
            Some(n) => n,
            None => return,
        };

        let chars: Vec<char> = rest.chars().collect();
        let arrow = match find_arrow(&chars) {
            Some(p) => p,
            None => {
                self.error(line_no, "expected '->' in condition");
                return;
            }
        };
        let cond_src: String = chars[..arrow].iter().collect();
        let cond_src = cond_src.trim().to_string();
        if cond_src.is_empty() {
            self.error(line_no, "empty condition");
            return;
        }

        let tail: Vec<char> = chars[arrow + 2..].to_vec();
        let mut pos = 0;
        let true_target = parse_word(&tail, &mut pos);
        if true_target.is_empty() {
            self.error(line_no, "expected target node name after '->'");
            return;
        }

        let mut false_target = None;
        skip_spaces(&tail, &mut pos);
        if pos < tail.len() {
            let word = parse_word(&tail, &mut pos);
            if word == "else" {
                let target = parse_word(&tail, &mut pos);
                if target.is_empty() {
                    self.error(line_no, "expected target node name after 'else'");
                    return;
                }
                false_target = Some(target);
            } else if !word.is_empty() {
                self.error(line_no, format!("unexpected token after target: {}", word));
                return;
            }
        }

        let test = match self.compile_condition(&cond_src, line_no) {
            Some(t) => t,
            None => return,
        };

        let true_target_id = self.pool.intern(&true_target);
        let false_target_id = match &false_target {
            Some(t) => self.pool.intern(t),
            None => -1,
        };
        self.push_instr(
            node,
            Instruction::Condition {
                test,
                true_target_id,
                false_target_id,
            },
            line_no,
        );
        self.if_chain = Some(IfChain {
            inline_else: false_target.is_some(),
        });
    }

    fn parse_elif(&mut self, rest: &str, line_no: u32) {
        match self.if_chain {
            None => {
                self.error(line_no, "elif without a preceding if");
            }
            Some(IfChain { inline_else: true }) => {
                self.error(line_no, "elif cannot follow an if with an inline else");
            }
            Some(IfChain { inline_else: false }) => self.parse_if(rest, line_no, true),
        }
    }

    fn parse_else(&mut self, rest: &str, line_no: u32) {
        match self.if_chain.take() {
            None => {
                self.error(line_no, "else without a preceding if");
                return;
            }
            Some(IfChain { inline_else: true }) => {
                self.error(line_no, "else cannot follow an if with an inline else");
                return;
            }
            Some(IfChain { inline_else: false }) => {}
        }
        let node = match self.require_node(line_no, "else") {
            Some(n) => n,
            None => return,
        };

        let chars: Vec<char> = rest.chars().collect();
        let mut pos = 0;
        skip_spaces(&chars, &mut pos);
        if chars.get(pos) != Some(&'-') || chars.get(pos + 1) != Some(&'>') {
            self.error(line_no, "expected '->' after 'else'");
            return;
        }
        pos += 2;
        let target = parse_word(&chars, &mut pos);
        if target.is_empty() {
            self.error(line_no, "expected target node name after '->'");
            return;
        }
        let target_id = self.pool.intern(&target);
        self.push_instr(
            node,
            Instruction::Jump {
                target_id,
                is_call: false,
                args: Vec::new(),
            },
            line_no,
        );
    }

    /// Simple `VAR OP LITERAL` conditions keep the decomposed encoding;
    /// anything richer goes through the expression compiler.
    fn compile_condition(&mut self, cond: &str, line_no: u32) -> Option<CondTest> {
        let tokens: Vec<&str> = cond.split_whitespace().collect();
        if tokens.len() == 3 && is_ident(tokens[0]) {
            if let Some(op) = cmp_op_of(tokens[1]) {
                if let Some(lit) = self.parse_literal_text(tokens[2]) {
                    return Some(CondTest::Compare {
                        lhs: CondOperand::Var(self.pool.intern(tokens[0])),
                        op,
                        rhs: CondOperand::Literal(lit),
                    });
                }
            }
        }
        match compile_expr(cond, &mut self.pool) {
            Ok(expr) => Some(CondTest::Expr(expr)),
            Err(msg) => {
                self.error(line_no, format!("invalid condition: {}", msg));
                None
            }
        }
    }

    fn open_random(&mut self, line_no: u32) {
        let node = match self.require_node(line_no, "random") {
            Some(n) => n,
            None => return,
        };
        let idx = self.push_instr(
            node,
            Instruction::Random {
                branches: Vec::new(),
            },
            line_no,
        );
        self.random = Some((node, idx));
    }

    fn try_random_branch(&mut self, content: &str, line_no: u32) -> bool {
        let (node, instr) = match self.random {
            Some(r) => r,
            None => return false,
        };

        let chars: Vec<char> = content.chars().collect();
        let mut pos = 0;
        skip_spaces(&chars, &mut pos);

        let mut weight = 1i32;
        if chars.get(pos).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            let mut digits = String::new();
            while chars.get(pos).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                digits.push(chars[pos]);
                pos += 1;
            }
            weight = digits.parse().unwrap_or(1);
            skip_spaces(&chars, &mut pos);
        }

        if chars.get(pos) != Some(&'-') || chars.get(pos + 1) != Some(&'>') {
            return false;
        }
        pos += 2;

        let target = parse_word(&chars, &mut pos);
        if target.is_empty() {
            self.error(line_no, "expected target node name after '->'");
            return true;
        }
        let target_id = self.pool.intern(&target);

        if let Instruction::Random { branches } = &mut self.nodes[node].lines[instr] {
            let branch_idx = branches.len();
            branches.push(RandomBranch { weight, target_id });
            self.map.branches.insert((node, instr, branch_idx), line_no);
        }
        true
    }

    fn parse_command(&mut self, rest: &str, line_no: u32) {
        let node = match self.require_node(line_no, "command") {
            Some(n) => n,
            None => return,
        };

        let chars: Vec<char> = rest.chars().collect();
        let mut pos = 0;
        let cmd_type = parse_word(&chars, &mut pos);
        if cmd_type.is_empty() {
            self.error(line_no, "expected command type after '@'");
            return;
        }
        let type_id = self.pool.intern(&cmd_type);

        let mut params = Vec::new();
        loop {
            skip_spaces(&chars, &mut pos);
            if pos >= chars.len() {
                break;
            }
            let param = if chars[pos] == '"' {
                match parse_quoted(&chars, &mut pos) {
                    Some(p) => p,
                    None => break,
                }
            } else {
                let word = parse_word(&chars, &mut pos);
                if word.is_empty() {
                    break;
                }
                word
            };
            params.push(self.pool.intern(&param));
        }

        self.push_instr(node, Instruction::Command { type_id, params }, line_no);
    }

    fn parse_import(&mut self, rest: &str, line_no: u32) {
        let chars: Vec<char> = rest.chars().collect();
        let mut pos = 0;
        skip_spaces(&chars, &mut pos);
        match parse_quoted(&chars, &mut pos) {
            Some(path) if !path.is_empty() => self.imports.push(path),
            _ => self.error(line_no, "expected quoted path after 'import'"),
        }
    }

    fn parse_character(&mut self, rest: &str, line_no: u32) {
        let chars: Vec<char> = rest.chars().collect();
        let mut pos = 0;
        let id = parse_word(&chars, &mut pos);
        if id.is_empty() {
            self.error(line_no, "expected character id");
            return;
        }
        let name_id = self.pool.intern(&id);
        let properties = self.parse_tags(&chars, &mut pos, ':');
        self.characters.push(Character {
            name_id,
            properties,
        });
    }

    /// Parse trailing `#key<sep>value` metadata. Dialogue tags use ':' as the
    /// separator, label tags use '='.
    fn parse_tags(&mut self, chars: &[char], pos: &mut usize, sep: char) -> Vec<Tag> {
        let mut tags = Vec::new();
        loop {
            skip_spaces(chars, pos);
            if chars.get(*pos) != Some(&'#') {
                break;
            }
            *pos += 1;
            let token = parse_word(chars, pos);
            if token.is_empty() {
                break;
            }
            let (key, value) = match token.find(sep) {
                Some(p) => (&token[..p], &token[p + 1..]),
                None => (token.as_str(), ""),
            };
            let key_id = self.pool.intern(key);
            let value_id = self.pool.intern(value);
            tags.push(Tag { key_id, value_id });
        }
        tags
    }

    /// Parse a bare literal: bool, int, float, quoted string, or a
    /// `["a", "b"]` string list. Returns None when the text is not a single
    /// literal (the caller then compiles it as an expression).
    fn parse_literal_text(&mut self, text: &str) -> Option<Literal> {
        let t = text.trim();
        if t == "true" {
            return Some(Literal::Bool(true));
        }
        if t == "false" {
            return Some(Literal::Bool(false));
        }
        if t.starts_with('"') {
            let chars: Vec<char> = t.chars().collect();
            let mut pos = 0;
            let s = parse_quoted(&chars, &mut pos)?;
            if pos == chars.len() {
                return Some(Literal::StringRef(self.pool.intern(&s)));
            }
            return None;
        }
        if t.starts_with('[') && t.ends_with(']') {
            let mut items = Vec::new();
            for part in split_args(&t[1..t.len() - 1]) {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let item = if part.starts_with('"') {
                    let chars: Vec<char> = part.chars().collect();
                    let mut pos = 0;
                    parse_quoted(&chars, &mut pos)?
                } else {
                    part.to_string()
                };
                items.push(self.pool.intern(&item));
            }
            return Some(Literal::ListRef(items));
        }
        if let Ok(i) = t.parse::<i32>() {
            return Some(Literal::Int(i));
        }
        if t.contains('.') {
            if let Ok(f) = t.parse::<f32>() {
                return Some(Literal::Float(f));
            }
        }
        None
    }
}

// --- scanning helpers ---

fn skip_spaces(chars: &[char], pos: &mut usize) {
    while *pos < chars.len() && (chars[*pos] == ' ' || chars[*pos] == '\t') {
        *pos += 1;
    }
}

fn parse_word(chars: &[char], pos: &mut usize) -> String {
    skip_spaces(chars, pos);
    let mut out = String::new();
    while *pos < chars.len() && !chars[*pos].is_whitespace() {
        out.push(chars[*pos]);
        *pos += 1;
    }
    out
}

fn parse_ident(chars: &[char], pos: &mut usize) -> String {
    skip_spaces(chars, pos);
    let mut out = String::new();
    while *pos < chars.len() && (chars[*pos].is_alphanumeric() || chars[*pos] == '_') {
        out.push(chars[*pos]);
        *pos += 1;
    }
    out
}

fn parse_quoted(chars: &[char], pos: &mut usize) -> Option<String> {
    if chars.get(*pos) != Some(&'"') {
        return None;
    }
    *pos += 1;
    let mut out = String::new();
    while *pos < chars.len() && chars[*pos] != '"' {
        if chars[*pos] == '\\' && *pos + 1 < chars.len() {
            *pos += 1;
            match chars[*pos] {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                c => out.push(c),
            }
        } else {
            out.push(chars[*pos]);
        }
        *pos += 1;
    }
    if *pos < chars.len() {
        *pos += 1;
    }
    Some(out)
}

/// Position of the first top-level `->` (outside quotes).
fn find_arrow(chars: &[char]) -> Option<usize> {
    let mut in_quote = false;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '"' => in_quote = !in_quote,
            '\\' if in_quote => i += 1,
            '-' if !in_quote && chars.get(i + 1) == Some(&'>') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn find_arrow_str(content: &str) -> Option<usize> {
    let chars: Vec<char> = content.chars().collect();
    find_arrow(&chars)
}

/// Split on top-level commas, respecting quotes and brackets.
fn split_args(src: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                in_quote = !in_quote;
                cur.push(c);
            }
            '\\' if in_quote => {
                cur.push(c);
                if i + 1 < chars.len() {
                    i += 1;
                    cur.push(chars[i]);
                }
            }
            '(' | '[' if !in_quote => {
                depth += 1;
                cur.push(c);
            }
            ')' | ']' if !in_quote => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            ',' if !in_quote && depth == 0 => {
                parts.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
        i += 1;
    }
    if !cur.trim().is_empty() {
        parts.push(cur);
    }
    parts
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn cmp_op_of(s: &str) -> Option<CmpOp> {
    match s {
        "==" => Some(CmpOp::Eq),
        "!=" => Some(CmpOp::Ne),
        ">" => Some(CmpOp::Gt),
        "<" => Some(CmpOp::Lt),
        ">=" => Some(CmpOp::Ge),
        "<=" => Some(CmpOp::Le),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprOp;

    fn compile(src: &str) -> Compilation {
        compile_source(src, "test.skein").unwrap()
    }

    fn errors_of(src: &str) -> Vec<Diagnostic> {
        compile_source(src, "test.skein").unwrap_err()
    }

    #[test]
    fn test_empty_source_is_an_error() {
        assert!(!errors_of("").is_empty());
        assert!(!errors_of("# only a comment\n").is_empty());
    }

    #[test]
    fn test_single_label_becomes_start() {
        let c = compile("label start:\n    \"hi\"\n");
        assert_eq!(c.story.start_node_name, "start");
        assert_eq!(c.story.nodes.len(), 1);
    }

    #[test]
    fn test_start_node_is_first_label() {
        let c = compile("label intro:\n    \"a\"\nlabel other:\n    \"b\"\n");
        assert_eq!(c.story.start_node_name, "intro");
        assert_eq!(c.story.nodes[1].name, "other");
    }

    #[test]
    fn test_narration_has_no_character() {
        let c = compile("label start:\n    \"alone in the dark\"\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Line {
                character_id,
                text_id,
                ..
            } => {
                assert_eq!(*character_id, -1);
                assert_eq!(c.story.pool_str(*text_id), "alone in the dark");
            }
            other => panic!("expected Line, got {:?}", other),
        }
    }

    #[test]
    fn test_character_dialogue() {
        let c = compile("label start:\n    hero \"hello\"\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Line { character_id, .. } => {
                assert_eq!(c.story.pool_str(*character_id), "hero");
            }
            other => panic!("expected Line, got {:?}", other),
        }
    }

    #[test]
    fn test_escape_sequences() {
        let c = compile("label start:\n    \"line\\none \\\"quoted\\\"\"\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Line { text_id, .. } => {
                assert_eq!(c.story.pool_str(*text_id), "line\none \"quoted\"");
            }
            other => panic!("expected Line, got {:?}", other),
        }
    }

    #[test]
    fn test_menu_choices() {
        let c = compile(
            "label start:\n    menu:\n        \"A\" -> a\n        \"B\" -> b\nlabel a:\n    \"a\"\nlabel b:\n    \"b\"\n",
        );
        assert_eq!(c.story.nodes[0].lines.len(), 2);
        assert!(matches!(
            c.story.nodes[0].lines[0],
            Instruction::Choice { .. }
        ));
        assert!(matches!(
            c.story.nodes[0].lines[1],
            Instruction::Choice { .. }
        ));
    }

    #[test]
    fn test_choice_condition_and_modifiers() {
        let c = compile(
            "label start:\n    menu:\n        \"A\" -> a if has_key once\n        \"B\" -> a fallback\nlabel a:\n    \"a\"\n",
        );
        match &c.story.nodes[0].lines[0] {
            Instruction::Choice {
                condition_var_id,
                modifier,
                ..
            } => {
                assert_eq!(c.story.pool_str(*condition_var_id), "has_key");
                assert_eq!(*modifier, ChoiceModifier::Once);
            }
            other => panic!("expected Choice, got {:?}", other),
        }
        match &c.story.nodes[0].lines[1] {
            Instruction::Choice { modifier, .. } => {
                assert_eq!(*modifier, ChoiceModifier::Fallback)
            }
            other => panic!("expected Choice, got {:?}", other),
        }
    }

    #[test]
    fn test_choice_outside_menu_is_an_error() {
        let errors = errors_of("label start:\n    \"A\" -> start\n");
        assert!(errors[0].message.contains("choice outside of menu"));
    }

    #[test]
    fn test_jump_and_call() {
        let c = compile("label start:\n    jump other\n    call other\nlabel other:\n    \"x\"\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Jump { is_call, .. } => assert!(!is_call),
            other => panic!("expected Jump, got {:?}", other),
        }
        match &c.story.nodes[0].lines[1] {
            Instruction::Jump { is_call, .. } => assert!(is_call),
            other => panic!("expected Jump, got {:?}", other),
        }
    }

    #[test]
    fn test_call_with_arguments() {
        let c = compile(
            "label start:\n    call greet(1 + 2, \"rin\")\nlabel greet(count, name):\n    \"hi\"\n",
        );
        match &c.story.nodes[0].lines[0] {
            Instruction::Jump { is_call, args, .. } => {
                assert!(is_call);
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected Jump, got {:?}", other),
        }
        assert_eq!(c.story.nodes[1].params.len(), 2);
        assert_eq!(c.story.pool_str(c.story.nodes[1].params[0]), "count");
    }

    #[test]
    fn test_call_with_return_binding() {
        let c =
            compile("label start:\n    $ r = call helper(2)\nlabel helper(n):\n    return n\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::CallWithReturn {
                return_var_id,
                args,
                ..
            } => {
                assert_eq!(c.story.pool_str(*return_var_id), "r");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected CallWithReturn, got {:?}", other),
        }
        match &c.story.nodes[1].lines[0] {
            Instruction::Return { expr, .. } => assert!(expr.is_some()),
            other => panic!("expected Return, got {:?}", other),
        }
    }

    #[test]
    fn test_setvar_literals() {
        let c = compile(
            "label start:\n    $ b = true\n    $ i = 42\n    $ f = 2.5\n    $ s = \"hi\"\n    $ l = [\"a\", \"b\"]\n",
        );
        let lits: Vec<&Literal> = c.story.nodes[0]
            .lines
            .iter()
            .map(|i| match i {
                Instruction::SetVar { value: Some(v), .. } => v,
                other => panic!("expected literal SetVar, got {:?}", other),
            })
            .collect();
        assert_eq!(lits[0], &Literal::Bool(true));
        assert_eq!(lits[1], &Literal::Int(42));
        assert_eq!(lits[2], &Literal::Float(2.5));
        assert!(matches!(lits[3], Literal::StringRef(_)));
        assert!(matches!(lits[4], Literal::ListRef(items) if items.len() == 2));
    }

    #[test]
    fn test_setvar_expression_precedence() {
        let c = compile("label start:\n    $ x = 2 + 3 * 4\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::SetVar { expr: Some(e), .. } => {
                let last = e.tokens.last().unwrap();
                assert_eq!(last.op, ExprOp::Add);
            }
            other => panic!("expected expression SetVar, got {:?}", other),
        }
    }

    #[test]
    fn test_setvar_list_modes() {
        let c = compile("label start:\n    $ bag += \"rope\"\n    $ bag -= \"rope\"\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::SetVar { mode, .. } => assert_eq!(*mode, AssignMode::Append),
            other => panic!("expected SetVar, got {:?}", other),
        }
        match &c.story.nodes[0].lines[1] {
            Instruction::SetVar { mode, .. } => assert_eq!(*mode, AssignMode::Remove),
            other => panic!("expected SetVar, got {:?}", other),
        }
    }

    #[test]
    fn test_global_vars_before_first_label() {
        let c = compile("$ gold = 10\n$ name = \"Rin\"\nlabel start:\n    \"hi\"\n");
        assert_eq!(c.story.global_vars.len(), 2);
        assert_eq!(c.story.pool_str(c.story.global_vars[0].var_id), "gold");
    }

    #[test]
    fn test_simple_condition_uses_decomposed_form() {
        let c = compile("label start:\n    if x == 1 -> other\nlabel other:\n    \"o\"\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Condition {
                test: CondTest::Compare { op, .. },
                false_target_id,
                ..
            } => {
                assert_eq!(*op, CmpOp::Eq);
                assert_eq!(*false_target_id, -1);
            }
            other => panic!("expected decomposed Condition, got {:?}", other),
        }
    }

    #[test]
    fn test_logical_condition_uses_expression_form() {
        let c = compile(
            "label start:\n    if hp > 0 and key == true -> other\nlabel other:\n    \"o\"\n",
        );
        match &c.story.nodes[0].lines[0] {
            Instruction::Condition {
                test: CondTest::Expr(e),
                ..
            } => {
                assert!(e.tokens.iter().any(|t| t.op == ExprOp::And));
            }
            other => panic!("expected expression Condition, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_inline_else() {
        let c = compile(
            "label start:\n    if x == 1 -> a else b\nlabel a:\n    \"a\"\nlabel b:\n    \"b\"\n",
        );
        match &c.story.nodes[0].lines[0] {
            Instruction::Condition {
                false_target_id, ..
            } => {
                assert!(*false_target_id >= 0);
            }
            other => panic!("expected Condition, got {:?}", other),
        }
    }

    #[test]
    fn test_elif_chain() {
        let c = compile(
            "label start:\n    if x == 1 -> a\n    elif x == 2 -> b\n    else -> c\nlabel a:\n    \"a\"\nlabel b:\n    \"b\"\nlabel c:\n    \"c\"\n",
        );
        let lines = &c.story.nodes[0].lines;
        assert_eq!(lines.len(), 3);
        assert!(matches!(lines[0], Instruction::Condition { .. }));
        assert!(matches!(lines[1], Instruction::Condition { .. }));
        assert!(matches!(lines[2], Instruction::Jump { .. }));
    }

    #[test]
    fn test_elif_after_inline_else_is_an_error() {
        let errors = errors_of(
            "label start:\n    if x == 1 -> a else b\n    elif x == 2 -> c\nlabel a:\n    \"a\"\nlabel b:\n    \"b\"\nlabel c:\n    \"c\"\n",
        );
        assert!(errors.iter().any(|e| e.message.contains("inline else")));
    }

    #[test]
    fn test_elif_without_if_is_an_error() {
        let errors = errors_of("label start:\n    elif x == 1 -> a\nlabel a:\n    \"a\"\n");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("without a preceding if")));
    }

    #[test]
    fn test_random_block_weights() {
        let c = compile(
            "label start:\n    random:\n        50 -> a\n        -> b\n        3 -> c\nlabel a:\n    \"a\"\nlabel b:\n    \"b\"\nlabel c:\n    \"c\"\n",
        );
        match &c.story.nodes[0].lines[0] {
            Instruction::Random { branches } => {
                assert_eq!(branches.len(), 3);
                assert_eq!(branches[0].weight, 50);
                assert_eq!(branches[1].weight, 1);
                assert_eq!(branches[2].weight, 3);
            }
            other => panic!("expected Random, got {:?}", other),
        }
    }

    #[test]
    fn test_command_params() {
        let c = compile("label start:\n    @ play_sound \"door.ogg\" 0.5\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Command { type_id, params } => {
                assert_eq!(c.story.pool_str(*type_id), "play_sound");
                assert_eq!(params.len(), 2);
                assert_eq!(c.story.pool_str(params[0]), "door.ogg");
            }
            other => panic!("expected Command, got {:?}", other),
        }
    }

    #[test]
    fn test_import_registered() {
        let c = compile("import \"common.skein\"\nlabel start:\n    \"hi\"\n");
        assert_eq!(c.imports, vec!["common.skein".to_string()]);
    }

    #[test]
    fn test_character_definition() {
        let c = compile("character hero #name:Hero #color:blue\nlabel start:\n    \"hi\"\n");
        assert_eq!(c.story.characters.len(), 1);
        let ch = &c.story.characters[0];
        assert_eq!(c.story.pool_str(ch.name_id), "hero");
        assert_eq!(ch.properties.len(), 2);
        assert_eq!(c.story.pool_str(ch.properties[0].value_id), "Hero");
    }

    #[test]
    fn test_voice_tag_back_compat() {
        let c = compile("label start:\n    hero \"hi\" #voice:hero_01.wav #mood:happy\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Line {
                voice_asset_id,
                tags,
                ..
            } => {
                assert_eq!(c.story.pool_str(*voice_asset_id), "hero_01.wav");
                assert_eq!(tags.len(), 2);
                assert_eq!(c.story.pool_str(tags[1].key_id), "mood");
            }
            other => panic!("expected Line, got {:?}", other),
        }
    }

    #[test]
    fn test_tag_without_value() {
        let c = compile("label start:\n    \"hi\" #important\n");
        match &c.story.nodes[0].lines[0] {
            Instruction::Line { tags, .. } => {
                assert_eq!(c.story.pool_str(tags[0].key_id), "important");
                assert_eq!(c.story.pool_str(tags[0].value_id), "");
            }
            other => panic!("expected Line, got {:?}", other),
        }
    }

    #[test]
    fn test_label_tags_and_params() {
        let c = compile("label shop(discount): #music=bazaar\n    \"welcome\"\n");
        let node = &c.story.nodes[0];
        assert_eq!(node.params.len(), 1);
        assert_eq!(node.tags.len(), 1);
        assert_eq!(c.story.pool_str(node.tags[0].key_id), "music");
        assert_eq!(c.story.pool_str(node.tags[0].value_id), "bazaar");
    }

    #[test]
    fn test_string_pool_dedup() {
        let c = compile(
            "label start:\n    hero \"same\"\n    hero \"same\"\nlabel again:\n    hero \"same\"\n",
        );
        let count = c
            .story
            .string_pool
            .iter()
            .filter(|s| s.as_str() == "same")
            .count();
        assert_eq!(count, 1);
        let heroes = c
            .story
            .string_pool
            .iter()
            .filter(|s| s.as_str() == "hero")
            .count();
        assert_eq!(heroes, 1);
    }

    #[test]
    fn test_no_duplicate_pool_entries_at_all() {
        let c =
            compile("label start:\n    \"a\"\n    menu:\n        \"a\" -> start\n    jump start\n");
        let mut seen = std::collections::HashSet::new();
        for s in &c.story.string_pool {
            assert!(seen.insert(s.clone()), "duplicate pool entry: {}", s);
        }
    }

    #[test]
    fn test_duplicate_node_name_is_an_error() {
        let errors = errors_of("label start:\n    \"a\"\nlabel start:\n    \"b\"\n");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("duplicate node name")));
    }

    #[test]
    fn test_line_ids_parallel_pool() {
        let c = compile(
            "label start:\n    hero \"Hello world!\"\n    menu:\n        \"Go\" -> start\n",
        );
        assert_eq!(c.story.line_ids.len(), c.story.string_pool.len());
        let hello = c.story.find_string("Hello world!");
        let go = c.story.find_string("Go");
        assert!(c.story.line_ids[hello as usize].starts_with("start:"));
        assert!(c.story.line_ids[go as usize].starts_with("start:"));
        // Structural strings carry no line id.
        let hero = c.story.find_string("hero");
        assert!(c.story.line_ids[hero as usize].is_empty());
        let start = c.story.find_string("start");
        assert!(c.story.line_ids[start as usize].is_empty());
    }

    #[test]
    fn test_line_id_hash_discriminates() {
        let c = compile("label start:\n    \"Hello\"\n    \"World\"\n");
        let h = c.story.find_string("Hello");
        let w = c.story.find_string("World");
        let hid = &c.story.line_ids[h as usize];
        let wid = &c.story.line_ids[w as usize];
        assert_ne!(hid, wid);
        let hhash = hid.rsplit(':').next().unwrap();
        let whash = wid.rsplit(':').next().unwrap();
        assert_eq!(hhash.len(), 4);
        assert_ne!(hhash, whash);
    }

    #[test]
    fn test_line_id_stability_across_compiles() {
        let src = "label start:\n    hero \"Stable text\"\n    menu:\n        \"Pick\" -> start\n";
        let a = compile(src);
        let b = compile(src);
        assert_eq!(a.story.line_ids, b.story.line_ids);
        assert_eq!(a.story.string_pool, b.story.string_pool);
    }

    #[test]
    fn test_export_strings_csv() {
        let c = compile(
            "label start:\n    hero \"Hello, \\\"World\\\"\"\n    menu:\n        \"Go left\" -> start\n",
        );
        let csv = c.strings_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), "line_id,type,node,character,text");
        let body: Vec<&str> = lines.collect();
        assert_eq!(body.len(), 2);
        assert!(body[0].contains(",LINE,start,hero,"));
        // Embedded quotes double, and the comma forces field quoting.
        assert!(body[0].contains("\"Hello, \"\"World\"\"\""));
        assert!(body[1].contains(",CHOICE,start,,Go left"));
    }

    #[test]
    fn test_errors_accumulate_and_parsing_continues() {
        let errors =
            errors_of("label start:\n    hero\n    jump\n    \"still parsed\"\n    jump nowhere\n");
        assert!(errors.len() >= 3);
        let lines: Vec<u32> = errors.iter().map(|e| e.line).collect();
        assert!(lines.contains(&2));
        assert!(lines.contains(&3));
        assert!(lines.contains(&5));
    }

    #[test]
    fn test_dialogue_outside_label() {
        let errors = errors_of("\"floating\"\nlabel start:\n    \"ok\"\n");
        assert!(errors[0].message.contains("outside of label"));
    }
}
