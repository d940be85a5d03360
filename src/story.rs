//! The compiled story container.
//!
//! A `.story` file is a magic-tagged, schema-versioned binary buffer holding
//! the deduplicated string pool, the parallel line-id table, and every node's
//! instruction array. Loading verifies the whole buffer before the VM trusts
//! a single index: every string reference must be -1 (where absence is
//! allowed) or in range, every node-name reference must resolve, and every
//! union discriminant must be known. After verification the story is
//! immutable; all mutation lives in the VM's runtime state.

use crate::expr::{Expr, ExprOp};
use crate::value::{CmpOp, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Leading magic of a compiled story buffer.
pub const STORY_MAGIC: &[u8; 4] = b"SKST";

/// Schema version written by this compiler and required by this loader.
/// Versioned but not negotiated: a mismatch is rejected outright.
pub const STORY_FORMAT_VERSION: &str = "2";

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("invalid story: {0}")]
    InvalidStory(String),
}

fn invalid(msg: impl Into<String>) -> StoryError {
    StoryError::InvalidStory(msg.into())
}

/// A literal value as stored in the binary. Strings and list items are
/// pool-referenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int(i32),
    Float(f32),
    StringRef(i32),
    ListRef(Vec<i32>),
}

impl Literal {
    /// Materialize a runtime value, resolving pool references. Out-of-range
    /// references read as empty strings; the verifier rejects them before a
    /// well-formed load ever gets here.
    pub fn to_value(&self, pool: &[String]) -> Value {
        let lookup = |idx: i32| -> String {
            usize::try_from(idx)
                .ok()
                .and_then(|i| pool.get(i))
                .cloned()
                .unwrap_or_default()
        };
        match self {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(x) => Value::Float(*x),
            Literal::StringRef(idx) => Value::Str(lookup(*idx)),
            Literal::ListRef(items) => Value::List(items.iter().map(|&i| lookup(i)).collect()),
        }
    }
}

/// A key/value metadata pair, both sides pool-referenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub key_id: i32,
    pub value_id: i32,
}

/// How a `SetVar` applies its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignMode {
    Assign,
    /// Idempotent list add: appends only when the item is not yet present.
    Append,
    /// Removes every occurrence of the item from a list.
    Remove,
}

/// Presentation behavior of a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChoiceModifier {
    Default,
    /// Hidden after it has been chosen once.
    Once,
    /// Always re-presented; marks author intent explicitly.
    Sticky,
    /// Participates only when no non-fallback choice is visible.
    Fallback,
}

/// One operand of a decomposed condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CondOperand {
    Var(i32),
    Literal(Literal),
    Expr(Expr),
}

/// The test of a `Condition` instruction: either a unified boolean
/// expression or a decomposed two-operand comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CondTest {
    Expr(Expr),
    Compare {
        lhs: CondOperand,
        op: CmpOp,
        rhs: CondOperand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomBranch {
    pub weight: i32,
    pub target_id: i32,
}

/// The closed instruction set. `*_id` fields index the string pool; -1 marks
/// absence where the field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Line {
        character_id: i32,
        text_id: i32,
        voice_asset_id: i32,
        tags: Vec<Tag>,
    },
    Choice {
        text_id: i32,
        target_id: i32,
        condition_var_id: i32,
        modifier: ChoiceModifier,
    },
    Jump {
        target_id: i32,
        is_call: bool,
        args: Vec<Expr>,
    },
    CallWithReturn {
        target_id: i32,
        return_var_id: i32,
        args: Vec<Expr>,
    },
    Return {
        expr: Option<Expr>,
        value: Option<Literal>,
    },
    SetVar {
        var_id: i32,
        mode: AssignMode,
        expr: Option<Expr>,
        value: Option<Literal>,
    },
    Condition {
        test: CondTest,
        true_target_id: i32,
        /// -1 means fall through on a false condition.
        false_target_id: i32,
    },
    Random {
        branches: Vec<RandomBranch>,
    },
    Command {
        type_id: i32,
        params: Vec<i32>,
    },
}

impl Instruction {
    /// Short name used by the debugger surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Line { .. } => "Line",
            Instruction::Choice { .. } => "Choice",
            Instruction::Jump { .. } => "Jump",
            Instruction::CallWithReturn { .. } => "CallWithReturn",
            Instruction::Return { .. } => "Return",
            Instruction::SetVar { .. } => "SetVar",
            Instruction::Condition { .. } => "Condition",
            Instruction::Random { .. } => "Random",
            Instruction::Command { .. } => "Command",
        }
    }
}

/// A named block of instructions; the unit of a jump/call target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Parameter names (pool indices), bound positionally at call sites.
    pub params: Vec<i32>,
    pub tags: Vec<Tag>,
    pub lines: Vec<Instruction>,
}

/// An initial variable binding, either literal or computed at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVar {
    pub var_id: i32,
    pub expr: Option<Expr>,
    pub value: Option<Literal>,
}

/// A character definition: id plus a property map (e.g. display name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name_id: i32,
    pub properties: Vec<Tag>,
}

/// The root of a compiled story. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub version: String,
    pub start_node_name: String,
    pub string_pool: Vec<String>,
    pub line_ids: Vec<String>,
    pub nodes: Vec<Node>,
    pub global_vars: Vec<GlobalVar>,
    pub characters: Vec<Character>,
}

impl Story {
    /// Serialize to the magic-tagged binary form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoryError> {
        let payload = bincode::serialize(self)
            .map_err(|e| invalid(format!("serialization failed: {}", e)))?;
        let mut out = Vec::with_capacity(payload.len() + STORY_MAGIC.len());
        out.extend_from_slice(STORY_MAGIC);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Deserialize and verify a story buffer. Unknown union discriminants,
    /// truncated buffers, and out-of-range references all reject the load.
    pub fn from_bytes(bytes: &[u8]) -> Result<Story, StoryError> {
        if bytes.len() < STORY_MAGIC.len() || &bytes[..STORY_MAGIC.len()] != STORY_MAGIC {
            return Err(invalid("bad magic"));
        }
        let story: Story = bincode::deserialize(&bytes[STORY_MAGIC.len()..])
            .map_err(|e| invalid(format!("malformed buffer: {}", e)))?;
        story.verify()?;
        Ok(story)
    }

    /// Raw pool lookup. Out-of-range and -1 read as the empty string.
    pub fn pool_str(&self, idx: i32) -> &str {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.string_pool.get(i))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Position of a node by name.
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Pool index of an exact string, or -1 when absent.
    pub fn find_string(&self, s: &str) -> i32 {
        self.string_pool
            .iter()
            .position(|p| p == s)
            .map(|i| i as i32)
            .unwrap_or(-1)
    }

    /// Walk the whole story and check internal consistency.
    pub fn verify(&self) -> Result<(), StoryError> {
        if self.version != STORY_FORMAT_VERSION {
            return Err(invalid(format!(
                "format version {:?} does not match {:?}",
                self.version, STORY_FORMAT_VERSION
            )));
        }
        if self.line_ids.len() != self.string_pool.len() {
            return Err(invalid("line-id table length differs from string pool"));
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|n| n.name == node.name) {
                return Err(invalid(format!("duplicate node name: {}", node.name)));
            }
        }
        if self.node_index(&self.start_node_name).is_none() {
            return Err(invalid(format!(
                "start node does not exist: {}",
                self.start_node_name
            )));
        }

        for gv in &self.global_vars {
            self.check_id("global variable name", gv.var_id, false)?;
            if let Some(expr) = &gv.expr {
                self.check_expr(expr)?;
            }
            if let Some(value) = &gv.value {
                self.check_literal(value)?;
            }
        }
        for character in &self.characters {
            self.check_id("character name", character.name_id, false)?;
            self.check_tags(&character.properties)?;
        }

        for node in &self.nodes {
            for &param in &node.params {
                self.check_id("parameter name", param, false)?;
            }
            self.check_tags(&node.tags)?;
            for instr in &node.lines {
                self.check_instruction(instr)?;
            }
        }

        Ok(())
    }

    fn check_id(&self, what: &str, idx: i32, allow_absent: bool) -> Result<(), StoryError> {
        if idx == -1 && allow_absent {
            return Ok(());
        }
        if idx < 0 || idx as usize >= self.string_pool.len() {
            return Err(invalid(format!("{} index {} out of range", what, idx)));
        }
        Ok(())
    }

    fn check_tags(&self, tags: &[Tag]) -> Result<(), StoryError> {
        for tag in tags {
            self.check_id("tag key", tag.key_id, false)?;
            self.check_id("tag value", tag.value_id, false)?;
        }
        Ok(())
    }

    fn check_literal(&self, lit: &Literal) -> Result<(), StoryError> {
        match lit {
            Literal::StringRef(idx) => self.check_id("string literal", *idx, false),
            Literal::ListRef(items) => {
                for &idx in items {
                    self.check_id("list item", idx, false)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), StoryError> {
        for token in &expr.tokens {
            match token.op {
                ExprOp::PushLiteral => match &token.literal {
                    Some(lit) => self.check_literal(lit)?,
                    None => return Err(invalid("push-literal token without a literal")),
                },
                ExprOp::PushVar
                | ExprOp::VisitCount
                | ExprOp::Visited
                | ExprOp::ListLen => {
                    self.check_id("expression name", token.name_id, false)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_cond_operand(&self, operand: &CondOperand) -> Result<(), StoryError> {
        match operand {
            CondOperand::Var(idx) => self.check_id("condition variable", *idx, false),
            CondOperand::Literal(lit) => self.check_literal(lit),
            CondOperand::Expr(expr) => self.check_expr(expr),
        }
    }

    fn check_instruction(&self, instr: &Instruction) -> Result<(), StoryError> {
        match instr {
            Instruction::Line {
                character_id,
                text_id,
                voice_asset_id,
                tags,
            } => {
                self.check_id("line character", *character_id, true)?;
                self.check_id("line text", *text_id, false)?;
                self.check_id("voice asset", *voice_asset_id, true)?;
                self.check_tags(tags)
            }
            Instruction::Choice {
                text_id,
                target_id,
                condition_var_id,
                ..
            } => {
                self.check_id("choice text", *text_id, false)?;
                self.check_id("choice target", *target_id, false)?;
                self.check_id("choice condition", *condition_var_id, true)
            }
            Instruction::Jump { target_id, args, .. } => {
                self.check_id("jump target", *target_id, false)?;
                for arg in args {
                    self.check_expr(arg)?;
                }
                Ok(())
            }
            Instruction::CallWithReturn {
                target_id,
                return_var_id,
                args,
            } => {
                self.check_id("call target", *target_id, false)?;
                self.check_id("return variable", *return_var_id, false)?;
                for arg in args {
                    self.check_expr(arg)?;
                }
                Ok(())
            }
            Instruction::Return { expr, value } => {
                if let Some(expr) = expr {
                    self.check_expr(expr)?;
                }
                if let Some(value) = value {
                    self.check_literal(value)?;
                }
                Ok(())
            }
            Instruction::SetVar {
                var_id, expr, value, ..
            } => {
                self.check_id("variable name", *var_id, false)?;
                if let Some(expr) = expr {
                    self.check_expr(expr)?;
                }
                if let Some(value) = value {
                    self.check_literal(value)?;
                }
                Ok(())
            }
            Instruction::Condition {
                test,
                true_target_id,
                false_target_id,
            } => {
                match test {
                    CondTest::Expr(expr) => self.check_expr(expr)?,
                    CondTest::Compare { lhs, rhs, .. } => {
                        self.check_cond_operand(lhs)?;
                        self.check_cond_operand(rhs)?;
                    }
                }
                self.check_id("true branch target", *true_target_id, false)?;
                self.check_id("false branch target", *false_target_id, true)
            }
            Instruction::Random { branches } => {
                for branch in branches {
                    self.check_id("random target", branch.target_id, false)?;
                }
                Ok(())
            }
            Instruction::Command { type_id, params } => {
                self.check_id("command type", *type_id, false)?;
                for &param in params {
                    self.check_id("command parameter", param, false)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_story() -> Story {
        Story {
            version: STORY_FORMAT_VERSION.to_string(),
            start_node_name: "start".to_string(),
            string_pool: vec!["start".to_string(), "hello".to_string()],
            line_ids: vec![String::new(), "start:0:abcd".to_string()],
            nodes: vec![Node {
                name: "start".to_string(),
                params: Vec::new(),
                tags: Vec::new(),
                lines: vec![Instruction::Line {
                    character_id: -1,
                    text_id: 1,
                    voice_asset_id: -1,
                    tags: Vec::new(),
                }],
            }],
            global_vars: Vec::new(),
            characters: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip() {
        let story = minimal_story();
        let bytes = story.to_bytes().unwrap();
        let loaded = Story::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, story);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = minimal_story().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(Story::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let bytes = minimal_story().to_bytes().unwrap();
        assert!(Story::from_bytes(&bytes[..bytes.len() / 2]).is_err());
        assert!(Story::from_bytes(&bytes[..2]).is_err());
    }

    #[test]
    fn test_out_of_range_reference_rejected() {
        let mut story = minimal_story();
        story.nodes[0].lines[0] = Instruction::Line {
            character_id: -1,
            text_id: 99,
            voice_asset_id: -1,
            tags: Vec::new(),
        };
        assert!(story.verify().is_err());
    }

    #[test]
    fn test_duplicate_node_names_rejected() {
        let mut story = minimal_story();
        story.nodes.push(story.nodes[0].clone());
        assert!(story.verify().is_err());
    }

    #[test]
    fn test_missing_start_node_rejected() {
        let mut story = minimal_story();
        story.start_node_name = "elsewhere".to_string();
        assert!(story.verify().is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut story = minimal_story();
        story.version = "1".to_string();
        let bytes = story.to_bytes().unwrap();
        assert!(Story::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_line_id_table_must_parallel_pool() {
        let mut story = minimal_story();
        story.line_ids.pop();
        assert!(story.verify().is_err());
    }

    #[test]
    fn test_literal_to_value() {
        let pool = vec!["sword".to_string()];
        assert_eq!(Literal::Bool(true).to_value(&pool), Value::Bool(true));
        assert_eq!(
            Literal::StringRef(0).to_value(&pool),
            Value::Str("sword".to_string())
        );
        assert_eq!(
            Literal::ListRef(vec![0]).to_value(&pool),
            Value::List(vec!["sword".to_string()])
        );
    }
}
