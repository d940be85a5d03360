//! The skein virtual machine.
//!
//! A `Vm` owns (or shares read-only) one verified story and all of the
//! mutable runtime state: variables, the call stack, pending choices, visit
//! counts, and the PRNG. The host drives it by alternating `step` and
//! `choose`; `step` runs instructions until it produces an observable event
//! (a line, a menu, a host command, the end) or a debugger pause.
//!
//! The runtime fails soft: a jump to a missing node finishes the story with
//! a logged warning, an invalid choice index is a logged no-op, and the
//! expression evaluator substitutes safe defaults. Authoring errors must
//! never crash the host.

use crate::eval::{evaluate, EvalContext};
use crate::expr::Expr;
use crate::interp::{interpolate, InterpEnv};
use crate::save::{self, SaveState, SavedChoice, SavedFrame, SavedShadow};
use crate::story::{
    AssignMode, ChoiceModifier, CondOperand, CondTest, Instruction, Literal, Story, StoryError,
};
use crate::value::{self, Value};
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the VM API. Nothing else crosses the boundary.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Story(#[from] StoryError),
    #[error("invalid save file: {0}")]
    InvalidSaveFile(String),
    #[error("could not serialize save state: {0}")]
    SaveFailed(String),
    #[error("no story loaded")]
    NoStory,
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One observable event produced by `step`. Event payloads own their
/// strings; their lifetime is independent of the VM.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Line {
        character: Option<String>,
        text: String,
        tags: Vec<(String, String)>,
    },
    Choices(Vec<ChoiceItem>),
    Command {
        name: String,
        params: Vec<String>,
    },
    End,
    /// Debugger pause (step mode or a breakpoint). Hosts that never enable
    /// the debugger never see this.
    Paused,
}

/// One entry of a presented menu.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceItem {
    pub index: usize,
    pub text: String,
}

/// Where the VM currently stands, for the debugger.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugLocation {
    pub node: String,
    pub pc: u32,
    pub instruction: String,
}

/// Human-readable view of one call frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrameInfo {
    pub node: String,
    pub pc: u32,
    pub return_var: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone)]
struct ShadowedVar {
    name: String,
    value: Value,
    existed: bool,
}

#[derive(Debug, Clone)]
struct CallFrame {
    node: usize,
    pc: u32,
    return_var: String,
    shadowed: Vec<ShadowedVar>,
    params: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingChoice {
    text_id: i32,
    target_id: i32,
    modifier: ChoiceModifier,
    once_key: String,
}

/// The skein step-wise interpreter.
pub struct Vm {
    story: Option<Arc<Story>>,
    node_index: HashMap<String, usize>,
    variables: HashMap<String, Value>,
    current_node: usize,
    pc: u32,
    finished: bool,
    call_stack: Vec<CallFrame>,
    pending_choices: Vec<PendingChoice>,
    chosen_once: BTreeSet<String>,
    pending_return: Option<Value>,
    rng: StdRng,
    visit_counts: HashMap<String, u32>,
    locale_name: String,
    locale_pool: Vec<String>,
    breakpoints: BTreeSet<(String, u32)>,
    step_mode: bool,
    hit_breakpoint: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            story: None,
            node_index: HashMap::new(),
            variables: HashMap::new(),
            current_node: 0,
            pc: 0,
            finished: true,
            call_stack: Vec::new(),
            pending_choices: Vec::new(),
            chosen_once: BTreeSet::new(),
            pending_return: None,
            rng: StdRng::from_entropy(),
            visit_counts: HashMap::new(),
            locale_name: String::new(),
            locale_pool: Vec::new(),
            breakpoints: BTreeSet::new(),
            step_mode: false,
            hit_breakpoint: false,
        }
    }

    // --- story loading ---

    /// Verify and adopt a compiled story buffer.
    pub fn load_story(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        let story = Story::from_bytes(bytes)?;
        self.adopt_story(Arc::new(story));
        Ok(())
    }

    /// Adopt an already-verified story, possibly shared with other VMs.
    pub fn load_story_shared(&mut self, story: Arc<Story>) -> Result<(), VmError> {
        story.verify()?;
        self.adopt_story(story);
        Ok(())
    }

    fn adopt_story(&mut self, story: Arc<Story>) {
        self.node_index = story
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        self.story = Some(story);
        self.locale_pool.clear();
        self.locale_name.clear();
        self.reset_runtime();
        self.finished = true;
    }

    pub fn has_story(&self) -> bool {
        self.story.is_some()
    }

    fn reset_runtime(&mut self) {
        self.variables.clear();
        self.call_stack.clear();
        self.pending_choices.clear();
        self.visit_counts.clear();
        self.chosen_once.clear();
        self.pending_return = None;
        self.current_node = 0;
        self.pc = 0;
        self.hit_breakpoint = false;
    }

    // --- execution ---

    /// Begin at the story's start node, reinitializing all runtime state and
    /// evaluating the global variable initializers. The PRNG keeps its seed
    /// so `set_seed` before `start` gives a deterministic run.
    pub fn start(&mut self) -> Result<(), VmError> {
        let start = self.require_story()?.start_node_name.clone();
        self.start_at_node(&start)
    }

    /// Begin at a specific node instead of the start node.
    pub fn start_at_node(&mut self, name: &str) -> Result<(), VmError> {
        let story = Arc::clone(self.require_story()?);
        self.reset_runtime();

        for gv in &story.global_vars {
            let var = story.pool_str(gv.var_id).to_string();
            let val = self.eval_operand(&story, gv.expr.as_ref(), gv.value.as_ref());
            self.variables.insert(var, val);
        }

        self.finished = false;
        if !self.jump_to_node(name) {
            return Err(VmError::NodeNotFound(name.to_string()));
        }
        Ok(())
    }

    fn require_story(&self) -> Result<&Arc<Story>, VmError> {
        self.story.as_ref().ok_or(VmError::NoStory)
    }

    /// Move to a node by name, bumping its visit count. A missing node
    /// finishes the story with a warning.
    fn jump_to_node(&mut self, name: &str) -> bool {
        match self.node_index.get(name) {
            Some(&idx) => {
                self.current_node = idx;
                self.pc = 0;
                *self.visit_counts.entry(name.to_string()).or_insert(0) += 1;
                true
            }
            None => {
                warn!("node not found: {}", name);
                self.finished = true;
                false
            }
        }
    }

    /// Run instructions until an observable event is produced.
    pub fn step(&mut self) -> StepEvent {
        if self.finished {
            return StepEvent::End;
        }
        let story = match &self.story {
            Some(s) => Arc::clone(s),
            None => return StepEvent::End,
        };

        loop {
            let node = &story.nodes[self.current_node];

            if self.pc as usize >= node.lines.len() {
                // End of node: return to the caller, or finish the story.
                if let Some(frame) = self.call_stack.pop() {
                    self.unwind_frame(frame);
                    continue;
                }
                self.finished = true;
                return StepEvent::End;
            }

            if !self.breakpoints.is_empty() || self.step_mode {
                if self.hit_breakpoint {
                    // Paused here last call; release and proceed.
                    self.hit_breakpoint = false;
                } else if self.step_mode
                    || self.breakpoints.contains(&(node.name.clone(), self.pc))
                {
                    self.hit_breakpoint = true;
                    return StepEvent::Paused;
                }
            }

            if matches!(node.lines[self.pc as usize], Instruction::Choice { .. }) {
                let items = self.collect_choices(&story);
                return StepEvent::Choices(items);
            }

            let instr = node.lines[self.pc as usize].clone();
            self.pc += 1;

            match instr {
                Instruction::Line {
                    character_id,
                    text_id,
                    voice_asset_id: _,
                    tags,
                } => {
                    let character = if character_id >= 0 {
                        Some(story.pool_str(character_id).to_string())
                    } else {
                        None
                    };
                    let raw = self.localized(&story, text_id).to_string();
                    let text = self.interpolate_text(&raw);
                    let tags = tags
                        .iter()
                        .map(|t| {
                            (
                                story.pool_str(t.key_id).to_string(),
                                story.pool_str(t.value_id).to_string(),
                            )
                        })
                        .collect();
                    return StepEvent::Line {
                        character,
                        text,
                        tags,
                    };
                }

                Instruction::Choice { .. } => unreachable!("choices are collected above"),

                Instruction::Jump {
                    target_id,
                    is_call,
                    args,
                } => {
                    if is_call {
                        self.enter_call(&story, target_id, String::new(), &args);
                    } else {
                        let name = story.pool_str(target_id).to_string();
                        self.jump_to_node(&name);
                    }
                    if self.finished {
                        return StepEvent::End;
                    }
                }

                Instruction::CallWithReturn {
                    target_id,
                    return_var_id,
                    args,
                } => {
                    let return_var = story.pool_str(return_var_id).to_string();
                    self.enter_call(&story, target_id, return_var, &args);
                    if self.finished {
                        return StepEvent::End;
                    }
                }

                Instruction::SetVar {
                    var_id,
                    mode,
                    expr,
                    value,
                } => {
                    let var = story.pool_str(var_id).to_string();
                    let new_val = self.eval_operand(&story, expr.as_ref(), value.as_ref());
                    self.apply_assignment(var, mode, new_val);
                }

                Instruction::Condition {
                    test,
                    true_target_id,
                    false_target_id,
                } => {
                    let outcome = match &test {
                        CondTest::Expr(e) => self.eval_expr(&story, e).truthy(),
                        CondTest::Compare { lhs, op, rhs } => {
                            let l = self.eval_cond_operand(&story, lhs);
                            let r = self.eval_cond_operand(&story, rhs);
                            value::compare(&l, *op, &r)
                        }
                    };
                    let target = if outcome { true_target_id } else { false_target_id };
                    if target >= 0 {
                        let name = story.pool_str(target).to_string();
                        self.jump_to_node(&name);
                        if self.finished {
                            return StepEvent::End;
                        }
                    }
                    // A -1 target falls through to the next instruction.
                }

                Instruction::Random { branches } => {
                    let total: i32 = branches.iter().filter(|b| b.weight > 0).map(|b| b.weight).sum();
                    if total <= 0 {
                        continue;
                    }
                    let roll = self.rng.gen_range(0..total);
                    let mut cumulative = 0;
                    for branch in &branches {
                        if branch.weight <= 0 {
                            continue;
                        }
                        cumulative += branch.weight;
                        if roll < cumulative {
                            let name = story.pool_str(branch.target_id).to_string();
                            self.jump_to_node(&name);
                            break;
                        }
                    }
                    if self.finished {
                        return StepEvent::End;
                    }
                }

                Instruction::Command { type_id, params } => {
                    return StepEvent::Command {
                        name: story.pool_str(type_id).to_string(),
                        params: params
                            .iter()
                            .map(|&p| story.pool_str(p).to_string())
                            .collect(),
                    };
                }

                Instruction::Return { expr, value } => {
                    if expr.is_some() || value.is_some() {
                        self.pending_return =
                            Some(self.eval_operand(&story, expr.as_ref(), value.as_ref()));
                    } else {
                        self.pending_return = None;
                    }
                    match self.call_stack.pop() {
                        Some(frame) => self.unwind_frame(frame),
                        None => {
                            self.pending_return = None;
                            self.finished = true;
                            return StepEvent::End;
                        }
                    }
                }
            }
        }
    }

    /// Resolve a player decision. Out-of-range indices are logged no-ops.
    pub fn choose(&mut self, index: usize) {
        if index >= self.pending_choices.len() {
            warn!("invalid choice index: {}", index);
            return;
        }
        let story = match &self.story {
            Some(s) => Arc::clone(s),
            None => return,
        };
        let choice = self.pending_choices[index].clone();
        if choice.modifier == ChoiceModifier::Once && !choice.once_key.is_empty() {
            self.chosen_once.insert(choice.once_key.clone());
        }
        self.pending_choices.clear();
        let name = story.pool_str(choice.target_id).to_string();
        self.jump_to_node(&name);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    // --- step helpers ---

    /// Evaluate call arguments in the caller's scope, push the frame, move to
    /// the target, and bind parameters positionally (shadowing collisions).
    fn enter_call(&mut self, story: &Story, target_id: i32, return_var: String, args: &[Expr]) {
        let arg_values: Vec<Value> = args.iter().map(|a| self.eval_expr(story, a)).collect();
        self.call_stack.push(CallFrame {
            node: self.current_node,
            pc: self.pc,
            return_var,
            shadowed: Vec::new(),
            params: Vec::new(),
        });
        let name = story.pool_str(target_id).to_string();
        if self.jump_to_node(&name) {
            self.bind_parameters(story, &arg_values);
        }
    }

    fn bind_parameters(&mut self, story: &Story, args: &[Value]) {
        let node = &story.nodes[self.current_node];
        if node.params.is_empty() {
            return;
        }
        let mut shadowed = Vec::new();
        let mut params = Vec::new();
        for (i, &pid) in node.params.iter().enumerate() {
            let name = story.pool_str(pid).to_string();
            match self.variables.get(&name) {
                Some(prior) => shadowed.push(ShadowedVar {
                    name: name.clone(),
                    value: prior.clone(),
                    existed: true,
                }),
                None => shadowed.push(ShadowedVar {
                    name: name.clone(),
                    value: Value::Int(0),
                    existed: false,
                }),
            }
            let bound = args.get(i).cloned().unwrap_or(Value::Int(0));
            self.variables.insert(name.clone(), bound);
            params.push(name);
        }
        if let Some(frame) = self.call_stack.last_mut() {
            frame.shadowed = shadowed;
            frame.params = params;
        }
    }

    /// Restore shadowed variables (newest first), publish the pending return
    /// value into the caller's binding, and resume at the return site.
    fn unwind_frame(&mut self, frame: CallFrame) {
        for sv in frame.shadowed.into_iter().rev() {
            if sv.existed {
                self.variables.insert(sv.name, sv.value);
            } else {
                self.variables.remove(&sv.name);
            }
        }
        if let Some(val) = self.pending_return.take() {
            if !frame.return_var.is_empty() {
                self.variables.insert(frame.return_var, val);
            }
        }
        self.current_node = frame.node;
        self.pc = frame.pc;
    }

    /// Gather the contiguous run of choices at the current pc into
    /// `pending_choices`, applying visibility gates and modifiers, and build
    /// the presented menu.
    fn collect_choices(&mut self, story: &Story) -> Vec<ChoiceItem> {
        let node = &story.nodes[self.current_node];
        let node_name = node.name.clone();
        let mut collected = Vec::new();

        while (self.pc as usize) < node.lines.len() {
            let (text_id, target_id, condition_var_id, modifier) =
                match &node.lines[self.pc as usize] {
                    Instruction::Choice {
                        text_id,
                        target_id,
                        condition_var_id,
                        modifier,
                    } => (*text_id, *target_id, *condition_var_id, *modifier),
                    _ => break,
                };
            let once_key = format!("{}:{}", node_name, self.pc);
            self.pc += 1;

            let mut visible = if condition_var_id >= 0 {
                let var = story.pool_str(condition_var_id);
                self.variables.get(var).map(Value::truthy).unwrap_or(false)
            } else {
                true
            };
            if visible && modifier == ChoiceModifier::Once && self.chosen_once.contains(&once_key)
            {
                visible = false;
            }
            if visible {
                collected.push(PendingChoice {
                    text_id,
                    target_id,
                    modifier,
                    once_key,
                });
            }
        }

        // Fallback choices participate only when nothing else survived.
        let has_normal = collected
            .iter()
            .any(|c| c.modifier != ChoiceModifier::Fallback);
        self.pending_choices = if has_normal {
            collected
                .into_iter()
                .filter(|c| c.modifier != ChoiceModifier::Fallback)
                .collect()
        } else {
            collected
        };

        let mut items = Vec::new();
        for (index, choice) in self.pending_choices.iter().enumerate() {
            let raw = self.localized(story, choice.text_id).to_string();
            items.push(ChoiceItem {
                index,
                text: self.interpolate_text(&raw),
            });
        }
        items
    }

    fn eval_expr(&self, story: &Story, expr: &Expr) -> Value {
        let ctx = EvalContext {
            pool: &story.string_pool,
            variables: &self.variables,
            visit_counts: &self.visit_counts,
        };
        evaluate(expr, &ctx)
    }

    fn eval_operand(&self, story: &Story, expr: Option<&Expr>, value: Option<&Literal>) -> Value {
        if let Some(e) = expr {
            self.eval_expr(story, e)
        } else if let Some(v) = value {
            v.to_value(&story.string_pool)
        } else {
            Value::Int(0)
        }
    }

    fn eval_cond_operand(&self, story: &Story, operand: &CondOperand) -> Value {
        match operand {
            CondOperand::Var(idx) => {
                let name = story.pool_str(*idx);
                self.variables.get(name).cloned().unwrap_or(Value::Int(0))
            }
            CondOperand::Literal(lit) => lit.to_value(&story.string_pool),
            CondOperand::Expr(expr) => self.eval_expr(story, expr),
        }
    }

    fn apply_assignment(&mut self, var: String, mode: AssignMode, new_val: Value) {
        match mode {
            AssignMode::Assign => {
                self.variables.insert(var, new_val);
            }
            AssignMode::Append => match self.variables.get_mut(&var) {
                Some(Value::List(items)) => {
                    let item = stringify(new_val);
                    if !items.contains(&item) {
                        items.push(item);
                    }
                }
                _ => {
                    self.variables.insert(var, new_val);
                }
            },
            AssignMode::Remove => {
                if let Some(Value::List(items)) = self.variables.get_mut(&var) {
                    let item = stringify(new_val);
                    items.retain(|x| x != &item);
                }
            }
        }
    }

    fn interpolate_text(&self, text: &str) -> String {
        let env = InterpEnv {
            variables: &self.variables,
            visit_counts: &self.visit_counts,
        };
        interpolate(text, &env)
    }

    /// Pool lookup with the locale overlay applied.
    fn localized<'a>(&'a self, story: &'a Story, idx: i32) -> &'a str {
        if let Ok(i) = usize::try_from(idx) {
            if let Some(s) = self.locale_pool.get(i) {
                if !s.is_empty() {
                    return s;
                }
            }
        }
        story.pool_str(idx)
    }

    // --- variable API ---

    /// Read a variable; unknown names read as `Int(0)`.
    pub fn get_variable(&self, name: &str) -> Value {
        self.variables.get(name).cloned().unwrap_or(Value::Int(0))
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn get_variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.variables.keys().cloned().collect();
        names.sort();
        names
    }

    // --- visit tracking ---

    pub fn get_visit_count(&self, node: &str) -> i32 {
        self.visit_counts.get(node).copied().unwrap_or(0) as i32
    }

    pub fn has_visited(&self, node: &str) -> bool {
        self.get_visit_count(node) > 0
    }

    // --- RNG ---

    /// Reseed the PRNG for deterministic random branches.
    pub fn set_seed(&mut self, seed: u32) {
        self.rng = StdRng::seed_from_u64(seed as u64);
    }

    // --- character API ---

    pub fn get_character_property(&self, character: &str, key: &str) -> String {
        let story = match &self.story {
            Some(s) => s,
            None => return String::new(),
        };
        for def in &story.characters {
            if story.pool_str(def.name_id) == character {
                for prop in &def.properties {
                    if story.pool_str(prop.key_id) == key {
                        return story.pool_str(prop.value_id).to_string();
                    }
                }
            }
        }
        String::new()
    }

    /// The `name` property of a character, falling back to its id.
    pub fn get_character_display_name(&self, character: &str) -> String {
        let name = self.get_character_property(character, "name");
        if name.is_empty() {
            character.to_string()
        } else {
            name
        }
    }

    pub fn get_character_names(&self) -> Vec<String> {
        match &self.story {
            Some(story) => story
                .characters
                .iter()
                .map(|c| story.pool_str(c.name_id).to_string())
                .collect(),
            None => Vec::new(),
        }
    }

    // --- node tag API ---

    pub fn get_node_tag(&self, node: &str, key: &str) -> String {
        self.get_node_tags(node)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    pub fn get_node_tags(&self, node: &str) -> Vec<(String, String)> {
        let story = match &self.story {
            Some(s) => s,
            None => return Vec::new(),
        };
        match story.node_index(node) {
            Some(idx) => story.nodes[idx]
                .tags
                .iter()
                .map(|t| {
                    (
                        story.pool_str(t.key_id).to_string(),
                        story.pool_str(t.value_id).to_string(),
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_node_tag(&self, node: &str, key: &str) -> bool {
        self.get_node_tags(node).iter().any(|(k, _)| k == key)
    }

    // --- locale API ---

    /// Load a translation CSV (`line_id,type,node,character,text`). Matching
    /// rows overlay the string pool; unmatched rows are ignored.
    pub fn load_locale(&mut self, path: &Path) -> Result<(), VmError> {
        let story = Arc::clone(self.require_story()?);
        let text = std::fs::read_to_string(path)?;
        self.locale_pool = crate::locale::build_overlay(&story, &text);
        self.locale_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(())
    }

    pub fn clear_locale(&mut self) {
        self.locale_pool.clear();
        self.locale_name.clear();
    }

    pub fn get_locale(&self) -> &str {
        &self.locale_name
    }

    // --- save / restore ---

    /// Write the complete runtime state to a file.
    pub fn save_state(&self, path: &Path) -> Result<(), VmError> {
        let state = self.snapshot()?;
        let bytes = save::encode(&state).map_err(VmError::SaveFailed)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Restore runtime state from a file. The same (or a schema-compatible)
    /// story must already be loaded; on any inconsistency the runtime state
    /// is left untouched.
    pub fn load_state(&mut self, path: &Path) -> Result<(), VmError> {
        let bytes = std::fs::read(path)?;
        let state = save::decode(&bytes).map_err(VmError::InvalidSaveFile)?;
        self.restore(state)
    }

    fn snapshot(&self) -> Result<SaveState, VmError> {
        let story = self.require_story()?;

        let mut variables: Vec<(String, Value)> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        let call_stack = self
            .call_stack
            .iter()
            .map(|frame| SavedFrame {
                node_name: story.nodes[frame.node].name.clone(),
                pc: frame.pc,
                return_var: frame.return_var.clone(),
                shadowed: frame
                    .shadowed
                    .iter()
                    .map(|sv| SavedShadow {
                        name: sv.name.clone(),
                        existed: sv.existed,
                        value: sv.value.clone(),
                    })
                    .collect(),
                params: frame.params.clone(),
            })
            .collect();

        // Choices persist as raw pool strings so restore can relocate them
        // by content even if indices shifted between story revisions.
        let pending_choices = self
            .pending_choices
            .iter()
            .map(|c| SavedChoice {
                text: story.pool_str(c.text_id).to_string(),
                target_node_name: story.pool_str(c.target_id).to_string(),
            })
            .collect();

        let mut visit_counts: Vec<(String, u32)> = self
            .visit_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        visit_counts.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(SaveState {
            story_version: story.version.clone(),
            current_node_name: story.nodes[self.current_node].name.clone(),
            pc: self.pc,
            finished: self.finished,
            variables,
            call_stack,
            pending_choices,
            visit_counts,
            chosen_once: self.chosen_once.iter().cloned().collect(),
        })
    }

    fn restore(&mut self, state: SaveState) -> Result<(), VmError> {
        let story = Arc::clone(self.require_story()?);

        // Resolve every node name before touching any runtime state.
        let current = if state.current_node_name.is_empty() {
            if state.finished {
                0
            } else {
                return Err(VmError::InvalidSaveFile("missing current node".to_string()));
            }
        } else {
            match self.node_index.get(&state.current_node_name) {
                Some(&idx) => idx,
                None => {
                    return Err(VmError::InvalidSaveFile(format!(
                        "unknown node: {}",
                        state.current_node_name
                    )))
                }
            }
        };

        let mut frames = Vec::new();
        for f in state.call_stack {
            let idx = match self.node_index.get(&f.node_name) {
                Some(&idx) => idx,
                None => {
                    return Err(VmError::InvalidSaveFile(format!(
                        "unknown node: {}",
                        f.node_name
                    )))
                }
            };
            frames.push(CallFrame {
                node: idx,
                pc: f.pc,
                return_var: f.return_var,
                shadowed: f
                    .shadowed
                    .into_iter()
                    .map(|s| ShadowedVar {
                        name: s.name,
                        value: s.value,
                        existed: s.existed,
                    })
                    .collect(),
                params: f.params,
            });
        }

        // Pending choices whose strings no longer exist in the pool are
        // dropped silently; this tolerates story edits between save and load.
        let mut pending = Vec::new();
        for c in state.pending_choices {
            let text_id = story.find_string(&c.text);
            let target_id = story.find_string(&c.target_node_name);
            if text_id >= 0 && target_id >= 0 {
                pending.push(PendingChoice {
                    text_id,
                    target_id,
                    modifier: ChoiceModifier::Default,
                    once_key: String::new(),
                });
            }
        }

        self.finished = state.finished;
        self.current_node = current;
        self.pc = state.pc;
        self.variables = state.variables.into_iter().collect();
        self.call_stack = frames;
        self.pending_choices = pending;
        self.visit_counts = state.visit_counts.into_iter().collect();
        self.chosen_once = state.chosen_once.into_iter().collect();
        self.pending_return = None;
        Ok(())
    }

    // --- debugger surface ---

    pub fn add_breakpoint(&mut self, node: &str, pc: u32) {
        self.breakpoints.insert((node.to_string(), pc));
    }

    pub fn remove_breakpoint(&mut self, node: &str, pc: u32) {
        self.breakpoints.remove(&(node.to_string(), pc));
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn has_breakpoint(&self, node: &str, pc: u32) -> bool {
        self.breakpoints.contains(&(node.to_string(), pc))
    }

    pub fn get_breakpoints(&self) -> Vec<(String, u32)> {
        self.breakpoints.iter().cloned().collect()
    }

    /// When on, `step` pauses before every instruction.
    pub fn set_step_mode(&mut self, enabled: bool) {
        self.step_mode = enabled;
        if !enabled {
            self.hit_breakpoint = false;
        }
    }

    pub fn is_step_mode(&self) -> bool {
        self.step_mode
    }

    pub fn get_location(&self) -> Option<DebugLocation> {
        let story = self.story.as_ref()?;
        let node = story.nodes.get(self.current_node)?;
        let instruction = node
            .lines
            .get(self.pc as usize)
            .map(|i| i.kind().to_string())
            .unwrap_or_else(|| "End".to_string());
        Some(DebugLocation {
            node: node.name.clone(),
            pc: self.pc,
            instruction,
        })
    }

    pub fn get_call_stack(&self) -> Vec<CallFrameInfo> {
        let story = match &self.story {
            Some(s) => s,
            None => return Vec::new(),
        };
        self.call_stack
            .iter()
            .map(|f| CallFrameInfo {
                node: story.nodes[f.node].name.clone(),
                pc: f.pc,
                return_var: f.return_var.clone(),
                params: f.params.clone(),
            })
            .collect()
    }

    pub fn current_node_name(&self) -> String {
        match &self.story {
            Some(story) => story
                .nodes
                .get(self.current_node)
                .map(|n| n.name.clone())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    pub fn current_pc(&self) -> u32 {
        self.pc
    }

    pub fn get_node_names(&self) -> Vec<String> {
        match &self.story {
            Some(story) => story.nodes.iter().map(|n| n.name.clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn get_node_instruction_count(&self, node: &str) -> u32 {
        match &self.story {
            Some(story) => story
                .node_index(node)
                .map(|i| story.nodes[i].lines.len() as u32)
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Human-readable description of one instruction, for debugger UIs.
    pub fn get_instruction_info(&self, node: &str, pc: u32) -> String {
        let story = match &self.story {
            Some(s) => s,
            None => return String::new(),
        };
        let idx = match story.node_index(node) {
            Some(i) => i,
            None => return String::new(),
        };
        let instr = match story.nodes[idx].lines.get(pc as usize) {
            Some(i) => i,
            None => return String::new(),
        };
        match instr {
            Instruction::Line {
                character_id,
                text_id,
                ..
            } => {
                if *character_id >= 0 {
                    format!(
                        "Line: {} \"{}\"",
                        story.pool_str(*character_id),
                        story.pool_str(*text_id)
                    )
                } else {
                    format!("Line: \"{}\"", story.pool_str(*text_id))
                }
            }
            Instruction::Choice {
                text_id, target_id, ..
            } => format!(
                "Choice: \"{}\" -> {}",
                story.pool_str(*text_id),
                story.pool_str(*target_id)
            ),
            Instruction::Jump {
                target_id, is_call, ..
            } => {
                if *is_call {
                    format!("Call -> {}", story.pool_str(*target_id))
                } else {
                    format!("Jump -> {}", story.pool_str(*target_id))
                }
            }
            Instruction::CallWithReturn {
                target_id,
                return_var_id,
                ..
            } => format!(
                "Call -> {} (result to ${})",
                story.pool_str(*target_id),
                story.pool_str(*return_var_id)
            ),
            Instruction::Return { .. } => "Return".to_string(),
            Instruction::SetVar { var_id, .. } => {
                format!("SetVar: ${}", story.pool_str(*var_id))
            }
            Instruction::Condition { true_target_id, .. } => {
                format!("Condition -> {}", story.pool_str(*true_target_id))
            }
            Instruction::Random { branches } => {
                format!("Random: {} branches", branches.len())
            }
            Instruction::Command { type_id, .. } => {
                format!("Command: {}", story.pool_str(*type_id))
            }
        }
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::Str(s) => s,
        other => other.to_string(),
    }
}
