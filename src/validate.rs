//! Cross-node reference validation.
//!
//! Runs after parsing, before emit: every node name referenced by a jump,
//! call, choice, condition branch, or random branch must name a node that
//! exists. A false-branch target of -1 is the documented fall-through and is
//! always accepted. Failures carry the source line of the offending
//! instruction.

use crate::parser::{Diagnostic, SourceMap};
use crate::story::{Instruction, Story};

/// Check every cross-node reference in `story`, reporting one diagnostic per
/// unresolved target.
pub fn check_references(story: &Story, map: &SourceMap, file: &str) -> Vec<Diagnostic> {
    let mut errors = Vec::new();

    let mut report = |target_id: i32, line: u32, errors: &mut Vec<Diagnostic>| {
        let name = story.pool_str(target_id);
        if story.node_index(name).is_none() {
            errors.push(Diagnostic {
                file: file.to_string(),
                line,
                message: format!("target node does not exist: {}", name),
            });
        }
    };

    for (ni, node) in story.nodes.iter().enumerate() {
        for (ii, instr) in node.lines.iter().enumerate() {
            let line = map.instr_line(ni, ii);
            match instr {
                Instruction::Jump { target_id, .. } => report(*target_id, line, &mut errors),
                Instruction::CallWithReturn { target_id, .. } => {
                    report(*target_id, line, &mut errors)
                }
                Instruction::Choice { target_id, .. } => report(*target_id, line, &mut errors),
                Instruction::Condition {
                    true_target_id,
                    false_target_id,
                    ..
                } => {
                    report(*true_target_id, line, &mut errors);
                    if *false_target_id >= 0 {
                        report(*false_target_id, line, &mut errors);
                    }
                }
                Instruction::Random { branches } => {
                    for (bi, branch) in branches.iter().enumerate() {
                        let branch_line = map.branch_line(ni, ii, bi).unwrap_or(line);
                        report(branch.target_id, branch_line, &mut errors);
                    }
                }
                _ => {}
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use crate::parser::compile_source;

    #[test]
    fn test_valid_targets_pass() {
        let src = "label start:\n    jump other\nlabel other:\n    \"end\"\n";
        assert!(compile_source(src, "test.skein").is_ok());
    }

    #[test]
    fn test_invalid_jump_target() {
        let src = "label start:\n    jump nowhere\n";
        let errors = compile_source(src, "test.skein").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("does not exist") && e.message.contains("nowhere")));
        assert_eq!(errors[0].line, 2);
    }

    #[test]
    fn test_invalid_choice_target() {
        let src = "label start:\n    menu:\n        \"Go\" -> missing\n";
        let errors = compile_source(src, "test.skein").unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("missing")));
    }

    #[test]
    fn test_invalid_condition_targets() {
        let src = "label start:\n    if x == 1 -> gone else also_gone\n";
        let errors = compile_source(src, "test.skein").unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_condition_without_else_allowed() {
        let src = "label start:\n    if x == 1 -> other\n    \"fell through\"\nlabel other:\n    \"o\"\n";
        assert!(compile_source(src, "test.skein").is_ok());
    }

    #[test]
    fn test_random_branch_targets_each_reported() {
        let src = "label start:\n    random:\n        50 -> ghost_a\n        50 -> ghost_b\n";
        let errors = compile_source(src, "test.skein").unwrap_err();
        let missing = errors
            .iter()
            .filter(|e| e.message.contains("does not exist"))
            .count();
        assert_eq!(missing, 2);
        assert_eq!(errors[0].line, 3);
        assert_eq!(errors[1].line, 4);
    }
}
