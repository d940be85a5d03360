//! Save-state container.
//!
//! A save file captures everything the VM could differ on at its next step:
//! position, variables (with full types, strings and lists stored inline so
//! a save can name strings the pool does not contain), the call stack with
//! shadowed variables and parameter names, pending choices (by content, not
//! by index), visit counts, and the chosen-once set. The RNG sequence is
//! deliberately not captured; deterministic testing goes through `set_seed`.
//!
//! Layout: `SKSV` magic, then a versioned envelope whose payload is the
//! per-version state struct. Version "1" predates `shadowed`/`params`/
//! `chosen_once`; those load as empty. Unknown versions are rejected.

use crate::value::Value;
use serde::{Deserialize, Serialize};

pub const SAVE_MAGIC: &[u8; 4] = b"SKSV";
pub const SAVE_FORMAT_VERSION: &str = "2";

/// The complete captured runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveState {
    pub story_version: String,
    pub current_node_name: String,
    pub pc: u32,
    pub finished: bool,
    pub variables: Vec<(String, Value)>,
    pub call_stack: Vec<SavedFrame>,
    pub pending_choices: Vec<SavedChoice>,
    pub visit_counts: Vec<(String, u32)>,
    pub chosen_once: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedFrame {
    pub node_name: String,
    pub pc: u32,
    pub return_var: String,
    pub shadowed: Vec<SavedShadow>,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedShadow {
    pub name: String,
    pub existed: bool,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedChoice {
    pub text: String,
    pub target_node_name: String,
}

/// Versioned envelope. The outer shape never changes; only the payload
/// encoding is version-dependent.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: String,
    payload: Vec<u8>,
}

// The previous format: frames carried no shadowed variables or parameter
// names, and the chosen-once set did not exist yet.

#[derive(Serialize, Deserialize)]
struct SaveStateV1 {
    story_version: String,
    current_node_name: String,
    pc: u32,
    finished: bool,
    variables: Vec<(String, Value)>,
    call_stack: Vec<SavedFrameV1>,
    pending_choices: Vec<SavedChoice>,
    visit_counts: Vec<(String, u32)>,
}

#[derive(Serialize, Deserialize)]
struct SavedFrameV1 {
    node_name: String,
    pc: u32,
    return_var: String,
}

impl From<SaveStateV1> for SaveState {
    fn from(v1: SaveStateV1) -> Self {
        SaveState {
            story_version: v1.story_version,
            current_node_name: v1.current_node_name,
            pc: v1.pc,
            finished: v1.finished,
            variables: v1.variables,
            call_stack: v1
                .call_stack
                .into_iter()
                .map(|f| SavedFrame {
                    node_name: f.node_name,
                    pc: f.pc,
                    return_var: f.return_var,
                    shadowed: Vec::new(),
                    params: Vec::new(),
                })
                .collect(),
            pending_choices: v1.pending_choices,
            visit_counts: v1.visit_counts,
            chosen_once: Vec::new(),
        }
    }
}

/// Serialize a save state to its binary form.
pub fn encode(state: &SaveState) -> Result<Vec<u8>, String> {
    let payload = bincode::serialize(state).map_err(|e| e.to_string())?;
    let envelope = Envelope {
        version: SAVE_FORMAT_VERSION.to_string(),
        payload,
    };
    let body = bincode::serialize(&envelope).map_err(|e| e.to_string())?;
    let mut out = Vec::with_capacity(body.len() + SAVE_MAGIC.len());
    out.extend_from_slice(SAVE_MAGIC);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Verify and deserialize a save buffer, upgrading old versions.
pub fn decode(bytes: &[u8]) -> Result<SaveState, String> {
    if bytes.len() < SAVE_MAGIC.len() || &bytes[..SAVE_MAGIC.len()] != SAVE_MAGIC {
        return Err("bad magic".to_string());
    }
    let envelope: Envelope = bincode::deserialize(&bytes[SAVE_MAGIC.len()..])
        .map_err(|e| format!("malformed envelope: {}", e))?;
    match envelope.version.as_str() {
        SAVE_FORMAT_VERSION => bincode::deserialize::<SaveState>(&envelope.payload)
            .map_err(|e| format!("malformed state: {}", e)),
        "1" => bincode::deserialize::<SaveStateV1>(&envelope.payload)
            .map(SaveState::from)
            .map_err(|e| format!("malformed state: {}", e)),
        other => Err(format!("unsupported save version: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SaveState {
        SaveState {
            story_version: "2".to_string(),
            current_node_name: "shop".to_string(),
            pc: 3,
            finished: false,
            variables: vec![
                ("gold".to_string(), Value::Int(12)),
                ("name".to_string(), Value::Str("Rin".to_string())),
                (
                    "bag".to_string(),
                    Value::List(vec!["rope".to_string(), "torch".to_string()]),
                ),
            ],
            call_stack: vec![SavedFrame {
                node_name: "start".to_string(),
                pc: 1,
                return_var: "r".to_string(),
                shadowed: vec![SavedShadow {
                    name: "n".to_string(),
                    existed: false,
                    value: Value::Int(0),
                }],
                params: vec!["n".to_string()],
            }],
            pending_choices: vec![SavedChoice {
                text: "Buy".to_string(),
                target_node_name: "buy".to_string(),
            }],
            visit_counts: vec![("shop".to_string(), 1), ("start".to_string(), 1)],
            chosen_once: vec!["shop:4".to_string()],
        }
    }

    #[test]
    fn test_round_trip() {
        let state = sample();
        let bytes = encode(&state).unwrap();
        assert_eq!(decode(&bytes).unwrap(), state);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = b'?';
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = encode(&sample()).unwrap();
        assert!(decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(decode(&bytes[..1]).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let envelope = Envelope {
            version: "99".to_string(),
            payload: Vec::new(),
        };
        let mut bytes = SAVE_MAGIC.to_vec();
        bytes.extend(bincode::serialize(&envelope).unwrap());
        let err = decode(&bytes).unwrap_err();
        assert!(err.contains("unsupported save version"));
    }

    #[test]
    fn test_v1_loads_with_empty_optional_fields() {
        let v1 = SaveStateV1 {
            story_version: "2".to_string(),
            current_node_name: "start".to_string(),
            pc: 2,
            finished: false,
            variables: vec![("hp".to_string(), Value::Int(30))],
            call_stack: vec![SavedFrameV1 {
                node_name: "start".to_string(),
                pc: 0,
                return_var: String::new(),
            }],
            pending_choices: Vec::new(),
            visit_counts: vec![("start".to_string(), 1)],
        };
        let envelope = Envelope {
            version: "1".to_string(),
            payload: bincode::serialize(&v1).unwrap(),
        };
        let mut bytes = SAVE_MAGIC.to_vec();
        bytes.extend(bincode::serialize(&envelope).unwrap());

        let state = decode(&bytes).unwrap();
        assert_eq!(state.pc, 2);
        assert_eq!(state.call_stack.len(), 1);
        assert!(state.call_stack[0].shadowed.is_empty());
        assert!(state.call_stack[0].params.is_empty());
        assert!(state.chosen_once.is_empty());
    }
}
