use crate::core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a state stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMsg {
    /// Full snapshot; resets the baseline
    Replace { state: Value },
    /// RFC 6902 diff against the previous state
    Patch { patch: json_patch::Patch },
}

impl StreamMsg {
    pub fn replace(state: Value) -> Self {
        StreamMsg::Replace { state }
    }

    /// Diff two states, `None` when they are equal
    pub fn diff(from: &Value, to: &Value) -> Option<Self> {
        let patch = json_patch::diff(from, to);
        if patch.0.is_empty() {
            None
        } else {
            Some(StreamMsg::Patch { patch })
        }
    }

    pub fn is_replace(&self) -> bool {
        matches!(self, StreamMsg::Replace { .. })
    }
}

/// Fold one message into `state`.
///
/// Patches are applied to a copy, so a patch that fails halfway leaves
/// `state` untouched.
pub fn apply_message(state: &mut Value, msg: &StreamMsg) -> Result<()> {
    match msg {
        StreamMsg::Replace { state: snapshot } => {
            *state = snapshot.clone();
        }
        StreamMsg::Patch { patch } => {
            let mut next = state.clone();
            json_patch::patch(&mut next, &patch.0)?;
            *state = next;
        }
    }
    Ok(())
}

/// Fold a message that is still in its JSON form
pub fn apply_raw(state: &mut Value, raw: &Value) -> Result<()> {
    let msg: StreamMsg = serde_json::from_value(raw.clone())?;
    apply_message(state, &msg)
}
