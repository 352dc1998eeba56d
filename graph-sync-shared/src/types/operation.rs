//! Graph mutations.
use crate::types::path::Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three mutation kinds applied to a graph position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Replace,
    Remove,
}

/// One atomic mutation: a kind, a path, and (for add/replace) a value.
///
/// Operations are the unit everything in the engine trades in: the remote
/// store delivers them, the expander produces closures of them, the
/// sequencer defers and admits them, and the cache applies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    pub path: Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Operation {
    pub fn add(path: Path, value: Value) -> Self {
        Operation {
            op: OpKind::Add,
            path,
            value: Some(value),
        }
    }

    pub fn replace(path: Path, value: Value) -> Self {
        Operation {
            op: OpKind::Replace,
            path,
            value: Some(value),
        }
    }

    pub fn remove(path: Path) -> Self {
        Operation {
            op: OpKind::Remove,
            path,
            value: None,
        }
    }

    /// Structural `{op, value}` equality, ignoring the path. The operation
    /// filter compares payloads under a path key it normalizes itself.
    pub fn same_payload(&self, other: &Operation) -> bool {
        self.op == other.op && self.value == other.value
    }
}
