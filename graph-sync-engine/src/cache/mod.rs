//! The local graph cache: the authoritative in-process snapshot.
//!
//! The cache applies exactly one operation at a time, atomically and
//! synchronously, and exposes synchronous point reads. It is mutated only by
//! the sequencer (remote-originated operations) and the local write path.
use crate::errors::CacheError;
use graph_sync_shared::{Operation, Path};
use serde_json::Value;

pub mod memory;

pub use memory::MemoryCache;

/// Result of a point read. `Uninitialized` is the relationship sentinel:
/// the link exists in the schema but has never been fetched, which is not
/// the same thing as absent or empty.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieved {
    Absent,
    Uninitialized,
    Value(Value),
}

impl Retrieved {
    /// True when the path resolves to a present, non-sentinel value. This is
    /// the predicate the sequencer evaluates preconditions with.
    pub fn is_present(&self) -> bool {
        matches!(self, Retrieved::Value(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Retrieved::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Synchronous, atomic, single-operation view of the local graph snapshot.
pub trait GraphCache: Send + Sync {
    /// Reads the value at `path`, classifying absence and the uninitialized
    /// sentinel separately.
    fn retrieve(&self, path: &Path) -> Retrieved;

    /// Applies one operation and returns its inverse.
    fn transform(&self, operation: &Operation) -> Result<Operation, CacheError>;
}
