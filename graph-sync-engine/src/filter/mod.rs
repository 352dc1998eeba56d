//! Echo suppression for self-originated writes.
//!
//! Every write this process sends to the remote store comes back through the
//! same subscription channel used for other writers' changes. The filter is
//! told about each outgoing write just before it is sent (`block_next`) and
//! consulted for every operation arriving from the stream (`blocks_next`);
//! a matching blocked entry suppresses exactly one echo.
use graph_sync_shared::Operation;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// One registered outgoing write awaiting its echo. Matching is structural
/// on `{op, value}`; the path is the map key.
#[derive(Debug, Clone)]
struct BlockedWrite {
    operation: Operation,
}

/// Pure-state echo filter: per canonical path, a FIFO list of `{op, value}`
/// entries, each consumed at most once.
#[derive(Debug, Default)]
pub struct OperationFilter {
    blocked: HashMap<String, VecDeque<BlockedWrite>>,
}

impl OperationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers that a write with this `{op, value}` at this path is about
    /// to be sent and will be echoed back. Call immediately before sending.
    pub fn block_next(&mut self, operation: &Operation) {
        self.blocked
            .entry(operation.path.canonical())
            .or_default()
            .push_back(BlockedWrite {
                operation: operation.clone(),
            });
    }

    /// Consults the filter for an operation arriving from the stream. When a
    /// blocked entry at the same path matches `{op, value}`, that one entry
    /// is removed and the operation is suppressed.
    pub fn blocks_next(&mut self, operation: &Operation) -> bool {
        let key = operation.path.canonical();
        let Some(entries) = self.blocked.get_mut(&key) else {
            return false;
        };
        let Some(index) = entries
            .iter()
            .position(|entry| entry.operation.same_payload(operation))
        else {
            return false;
        };
        entries.remove(index);
        if entries.is_empty() {
            self.blocked.remove(&key);
        }
        debug!(path = %key, "suppressed self-originated echo");
        true
    }

    /// Number of writes still awaiting their echo.
    pub fn pending(&self) -> usize {
        self.blocked.values().map(VecDeque::len).sum()
    }
}
