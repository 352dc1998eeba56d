//! Operation admission and deferral.
//!
//! Remote-originated operations arrive in no particular order: a
//! relationship op can land before either record it references, an attribute
//! op before its record. The sequencer admits an operation into the cache
//! only once its preconditions hold, defers it otherwise, and re-admits
//! deferred operations automatically as their required paths resolve — in
//! resolution order, not arrival order.
//!
//! This is a small reactive dependency-count dataflow, not a general
//! topological sort: path existence is monotonic within a session, so no
//! cycle detection is needed.
use crate::cache::GraphCache;
use crate::errors::SequencerError;
use graph_sync_shared::{Cardinality, OpKind, Operation, Path, PathShape, Schema};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// One deferred operation and the required paths it is still missing.
struct Pending {
    operation: Operation,
    outstanding: HashSet<String>,
}

/// Admits operations whose preconditions hold; defers the rest against the
/// paths they are missing.
pub struct OperationSequencer {
    schema: Arc<Schema>,
    cache: Arc<dyn GraphCache>,
    /// Reverse index: required path → pending operation ids waiting on it.
    dependents: HashMap<String, Vec<u64>>,
    /// Deferred operations by id. Keying by id rather than path keeps two
    /// deferred operations at the same path from sharing an outstanding set.
    pending: HashMap<u64, Pending>,
    next_id: u64,
}

impl OperationSequencer {
    pub fn new(schema: Arc<Schema>, cache: Arc<dyn GraphCache>) -> Self {
        OperationSequencer {
            schema,
            cache,
            dependents: HashMap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// Processes one remote-originated operation. Returns every operation
    /// admitted as a consequence (the operation itself and any deferred
    /// operations it unblocked), already applied to the cache, in admission
    /// order. An empty result means the operation was deferred, dropped as
    /// stale, or skipped as redundant.
    pub fn process(&mut self, operation: &Operation) -> Result<Vec<Operation>, SequencerError> {
        let mut admitted = Vec::new();

        match operation.path.shape() {
            PathShape::Record => {
                if operation.op == OpKind::Remove {
                    self.emit(operation, &mut admitted)?;
                } else if self.record_exists(&operation.path) {
                    // Subscriptions keep existing records up to date; a
                    // repeat add/replace is redundant.
                    trace!(path = %operation.path, "skipping redundant record operation");
                } else {
                    self.emit(operation, &mut admitted)?;
                }
            }
            PathShape::Attribute => {
                if self.record_exists(&operation.path.record_path()) {
                    self.emit(operation, &mut admitted)?;
                } else {
                    // The record add that eventually arrives already carries
                    // current attribute values; a stale attribute op is
                    // dropped, never deferred.
                    debug!(path = %operation.path, "dropping attribute operation for absent record");
                }
            }
            PathShape::Link | PathShape::LinkMember => {
                let required = self.required_paths(operation)?;
                let missing: Vec<Path> = required
                    .into_iter()
                    .filter(|path| !self.cache.retrieve(path).is_present())
                    .collect();
                if missing.is_empty() {
                    self.emit(operation, &mut admitted)?;
                } else {
                    self.defer(operation, &missing);
                }
            }
            PathShape::Malformed => {
                return Err(SequencerError::MalformedPath(operation.path.canonical()));
            }
        }

        Ok(admitted)
    }

    /// Number of operations currently deferred.
    pub fn deferred(&self) -> usize {
        self.pending.len()
    }

    /// The paths an operation must see resolved before admission.
    fn required_paths(&self, operation: &Operation) -> Result<Vec<Path>, SequencerError> {
        let path = &operation.path;
        let link_def = self.schema.link_definition(path.model(), path.link_name())?;

        let mut required = vec![path.record_path()];
        match (path.shape(), link_def.cardinality) {
            (PathShape::Link, Cardinality::HasOne) => {
                // A hasOne pointing at a real id must also wait for the
                // record it references; detaches (null/remove) need not.
                if let Some(serde_json::Value::String(related)) = &operation.value {
                    required.push(Path::record(&link_def.model, related));
                }
            }
            (PathShape::Link, Cardinality::HasMany) => {
                // Container initialization waits only on its owner.
            }
            (PathShape::LinkMember, _) => {
                required.push(Path::record(&link_def.model, path.member_id()));
                required.push(path.container_path());
            }
            _ => {}
        }
        Ok(required)
    }

    fn record_exists(&self, path: &Path) -> bool {
        self.cache.retrieve(&path.record_path()).is_present()
    }

    /// Applies the operation to the cache and cascades into any operations
    /// that were waiting on this operation's path.
    fn emit(
        &mut self,
        operation: &Operation,
        admitted: &mut Vec<Operation>,
    ) -> Result<(), SequencerError> {
        self.cache.transform(operation)?;
        admitted.push(operation.clone());
        self.resolve_waiters(&operation.path, admitted)
    }

    fn defer(&mut self, operation: &Operation, missing: &[Path]) {
        let id = self.next_id;
        self.next_id += 1;
        debug!(
            path = %operation.path,
            missing = missing.len(),
            "deferring operation until required paths resolve"
        );
        let mut outstanding = HashSet::new();
        for path in missing {
            let required_key = path.canonical();
            self.dependents
                .entry(required_key.clone())
                .or_default()
                .push(id);
            outstanding.insert(required_key);
        }
        self.pending.insert(
            id,
            Pending {
                operation: operation.clone(),
                outstanding,
            },
        );
    }

    fn resolve_waiters(
        &mut self,
        resolved: &Path,
        admitted: &mut Vec<Operation>,
    ) -> Result<(), SequencerError> {
        let resolved_key = resolved.canonical();
        let Some(waiters) = self.dependents.remove(&resolved_key) else {
            return Ok(());
        };

        for id in waiters {
            let ready = match self.pending.get_mut(&id) {
                Some(pending) => {
                    pending.outstanding.remove(&resolved_key);
                    pending.outstanding.is_empty()
                }
                None => false,
            };
            if ready {
                if let Some(pending) = self.pending.remove(&id) {
                    self.emit(&pending.operation, admitted)?;
                }
            }
        }
        Ok(())
    }
}
