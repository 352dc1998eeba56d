//! Relationship expansion.
//!
//! Given one relationship mutation, or a whole-record add/remove, computes
//! the closure of operations that keeps every affected relationship
//! bidirectionally consistent with the current cache state: no relationship
//! is ever one-sided at rest.
//!
//! Traversal is an explicit worklist plus a visited-set of canonical path
//! strings, so self-referential relationship graphs (`next`/`previous`)
//! terminate without recursion depth concerns.
use crate::cache::{GraphCache, Retrieved};
use crate::errors::ExpanderError;
use graph_sync_shared::{
    Cardinality, LinkValue, OpKind, Operation, Path, PathShape, Record, REL_MARKER,
};
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Value carried by one pending visit: a single related id for hasOne and
/// member operations, a full id-set for container replacement.
#[derive(Debug, Clone)]
enum VisitValue {
    Id(Option<String>),
    Ids(BTreeSet<String>),
}

#[derive(Debug)]
struct Visit {
    op: OpKind,
    path: Path,
    value: VisitValue,
}

/// Expands relationship-changing operations into their bidirectional
/// closure. Stateless apart from the schema; cache state is read per call.
pub struct RelationshipExpander {
    schema: Arc<graph_sync_shared::Schema>,
}

impl RelationshipExpander {
    pub fn new(schema: Arc<graph_sync_shared::Schema>) -> Self {
        RelationshipExpander { schema }
    }

    /// Computes the ordered closure for `operation`.
    ///
    /// Relationship paths expand through inverse traversal; record paths fan
    /// out into one link expansion per populated relationship; anything else
    /// is its own closure. An empty closure means the operation is a no-op
    /// (e.g. removing an already-empty hasOne).
    pub fn expand(
        &self,
        cache: &dyn GraphCache,
        operation: &Operation,
    ) -> Result<Vec<Operation>, ExpanderError> {
        match operation.path.shape() {
            PathShape::Link | PathShape::LinkMember => {
                let ops = self.expand_link(cache, operation, false)?;
                Ok(sorted_by_op(coalesce(ops)))
            }
            PathShape::Record => self.expand_record(cache, operation),
            _ => Ok(vec![operation.clone()]),
        }
    }

    /// Record-level add/remove: the record operation itself plus the link
    /// closure of every populated relationship it carries, shallow before
    /// deep so the record exists before any of its relationships apply.
    fn expand_record(
        &self,
        cache: &dyn GraphCache,
        operation: &Operation,
    ) -> Result<Vec<Operation>, ExpanderError> {
        let model = operation.path.model();
        let record_id = operation.path.id();

        let record_value = match cache.retrieve(&operation.path) {
            Retrieved::Value(value) => value,
            _ => operation
                .value
                .clone()
                .ok_or_else(|| ExpanderError::RecordNotFound(operation.path.canonical()))?,
        };
        let record = Record::from_value(record_id, &record_value);

        let mut ops = vec![operation.clone()];
        for link in self.schema.links_of(model)? {
            let Some(link_value) = record.links.get(link) else {
                continue;
            };
            if link_value.is_uninitialized() || link_value.is_empty() {
                continue;
            }
            let link_operation = Operation {
                op: operation.op,
                path: Path::link(model, record_id, link),
                value: Some(link_value.to_value()),
            };
            // Each link expands with its own visited-set; duplicates across
            // links are coalesced below.
            let link_ops = self.expand_link(cache, &link_operation, true)?;
            ops.extend(sorted_by_op(link_ops));
        }

        Ok(sorted_by_depth(coalesce(ops)))
    }

    /// Link-level expansion: normalize the trigger, then walk the worklist.
    /// `initialize` marks an explicit initialize pass (record fan-out),
    /// which is allowed to touch uninitialized containers.
    fn expand_link(
        &self,
        cache: &dyn GraphCache,
        operation: &Operation,
        initialize: bool,
    ) -> Result<Vec<Operation>, ExpanderError> {
        let trigger = self.normalize(cache, operation)?;

        let mut operations = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut worklist: VecDeque<Visit> = VecDeque::new();
        worklist.push_back(trigger);

        while let Some(visit) = worklist.pop_front() {
            let key = visit.path.canonical();
            if visited.contains(&key) {
                continue;
            }
            if !initialize && cache.retrieve(&visit.path) == Retrieved::Uninitialized {
                // Never fetched and not an explicit initialize: leave it
                // alone rather than fabricating state for the far side.
                continue;
            }
            visited.insert(key);

            if visit.path.id().is_empty() {
                return Err(ExpanderError::MalformedId(visit.path.canonical()));
            }

            let link_def = self
                .schema
                .link_definition(visit.path.model(), visit.path.link_name())?;

            match link_def.cardinality {
                Cardinality::HasOne => {
                    self.visit_has_one(cache, &visit, &mut operations, &mut worklist)?
                }
                Cardinality::HasMany => {
                    self.visit_has_many(cache, &visit, &mut operations, &mut worklist)?
                }
            }
        }

        Ok(operations)
    }

    fn visit_has_one(
        &self,
        cache: &dyn GraphCache,
        visit: &Visit,
        operations: &mut Vec<Operation>,
        worklist: &mut VecDeque<Visit>,
    ) -> Result<(), ExpanderError> {
        let link_def = self
            .schema
            .link_definition(visit.path.model(), visit.path.link_name())?;
        let owner_id = visit.path.id().to_string();
        let current = match cache.retrieve(&visit.path) {
            Retrieved::Value(Value::String(id)) => Some(id),
            _ => None,
        };

        match visit.op {
            OpKind::Add | OpKind::Replace => {
                let new_id = match &visit.value {
                    VisitValue::Id(Some(id)) if !id.is_empty() => id.clone(),
                    _ => return Err(ExpanderError::MalformedId(visit.path.canonical())),
                };
                operations.push(Operation {
                    op: visit.op,
                    path: visit.path.clone(),
                    value: Some(Value::String(new_id.clone())),
                });
                if let Some(old_id) = current {
                    worklist.push_back(Visit {
                        op: OpKind::Remove,
                        path: Path::link(&link_def.model, &old_id, &link_def.inverse),
                        value: VisitValue::Id(Some(owner_id.clone())),
                    });
                }
                worklist.push_back(Visit {
                    op: OpKind::Add,
                    path: Path::link(&link_def.model, &new_id, &link_def.inverse),
                    value: VisitValue::Id(Some(owner_id)),
                });
            }
            OpKind::Remove => {
                // No-op if the link holds nothing to detach.
                let VisitValue::Id(Some(_)) = &visit.value else {
                    return Ok(());
                };
                operations.push(Operation::remove(visit.path.clone()));
                if let Some(old_id) = current {
                    worklist.push_back(Visit {
                        op: OpKind::Remove,
                        path: Path::link(&link_def.model, &old_id, &link_def.inverse),
                        value: VisitValue::Id(Some(owner_id)),
                    });
                }
            }
        }
        Ok(())
    }

    fn visit_has_many(
        &self,
        cache: &dyn GraphCache,
        visit: &Visit,
        operations: &mut Vec<Operation>,
        worklist: &mut VecDeque<Visit>,
    ) -> Result<(), ExpanderError> {
        let link_def = self
            .schema
            .link_definition(visit.path.model(), visit.path.link_name())?;
        let owner_id = visit.path.id().to_string();

        match (&visit.value, visit.op) {
            (VisitValue::Id(member), OpKind::Add | OpKind::Remove) => {
                let member = match member {
                    Some(id) if !id.is_empty() => id.clone(),
                    _ => return Err(ExpanderError::MalformedId(visit.path.canonical())),
                };
                let member_path = visit.path.join(&member);
                match visit.op {
                    OpKind::Add => operations.push(Operation::add(member_path, Value::Bool(true))),
                    _ => operations.push(Operation::remove(member_path)),
                }
                worklist.push_back(Visit {
                    op: visit.op,
                    path: Path::link(&link_def.model, &member, &link_def.inverse),
                    value: VisitValue::Id(Some(owner_id)),
                });
            }
            (VisitValue::Ids(requested), _) => {
                let mut map = Map::new();
                for id in requested {
                    if id.is_empty() {
                        return Err(ExpanderError::MalformedId(visit.path.canonical()));
                    }
                    map.insert(id.clone(), Value::Bool(true));
                }
                operations.push(Operation::replace(visit.path.clone(), Value::Object(map)));

                let current: BTreeSet<String> = match cache.retrieve(&visit.path) {
                    Retrieved::Value(Value::Object(members)) => {
                        members.keys().cloned().collect()
                    }
                    _ => BTreeSet::new(),
                };
                for added in requested.difference(&current) {
                    worklist.push_back(Visit {
                        op: OpKind::Add,
                        path: Path::link(&link_def.model, added, &link_def.inverse),
                        value: VisitValue::Id(Some(owner_id.clone())),
                    });
                }
                for removed in current.difference(requested) {
                    worklist.push_back(Visit {
                        op: OpKind::Remove,
                        path: Path::link(&link_def.model, removed, &link_def.inverse),
                        value: VisitValue::Id(Some(owner_id.clone())),
                    });
                }
            }
            (VisitValue::Id(_), OpKind::Replace) => {
                return Err(ExpanderError::MalformedId(visit.path.canonical()));
            }
        }
        Ok(())
    }

    /// Normalizes a trigger operation into its visit form: member operations
    /// move to the container path with the member id as value, container
    /// payloads become id-sets, and a hasOne remove picks up the value it is
    /// detaching from the cache.
    fn normalize(
        &self,
        cache: &dyn GraphCache,
        operation: &Operation,
    ) -> Result<Visit, ExpanderError> {
        let path = &operation.path;
        if path.shape() == PathShape::LinkMember {
            return Ok(Visit {
                op: operation.op,
                path: path.container_path(),
                value: VisitValue::Id(Some(path.member_id().to_string())),
            });
        }

        let link_def = self.schema.link_definition(path.model(), path.link_name())?;
        match link_def.cardinality {
            Cardinality::HasOne => {
                let value = match operation.op {
                    OpKind::Remove => match cache.retrieve(path) {
                        Retrieved::Value(Value::String(id)) => Some(id),
                        _ => None,
                    },
                    _ => match &operation.value {
                        Some(Value::String(id)) => Some(id.clone()),
                        _ => None,
                    },
                };
                Ok(Visit {
                    op: operation.op,
                    path: path.clone(),
                    value: VisitValue::Id(value),
                })
            }
            Cardinality::HasMany => {
                let ids: BTreeSet<String> = match (operation.op, &operation.value) {
                    (OpKind::Remove, _) => BTreeSet::new(),
                    (_, Some(Value::Object(map))) => map.keys().cloned().collect(),
                    _ => BTreeSet::new(),
                };
                // Container add/remove/replace all normalize to a whole-set
                // replacement diffed against the current members.
                Ok(Visit {
                    op: OpKind::Replace,
                    path: path.clone(),
                    value: VisitValue::Ids(ids),
                })
            }
        }
    }
}

/// Merges duplicate (path, op) pairs: the first occurrence keeps its
/// position, the latest payload wins.
fn coalesce(ops: Vec<Operation>) -> Vec<Operation> {
    let mut index: HashMap<(String, OpKind), usize> = HashMap::new();
    let mut merged: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        match index.entry((op.path.canonical(), op.op)) {
            Entry::Occupied(entry) => merged[*entry.get()].value = op.value,
            Entry::Vacant(entry) => {
                entry.insert(merged.len());
                merged.push(op);
            }
        }
    }
    merged
}

/// Stable detach-first ordering: removes detach the old side before the
/// triggering replace lands, and adds attach the new side last.
fn sorted_by_op(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by_key(|op| match op.op {
        OpKind::Remove => 0,
        OpKind::Replace => 1,
        OpKind::Add => 2,
    });
    ops
}

/// Stable shallow-first ordering for record expansion: the record operation
/// precedes its link operations.
fn sorted_by_depth(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by_key(|op| op.path.len());
    ops
}

/// True when the value is a relationship payload carrying the uninitialized
/// sentinel (such writes are ignored rather than expanded).
pub fn is_uninitialized_payload(operation: &Operation) -> bool {
    matches!(operation.path.segments().get(2).map(String::as_str), Some(m) if m == REL_MARKER)
        && operation
            .value
            .as_ref()
            .map(LinkValue::value_is_sentinel)
            .unwrap_or(false)
}
