//! Cached records and relationship values.
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::path::REL_MARKER;

/// JSON sentinel for a relationship that has never been fetched. Distinct
/// from empty/null and never persisted to the remote store.
pub const UNINITIALIZED_SENTINEL: &str = "__not_initialized__";

/// The value of one relationship on a record.
///
/// A hasOne holds at most one related id; a hasMany holds a set. Either may
/// instead be `Uninitialized`, meaning the relationship was never fetched —
/// which is not the same thing as empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkValue {
    Uninitialized,
    One(Option<String>),
    Many(BTreeSet<String>),
}

impl LinkValue {
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, LinkValue::Uninitialized)
    }

    /// True when the relationship holds no related id (uninitialized counts
    /// as empty for fan-out purposes).
    pub fn is_empty(&self) -> bool {
        match self {
            LinkValue::Uninitialized => true,
            LinkValue::One(id) => id.is_none(),
            LinkValue::Many(ids) => ids.is_empty(),
        }
    }

    /// JSON form: hasOne → scalar id or null, hasMany → `{id: true, ...}`,
    /// uninitialized → the sentinel string.
    pub fn to_value(&self) -> Value {
        match self {
            LinkValue::Uninitialized => Value::String(UNINITIALIZED_SENTINEL.to_string()),
            LinkValue::One(None) => Value::Null,
            LinkValue::One(Some(id)) => Value::String(id.clone()),
            LinkValue::Many(ids) => {
                let mut map = Map::new();
                for id in ids {
                    map.insert(id.clone(), Value::Bool(true));
                }
                Value::Object(map)
            }
        }
    }

    /// Rebuilds a link value from its JSON form. Objects are hasMany member
    /// maps; strings are hasOne ids (or the sentinel); null is an empty
    /// hasOne.
    pub fn from_value(value: &Value) -> LinkValue {
        match value {
            Value::String(s) if s == UNINITIALIZED_SENTINEL => LinkValue::Uninitialized,
            Value::String(s) => LinkValue::One(Some(s.clone())),
            Value::Null => LinkValue::One(None),
            Value::Object(map) => LinkValue::Many(map.keys().cloned().collect()),
            _ => LinkValue::One(None),
        }
    }

    /// True when `value` is the uninitialized sentinel string.
    pub fn value_is_sentinel(value: &Value) -> bool {
        matches!(value, Value::String(s) if s == UNINITIALIZED_SENTINEL)
    }
}

/// A cached record: flat attribute map plus a relationship map keyed by link
/// name. Keyed by (type, id) in the cache; the type is carried by the path,
/// not the record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub id: String,
    pub attributes: BTreeMap<String, Value>,
    pub links: BTreeMap<String, LinkValue>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Record {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Canonical in-cache JSON form: `{"id": ..., attrs..., "rel": {...}}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        for (attr, value) in &self.attributes {
            map.insert(attr.clone(), value.clone());
        }
        let mut rel = Map::new();
        for (link, value) in &self.links {
            rel.insert(link.clone(), value.to_value());
        }
        map.insert(REL_MARKER.to_string(), Value::Object(rel));
        Value::Object(map)
    }

    /// Rebuilds a record from its canonical in-cache JSON form.
    pub fn from_value(id: &str, value: &Value) -> Record {
        let mut record = Record::new(id);
        let Some(map) = value.as_object() else {
            return record;
        };
        for (key, val) in map {
            if key == "id" || key == REL_MARKER {
                continue;
            }
            record.attributes.insert(key.clone(), val.clone());
        }
        if let Some(rel) = map.get(REL_MARKER).and_then(Value::as_object) {
            for (link, val) in rel {
                record.links.insert(link.clone(), LinkValue::from_value(val));
            }
        }
        record
    }
}
