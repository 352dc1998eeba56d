//! In-memory graph cache keyed by (type, id).
use crate::cache::{GraphCache, Retrieved};
use crate::errors::CacheError;
use graph_sync_shared::{
    Cardinality, LinkValue, OpKind, Operation, Path, PathShape, Record, Schema,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// The in-process snapshot: a map of (type, id) → record behind a single
/// writer lock. The schema is consulted to normalize link values by
/// cardinality.
pub struct MemoryCache {
    schema: Arc<Schema>,
    records: RwLock<HashMap<(String, String), Record>>,
}

impl MemoryCache {
    pub fn new(schema: Arc<Schema>) -> Self {
        MemoryCache {
            schema,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn record_key(path: &Path) -> (String, String) {
        (path.model().to_string(), path.id().to_string())
    }

    /// Normalizes a raw JSON link payload against the declared cardinality.
    fn link_value_for(
        &self,
        path: &Path,
        raw: Option<&Value>,
    ) -> Result<LinkValue, CacheError> {
        let link_def = self
            .schema
            .link_definition(path.model(), path.link_name())
            .map_err(|_| CacheError::MalformedPath(path.canonical()))?;

        let Some(raw) = raw else {
            // Removal resets to empty, never to uninitialized.
            return Ok(match link_def.cardinality {
                Cardinality::HasOne => LinkValue::One(None),
                Cardinality::HasMany => LinkValue::Many(BTreeSet::new()),
            });
        };

        if LinkValue::value_is_sentinel(raw) {
            return Ok(LinkValue::Uninitialized);
        }

        match (link_def.cardinality, raw) {
            (Cardinality::HasOne, Value::Null) => Ok(LinkValue::One(None)),
            (Cardinality::HasOne, Value::String(id)) => Ok(LinkValue::One(Some(id.clone()))),
            (Cardinality::HasOne, _) => Err(CacheError::CardinalityMismatch(path.canonical())),
            (Cardinality::HasMany, Value::Null) => Ok(LinkValue::Many(BTreeSet::new())),
            (Cardinality::HasMany, Value::Object(map)) => {
                Ok(LinkValue::Many(map.keys().cloned().collect()))
            }
            (Cardinality::HasMany, _) => Err(CacheError::CardinalityMismatch(path.canonical())),
        }
    }

    fn inverse_for_link(path: &Path, previous: Option<&LinkValue>) -> Operation {
        match previous {
            Some(value) => Operation::replace(path.clone(), value.to_value()),
            None => Operation::remove(path.clone()),
        }
    }
}

impl GraphCache for MemoryCache {
    fn retrieve(&self, path: &Path) -> Retrieved {
        let records = self.records.read().expect("cache lock poisoned");
        let Some(record) = records.get(&Self::record_key(path)) else {
            return Retrieved::Absent;
        };

        match path.shape() {
            PathShape::Record => Retrieved::Value(record.to_value()),
            PathShape::Attribute => match record.attributes.get(path.attribute_name()) {
                Some(value) => Retrieved::Value(value.clone()),
                None => Retrieved::Absent,
            },
            PathShape::Link => match record.links.get(path.link_name()) {
                Some(LinkValue::Uninitialized) | None => Retrieved::Uninitialized,
                Some(value) => Retrieved::Value(value.to_value()),
            },
            PathShape::LinkMember => match record.links.get(path.link_name()) {
                Some(LinkValue::Uninitialized) | None => Retrieved::Uninitialized,
                Some(LinkValue::Many(ids)) if ids.contains(path.member_id()) => {
                    Retrieved::Value(Value::Bool(true))
                }
                Some(_) => Retrieved::Absent,
            },
            PathShape::Malformed => Retrieved::Absent,
        }
    }

    fn transform(&self, operation: &Operation) -> Result<Operation, CacheError> {
        let path = &operation.path;
        let key = Self::record_key(path);
        let mut records = self.records.write().expect("cache lock poisoned");

        match (path.shape(), operation.op) {
            (PathShape::Record, OpKind::Add | OpKind::Replace) => {
                let value = operation
                    .value
                    .as_ref()
                    .ok_or_else(|| CacheError::MissingValue(path.canonical()))?;
                let previous = records.insert(key, Record::from_value(path.id(), value));
                Ok(match previous {
                    Some(old) => Operation::replace(path.clone(), old.to_value()),
                    None => Operation::remove(path.clone()),
                })
            }
            (PathShape::Record, OpKind::Remove) => Ok(match records.remove(&key) {
                Some(old) => Operation::add(path.clone(), old.to_value()),
                // Removing an absent record is a no-op; so is its inverse.
                None => Operation::remove(path.clone()),
            }),
            (PathShape::Attribute, OpKind::Add | OpKind::Replace) => {
                let value = operation
                    .value
                    .clone()
                    .ok_or_else(|| CacheError::MissingValue(path.canonical()))?;
                let record = records
                    .get_mut(&key)
                    .ok_or_else(|| CacheError::MissingRecord(path.record_path().canonical()))?;
                let previous = record
                    .attributes
                    .insert(path.attribute_name().to_string(), value);
                Ok(match previous {
                    Some(old) => Operation::replace(path.clone(), old),
                    None => Operation::remove(path.clone()),
                })
            }
            (PathShape::Attribute, OpKind::Remove) => {
                let record = records
                    .get_mut(&key)
                    .ok_or_else(|| CacheError::MissingRecord(path.record_path().canonical()))?;
                Ok(match record.attributes.remove(path.attribute_name()) {
                    Some(old) => Operation::add(path.clone(), old),
                    None => Operation::remove(path.clone()),
                })
            }
            (PathShape::Link, OpKind::Add | OpKind::Replace) => {
                let link_value = self.link_value_for(path, operation.value.as_ref())?;
                let record = records
                    .get_mut(&key)
                    .ok_or_else(|| CacheError::MissingRecord(path.record_path().canonical()))?;
                let previous = record
                    .links
                    .insert(path.link_name().to_string(), link_value);
                Ok(Self::inverse_for_link(path, previous.as_ref()))
            }
            (PathShape::Link, OpKind::Remove) => {
                let link_value = self.link_value_for(path, None)?;
                let record = records
                    .get_mut(&key)
                    .ok_or_else(|| CacheError::MissingRecord(path.record_path().canonical()))?;
                let previous = record
                    .links
                    .insert(path.link_name().to_string(), link_value);
                Ok(Self::inverse_for_link(path, previous.as_ref()))
            }
            (PathShape::LinkMember, OpKind::Add | OpKind::Replace) => {
                let record = records
                    .get_mut(&key)
                    .ok_or_else(|| CacheError::MissingRecord(path.record_path().canonical()))?;
                let link = record
                    .links
                    .entry(path.link_name().to_string())
                    .or_insert_with(|| LinkValue::Many(BTreeSet::new()));
                match link {
                    LinkValue::Many(ids) => {
                        ids.insert(path.member_id().to_string());
                        Ok(Operation::remove(path.clone()))
                    }
                    LinkValue::Uninitialized => {
                        // A closure produced by an explicit initialize may
                        // touch a member before its container op lands.
                        *link = LinkValue::Many([path.member_id().to_string()].into());
                        Ok(Operation::remove(path.clone()))
                    }
                    LinkValue::One(_) => Err(CacheError::CardinalityMismatch(path.canonical())),
                }
            }
            (PathShape::LinkMember, OpKind::Remove) => {
                let record = records
                    .get_mut(&key)
                    .ok_or_else(|| CacheError::MissingRecord(path.record_path().canonical()))?;
                match record.links.get_mut(path.link_name()) {
                    Some(LinkValue::Many(ids)) => {
                        if ids.remove(path.member_id()) {
                            Ok(Operation::add(path.clone(), Value::Bool(true)))
                        } else {
                            Ok(Operation::remove(path.clone()))
                        }
                    }
                    Some(LinkValue::One(_)) => {
                        Err(CacheError::CardinalityMismatch(path.canonical()))
                    }
                    _ => Ok(Operation::remove(path.clone())),
                }
            }
            (PathShape::Malformed, _) => Err(CacheError::MalformedPath(path.canonical())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_sync_shared::ModelDefinition;
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new()
                .with_model(
                    "planet",
                    ModelDefinition::new()
                        .attribute("name")
                        .has_many("moons", "moon", "planet"),
                )
                .with_model(
                    "moon",
                    ModelDefinition::new()
                        .attribute("name")
                        .has_one("planet", "planet", "moons"),
                ),
        )
    }

    fn cache_with_planet() -> MemoryCache {
        let cache = MemoryCache::new(schema());
        cache
            .transform(&Operation::add(
                Path::record("planet", "p1"),
                json!({"id": "p1", "name": "Jupiter", "rel": {"moons": {}}}),
            ))
            .unwrap();
        cache
    }

    #[test]
    fn retrieve_classifies_absent_and_uninitialized() {
        let cache = MemoryCache::new(schema());
        assert_eq!(cache.retrieve(&Path::record("planet", "p1")), Retrieved::Absent);

        cache
            .transform(&Operation::add(
                Path::record("planet", "p1"),
                json!({"id": "p1", "name": "Jupiter"}),
            ))
            .unwrap();

        // No rel payload at all: the link was never fetched.
        assert_eq!(
            cache.retrieve(&Path::link("planet", "p1", "moons")),
            Retrieved::Uninitialized
        );
        assert_eq!(
            cache.retrieve(&Path::link_member("planet", "p1", "moons", "m1")),
            Retrieved::Uninitialized
        );
    }

    #[test]
    fn initialized_empty_container_is_present() {
        let cache = cache_with_planet();
        assert_eq!(
            cache.retrieve(&Path::link("planet", "p1", "moons")),
            Retrieved::Value(json!({}))
        );
        assert_eq!(
            cache.retrieve(&Path::link_member("planet", "p1", "moons", "m1")),
            Retrieved::Absent
        );
    }

    #[test]
    fn member_add_and_remove_with_inverses() {
        let cache = cache_with_planet();
        let member = Path::link_member("planet", "p1", "moons", "m1");

        let inverse = cache
            .transform(&Operation::add(member.clone(), json!(true)))
            .unwrap();
        assert_eq!(inverse, Operation::remove(member.clone()));
        assert_eq!(cache.retrieve(&member), Retrieved::Value(json!(true)));

        let inverse = cache.transform(&Operation::remove(member.clone())).unwrap();
        assert_eq!(inverse, Operation::add(member.clone(), json!(true)));
        assert_eq!(cache.retrieve(&member), Retrieved::Absent);
    }

    #[test]
    fn has_one_rejects_set_values() {
        let cache = MemoryCache::new(schema());
        cache
            .transform(&Operation::add(
                Path::record("moon", "m1"),
                json!({"id": "m1"}),
            ))
            .unwrap();
        let result = cache.transform(&Operation::replace(
            Path::link("moon", "m1", "planet"),
            json!({"p1": true}),
        ));
        assert!(matches!(result, Err(CacheError::CardinalityMismatch(_))));
    }

    #[test]
    fn attribute_ops_require_record() {
        let cache = MemoryCache::new(schema());
        let result = cache.transform(&Operation::replace(
            Path::attribute("planet", "p1", "name"),
            json!("Saturn"),
        ));
        assert!(matches!(result, Err(CacheError::MissingRecord(_))));
    }

    #[test]
    fn record_replace_returns_previous_as_inverse() {
        let cache = cache_with_planet();
        let inverse = cache
            .transform(&Operation::replace(
                Path::record("planet", "p1"),
                json!({"id": "p1", "name": "Saturn"}),
            ))
            .unwrap();
        assert_eq!(inverse.op, OpKind::Replace);
        assert_eq!(inverse.value.unwrap()["name"], json!("Jupiter"));
    }
}
