//! Translation between cached records and the persisted remote layout.
//!
//! Remotely a record lives flat at `/{type}/{id}`: attributes as sibling
//! keys, a hasOne as a scalar id, a hasMany as a `{id: true}` member map —
//! no relationship marker segment and no uninitialized sentinel. A record
//! snapshot always speaks for all of its relationships, so deserializing one
//! initializes every declared link: an absent hasOne becomes null, an absent
//! hasMany the empty set.
use graph_sync_shared::{Cardinality, LinkValue, Record, Schema, SchemaError};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Stateless record codec parameterized by the schema index.
pub struct RecordSerializer {
    schema: Arc<Schema>,
}

impl RecordSerializer {
    pub fn new(schema: Arc<Schema>) -> Self {
        RecordSerializer { schema }
    }

    /// Produces the flat persisted form of a record. Uninitialized links are
    /// omitted entirely rather than written as the sentinel.
    pub fn serialize(&self, model: &str, record: &Record) -> Result<Value, SchemaError> {
        let definition = self.schema.model(model)?;
        let mut map = Map::new();
        for attr in &definition.attributes {
            if let Some(value) = record.attributes.get(attr) {
                if !value.is_null() {
                    map.insert(attr.clone(), value.clone());
                }
            }
        }
        for (link, link_def) in &definition.links {
            match record.links.get(link) {
                None | Some(LinkValue::Uninitialized) => {}
                Some(LinkValue::One(None)) => {}
                Some(value @ LinkValue::One(Some(_))) => {
                    map.insert(link.clone(), value.to_value());
                }
                Some(LinkValue::Many(ids)) => {
                    debug_assert_eq!(link_def.cardinality, Cardinality::HasMany);
                    if !ids.is_empty() {
                        map.insert(link.clone(), LinkValue::Many(ids.clone()).to_value());
                    }
                }
            }
        }
        Ok(Value::Object(map))
    }

    /// Rebuilds a record from its persisted form. Declared attributes missing
    /// from the snapshot come back null; every declared link is initialized.
    pub fn deserialize(&self, model: &str, id: &str, value: &Value) -> Result<Record, SchemaError> {
        let definition = self.schema.model(model)?;
        let map = value.as_object();
        let mut record = Record::new(id);

        for attr in &definition.attributes {
            let attr_value = map
                .and_then(|m| m.get(attr))
                .cloned()
                .unwrap_or(Value::Null);
            record.attributes.insert(attr.clone(), attr_value);
        }

        for (link, link_def) in &definition.links {
            let raw = map.and_then(|m| m.get(link));
            let link_value = match (link_def.cardinality, raw) {
                (Cardinality::HasOne, Some(Value::String(related))) => {
                    LinkValue::One(Some(related.clone()))
                }
                (Cardinality::HasOne, _) => LinkValue::One(None),
                (Cardinality::HasMany, Some(Value::Object(members))) => {
                    LinkValue::Many(members.keys().cloned().collect())
                }
                (Cardinality::HasMany, _) => LinkValue::Many(BTreeSet::new()),
            };
            record.links.insert(link.clone(), link_value);
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_sync_shared::ModelDefinition;
    use serde_json::json;

    fn serializer() -> RecordSerializer {
        RecordSerializer::new(Arc::new(
            Schema::new()
                .with_model(
                    "planet",
                    ModelDefinition::new()
                        .attribute("name")
                        .attribute("classification")
                        .has_many("moons", "moon", "planet"),
                )
                .with_model(
                    "moon",
                    ModelDefinition::new()
                        .attribute("name")
                        .has_one("planet", "planet", "moons"),
                ),
        ))
    }

    #[test]
    fn serializes_flat_without_marker_or_sentinel() {
        let serializer = serializer();
        let mut record = Record::new("p1");
        record.attributes.insert("name".into(), json!("Jupiter"));
        record
            .links
            .insert("moons".into(), LinkValue::Many(["m1".to_string()].into()));

        let value = serializer.serialize("planet", &record).unwrap();
        assert_eq!(value, json!({"name": "Jupiter", "moons": {"m1": true}}));
    }

    #[test]
    fn uninitialized_links_are_omitted() {
        let serializer = serializer();
        let mut record = Record::new("p1");
        record.attributes.insert("name".into(), json!("Jupiter"));
        record.links.insert("moons".into(), LinkValue::Uninitialized);

        let value = serializer.serialize("planet", &record).unwrap();
        assert_eq!(value, json!({"name": "Jupiter"}));
    }

    #[test]
    fn deserializing_initializes_all_declared_links() {
        let serializer = serializer();
        let record = serializer
            .deserialize("planet", "p1", &json!({"name": "Jupiter"}))
            .unwrap();

        assert_eq!(record.attributes["name"], json!("Jupiter"));
        // Missing from the snapshot, still declared.
        assert_eq!(record.attributes["classification"], Value::Null);
        assert_eq!(record.links["moons"], LinkValue::Many(BTreeSet::new()));
        assert!(!record.links["moons"].is_uninitialized());
    }

    #[test]
    fn deserializes_has_one_scalar() {
        let serializer = serializer();
        let record = serializer
            .deserialize("moon", "m1", &json!({"name": "Io", "planet": "p1"}))
            .unwrap();
        assert_eq!(record.links["planet"], LinkValue::One(Some("p1".into())));
    }
}
