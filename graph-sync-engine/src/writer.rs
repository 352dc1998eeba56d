//! Persisting operations to the remote store.
//!
//! Maps each graph operation onto the flat persisted layout: records are
//! serialized without the relationship marker, hasMany members are `true`
//! leaves, and writing an empty container is the same as removing it. Every
//! persisted operation is also appended to the remote operation log.
use crate::errors::{CacheError, SourceError};
use crate::remote::{persisted_path, RemoteStore};
use crate::serializer::RecordSerializer;
use graph_sync_shared::{OpKind, Operation, Path, PathShape, Record, Schema};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::trace;

/// Root key of the append-only operation log.
const OPERATION_LOG: &str = "operation";

pub struct GraphWriter {
    remote: Arc<dyn RemoteStore>,
    serializer: RecordSerializer,
}

impl GraphWriter {
    pub fn new(schema: Arc<Schema>, remote: Arc<dyn RemoteStore>) -> Self {
        GraphWriter {
            remote,
            serializer: RecordSerializer::new(schema),
        }
    }

    /// Writes one operation to its position in the persisted layout.
    pub async fn apply(&self, operation: &Operation) -> Result<(), SourceError> {
        let target = persisted_path(&operation.path);
        trace!(path = %target, op = ?operation.op, "persisting operation");
        match (operation.path.shape(), operation.op) {
            (PathShape::Record, OpKind::Add | OpKind::Replace) => {
                let raw = self.required_value(operation)?;
                let record = Record::from_value(operation.path.id(), raw);
                let serialized = self
                    .serializer
                    .serialize(operation.path.model(), &record)?;
                self.remote.set(&target, serialized).await?;
            }
            (PathShape::Attribute, OpKind::Add | OpKind::Replace) => {
                let raw = self.required_value(operation)?;
                self.remote.set(&target, raw.clone()).await?;
            }
            (PathShape::Link, OpKind::Add | OpKind::Replace) => {
                match &operation.value {
                    // An empty or null container has no persisted form; the
                    // store prunes empty nodes, so we remove outright.
                    None | Some(Value::Null) => self.remote.remove(&target).await?,
                    Some(Value::Object(members)) if members.is_empty() => {
                        self.remote.remove(&target).await?
                    }
                    Some(value) => self.remote.set(&target, value.clone()).await?,
                }
            }
            (PathShape::LinkMember, OpKind::Add | OpKind::Replace) => {
                self.remote.set(&target, Value::Bool(true)).await?;
            }
            (PathShape::Malformed, _) => {
                return Err(CacheError::MalformedPath(operation.path.canonical()).into());
            }
            (_, OpKind::Remove) => self.remote.remove(&target).await?,
        }
        Ok(())
    }

    /// Appends the operation to the remote log; returns the generated key.
    pub async fn log(&self, operation: &Operation) -> Result<String, SourceError> {
        let serialized = self.serialize_operation(operation)?;
        let key = self
            .remote
            .push(&Path::from_segments(vec![OPERATION_LOG.to_string()]), serialized)
            .await?;
        Ok(key)
    }

    /// The logged form of an operation: record values go through the record
    /// serializer so the log never carries the relationship marker or the
    /// uninitialized sentinel.
    fn serialize_operation(&self, operation: &Operation) -> Result<Value, SourceError> {
        let value = match (operation.path.shape(), operation.op, &operation.value) {
            (PathShape::Record, OpKind::Add | OpKind::Replace, Some(raw)) => {
                let record = Record::from_value(operation.path.id(), raw);
                Some(self.serializer.serialize(operation.path.model(), &record)?)
            }
            _ => operation.value.clone(),
        };

        let op_token = match operation.op {
            OpKind::Add => "add",
            OpKind::Replace => "replace",
            OpKind::Remove => "remove",
        };
        let mut map = Map::new();
        map.insert("op".to_string(), Value::String(op_token.to_string()));
        map.insert(
            "path".to_string(),
            Value::Array(
                operation
                    .path
                    .segments()
                    .iter()
                    .map(|segment| Value::String(segment.clone()))
                    .collect(),
            ),
        );
        if let Some(value) = value {
            map.insert("value".to_string(), value);
        }
        Ok(Value::Object(map))
    }

    fn required_value<'a>(&self, operation: &'a Operation) -> Result<&'a Value, SourceError> {
        operation
            .value
            .as_ref()
            .ok_or_else(|| CacheError::MissingValue(operation.path.canonical()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;
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

    fn writer() -> (GraphWriter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (GraphWriter::new(schema(), store.clone()), store)
    }

    #[tokio::test]
    async fn record_add_persists_flat_layout() {
        let (writer, store) = writer();
        let op = Operation::add(
            Path::record("planet", "p1"),
            json!({"id": "p1", "name": "Jupiter", "rel": {"moons": {"m1": true}}}),
        );
        writer.apply(&op).await.unwrap();

        let persisted = store
            .value_at(&Path::record("planet", "p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted, json!({"name": "Jupiter", "moons": {"m1": true}}));
    }

    #[tokio::test]
    async fn uninitialized_links_never_reach_the_store() {
        let (writer, store) = writer();
        let op = Operation::add(
            Path::record("planet", "p1"),
            json!({"id": "p1", "name": "Jupiter", "rel": {"moons": "__not_initialized__"}}),
        );
        writer.apply(&op).await.unwrap();

        let persisted = store
            .value_at(&Path::record("planet", "p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted, json!({"name": "Jupiter"}));
    }

    #[tokio::test]
    async fn member_ops_write_boolean_leaves_without_marker() {
        let (writer, store) = writer();
        writer
            .apply(&Operation::add(
                Path::link_member("planet", "p1", "moons", "m1"),
                json!(true),
            ))
            .await
            .unwrap();
        assert_eq!(
            store
                .value_at(&Path::parse("planet/p1/moons/m1"))
                .await
                .unwrap(),
            Some(json!(true))
        );

        writer
            .apply(&Operation::remove(Path::link_member(
                "planet", "p1", "moons", "m1",
            )))
            .await
            .unwrap();
        assert_eq!(
            store
                .value_at(&Path::parse("planet/p1/moons"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn empty_container_write_is_a_removal() {
        let (writer, store) = writer();
        store
            .set(&Path::parse("planet/p1/moons/m1"), json!(true))
            .await
            .unwrap();

        writer
            .apply(&Operation::replace(
                Path::link("planet", "p1", "moons"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(
            store
                .value_at(&Path::parse("planet/p1/moons"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn log_appends_serialized_operations() {
        let (writer, store) = writer();
        let op = Operation::add(
            Path::record("moon", "m1"),
            json!({"id": "m1", "name": "Io", "rel": {"planet": "p1"}}),
        );
        let key = writer.log(&op).await.unwrap();

        let logged = store
            .value_at(&Path::parse("operation").join(&key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logged["op"], json!("add"));
        assert_eq!(logged["path"], json!(["moon", "m1"]));
        assert_eq!(logged["value"], json!({"name": "Io", "planet": "p1"}));
    }
}
