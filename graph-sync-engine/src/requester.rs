//! Point queries against the remote store.
//!
//! Queries read the persisted layout directly and deserialize through the
//! record serializer. Whatever a query returns it also subscribes to first,
//! so the cache keeps receiving updates for every record handed out.
use crate::errors::SourceError;
use crate::remote::{persisted_path, RemoteStore};
use crate::serializer::RecordSerializer;
use crate::subscriptions::{IncludeOptions, SubscriptionManager};
use graph_sync_shared::{Cardinality, LinkValue, Path, Record, Schema};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::instrument;

pub struct GraphRequester {
    schema: Arc<Schema>,
    remote: Arc<dyn RemoteStore>,
    serializer: RecordSerializer,
    subscriptions: Arc<SubscriptionManager>,
}

impl GraphRequester {
    pub fn new(
        schema: Arc<Schema>,
        remote: Arc<dyn RemoteStore>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        GraphRequester {
            serializer: RecordSerializer::new(schema.clone()),
            schema,
            remote,
            subscriptions,
        }
    }

    /// Fetches one record and subscribes to it before resolving.
    #[instrument(skip(self, options))]
    pub async fn find(
        &self,
        model: &str,
        id: &str,
        options: IncludeOptions,
    ) -> Result<Record, SourceError> {
        let path = Path::record(model, id);
        let value = self
            .remote
            .value_at(&path)
            .await?
            .ok_or_else(|| SourceError::RecordNotFound(path.canonical()))?;
        let record = self.serializer.deserialize(model, id, &value)?;
        self.subscriptions.subscribe(&path, options).await?;
        Ok(record)
    }

    /// Fetches every record of one model. Subscribes to each returned record
    /// and to the model node itself, so records added later by other actors
    /// flow in too.
    pub async fn find_all(&self, model: &str) -> Result<Vec<Record>, SourceError> {
        self.schema.model(model)?;
        let snapshot = self
            .remote
            .value_at(&Path::from_segments(vec![model.to_string()]))
            .await?;
        let mut records = Vec::new();
        if let Some(Value::Object(map)) = snapshot {
            for (id, value) in &map {
                records.push(self.serializer.deserialize(model, id, value)?);
                self.subscriptions
                    .subscribe(&Path::record(model, id), IncludeOptions::none())
                    .await?;
            }
        }
        self.subscriptions
            .watch_model(model, IncludeOptions::none())
            .await?;
        Ok(records)
    }

    /// Fetches the current value of one relationship.
    pub async fn find_link(
        &self,
        model: &str,
        id: &str,
        link: &str,
    ) -> Result<LinkValue, SourceError> {
        let link_def = self.schema.link_definition(model, link)?;
        let raw = self
            .remote
            .value_at(&persisted_path(&Path::link(model, id, link)))
            .await?;
        Ok(match (link_def.cardinality, raw) {
            (Cardinality::HasOne, Some(Value::String(related))) => LinkValue::One(Some(related)),
            (Cardinality::HasOne, _) => LinkValue::One(None),
            (Cardinality::HasMany, Some(Value::Object(members))) => {
                LinkValue::Many(members.keys().cloned().collect())
            }
            (Cardinality::HasMany, _) => LinkValue::Many(BTreeSet::new()),
        })
    }

    /// Fetches the records a relationship points at, subscribing to each.
    #[instrument(skip(self))]
    pub async fn find_linked(
        &self,
        model: &str,
        id: &str,
        link: &str,
    ) -> Result<Vec<Record>, SourceError> {
        let related_model = self.schema.link_definition(model, link)?.model.clone();
        let ids: Vec<String> = match self.find_link(model, id, link).await? {
            LinkValue::One(Some(related)) => vec![related],
            LinkValue::One(None) | LinkValue::Uninitialized => Vec::new(),
            LinkValue::Many(members) => members.into_iter().collect(),
        };
        let mut records = Vec::new();
        for related in &ids {
            records.push(
                self.find(&related_model, related, IncludeOptions::none())
                    .await?,
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;
    use crate::subscriptions::SubscriptionStatus;
    use graph_sync_shared::ModelDefinition;
    use serde_json::json;
    use tokio::sync::mpsc;

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

    #[tokio::test]
    async fn find_returns_and_subscribes() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(&Path::record("moon", "m1"), json!({"name": "Io"}))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(schema(), store.clone(), tx));
        let requester = GraphRequester::new(schema(), store, subscriptions.clone());

        let record = requester
            .find("moon", "m1", IncludeOptions::none())
            .await
            .unwrap();
        assert_eq!(record.attributes["name"], json!("Io"));
        assert_eq!(
            subscriptions.find_subscription(&Path::record("moon", "m1")),
            Some(SubscriptionStatus::Active)
        );
    }

    #[tokio::test]
    async fn find_missing_record_fails() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(schema(), store.clone(), tx));
        let requester = GraphRequester::new(schema(), store, subscriptions);

        let result = requester.find("moon", "nope", IncludeOptions::none()).await;
        assert!(matches!(result, Err(SourceError::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn find_link_reads_both_cardinalities() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                &Path::record("planet", "p1"),
                json!({"name": "Jupiter", "moons": {"m1": true, "m2": true}}),
            )
            .await
            .unwrap();
        store
            .set(&Path::record("moon", "m1"), json!({"planet": "p1"}))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(schema(), store.clone(), tx));
        let requester = GraphRequester::new(schema(), store, subscriptions);

        assert_eq!(
            requester.find_link("planet", "p1", "moons").await.unwrap(),
            LinkValue::Many(["m1".to_string(), "m2".to_string()].into())
        );
        assert_eq!(
            requester.find_link("moon", "m1", "planet").await.unwrap(),
            LinkValue::One(Some("p1".to_string()))
        );
        assert_eq!(
            requester.find_link("moon", "m9", "planet").await.unwrap(),
            LinkValue::One(None)
        );
    }

    #[tokio::test]
    async fn find_linked_follows_members() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                &Path::record("planet", "p1"),
                json!({"name": "Jupiter", "moons": {"m1": true}}),
            )
            .await
            .unwrap();
        store
            .set(
                &Path::record("moon", "m1"),
                json!({"name": "Io", "planet": "p1"}),
            )
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(schema(), store.clone(), tx));
        let requester = GraphRequester::new(schema(), store, subscriptions);

        let linked = requester.find_linked("planet", "p1", "moons").await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, "m1");
        assert_eq!(linked[0].links["planet"], LinkValue::One(Some("p1".into())));
    }

    #[tokio::test]
    async fn find_all_lists_every_record() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(&Path::record("moon", "m1"), json!({"name": "Io"}))
            .await
            .unwrap();
        store
            .set(&Path::record("moon", "m2"), json!({"name": "Europa"}))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(schema(), store.clone(), tx));
        let requester = GraphRequester::new(schema(), store, subscriptions.clone());

        let records = requester.find_all("moon").await.unwrap();
        assert_eq!(records.len(), 2);
        for id in ["m1", "m2"] {
            assert_eq!(
                subscriptions.find_subscription(&Path::record("moon", id)),
                Some(SubscriptionStatus::Active)
            );
        }
        assert!(requester.find_all("comet").await.is_err());
    }

    #[tokio::test]
    async fn find_all_tracks_records_added_later() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(&Path::record("moon", "m1"), json!({"name": "Io"}))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(schema(), store.clone(), tx));
        let requester = GraphRequester::new(schema(), store.clone(), subscriptions.clone());

        requester.find_all("moon").await.unwrap();

        // Another actor creates a record under the same model node.
        store
            .set(&Path::record("moon", "m3"), json!({"name": "Ganymede"}))
            .await
            .unwrap();
        let arrival = loop {
            let op = rx.recv().await.expect("operation channel closed");
            if op.path == Path::record("moon", "m3") {
                break op;
            }
        };
        assert_eq!(arrival.value.as_ref().unwrap()["name"], json!("Ganymede"));
        subscriptions.drain().await;
        assert_eq!(
            subscriptions.find_subscription(&Path::record("moon", "m3")),
            Some(SubscriptionStatus::Active)
        );
    }
}
