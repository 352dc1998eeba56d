//! End-to-end flows through a fully wired engine over the in-memory store.
use graph_sync_engine::{
    GraphSource, IncludeOptions, MemoryStore, RemoteStore, Retrieved, SubscriptionStatus,
};
use graph_sync_shared::{ModelDefinition, Operation, Path, Schema};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

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

/// Settles the engine: waits for subscription work, then lets the paused
/// clock advance, which only happens once every task is idle.
async fn quiesce(source: &GraphSource) {
    source.drain().await;
    sleep(Duration::from_millis(50)).await;
    source.drain().await;
}

fn collect(rx: &mut mpsc::UnboundedReceiver<Operation>) -> Vec<Operation> {
    let mut ops = Vec::new();
    while let Ok(op) = rx.try_recv() {
        ops.push(op);
    }
    ops
}

#[tokio::test(start_paused = true)]
async fn local_write_echoes_are_suppressed() {
    let store = Arc::new(MemoryStore::new());
    let source = GraphSource::new(schema(), store.clone());
    let mut transforms = source.transforms();

    source
        .transform(&Operation::add(
            Path::record("planet", "p1"),
            json!({"id": "p1", "name": "Jupiter", "rel": {"moons": {}}}),
        ))
        .await
        .unwrap();
    source
        .transform(&Operation::add(
            Path::record("moon", "m1"),
            json!({"id": "m1", "name": "Io", "rel": {"planet": null}}),
        ))
        .await
        .unwrap();
    quiesce(&source).await;
    collect(&mut transforms);

    source
        .transform(&Operation::replace(
            Path::link("moon", "m1", "planet"),
            json!("p1"),
        ))
        .await
        .unwrap();
    quiesce(&source).await;

    // The trigger and its inverse both echoed back and were both suppressed;
    // nothing about this relationship re-enters the cache.
    let ops = collect(&mut transforms);
    assert!(ops
        .iter()
        .all(|op| op.path != Path::link("moon", "m1", "planet")));
    assert!(ops
        .iter()
        .all(|op| op.path != Path::link_member("planet", "p1", "moons", "m1")));

    // Both sides were applied locally on the write path.
    let cache = source.cache();
    assert_eq!(
        cache.retrieve(&Path::link("moon", "m1", "planet")),
        Retrieved::Value(json!("p1"))
    );
    assert_eq!(
        cache.retrieve(&Path::link_member("planet", "p1", "moons", "m1")),
        Retrieved::Value(json!(true))
    );

    // A write by another actor still flows through.
    store
        .set(&Path::parse("moon/m1/name"), json!("Io II"))
        .await
        .unwrap();
    quiesce(&source).await;
    let ops = collect(&mut transforms);
    assert!(ops.iter().any(|op| {
        op.path == Path::attribute("moon", "m1", "name") && op.value == Some(json!("Io II"))
    }));
    assert_eq!(
        cache.retrieve(&Path::attribute("moon", "m1", "name")),
        Retrieved::Value(json!("Io II"))
    );
}

#[tokio::test(start_paused = true)]
async fn denied_member_is_excluded_while_owner_syncs() {
    let store = Arc::new(MemoryStore::new());
    store
        .set(
            &Path::record("planet", "p1"),
            json!({"name": "Jupiter", "moons": {"m1": true, "secret": true}}),
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
    store
        .set(
            &Path::record("moon", "secret"),
            json!({"name": "Classified", "planet": "p1"}),
        )
        .await
        .unwrap();
    store.deny(&Path::record("moon", "secret"));

    let source = GraphSource::new(schema(), store);
    let status = source
        .subscribe(
            &Path::record("planet", "p1"),
            IncludeOptions::from_includes(&["moons"]),
        )
        .await
        .unwrap();
    assert_eq!(status, SubscriptionStatus::Active);
    quiesce(&source).await;

    // The readable member is synced, the denied one silently left out.
    assert_eq!(
        source.cache().retrieve(&Path::link("planet", "p1", "moons")),
        Retrieved::Value(json!({"m1": true}))
    );
    assert_eq!(
        source.find_subscription(&Path::record("moon", "m1")),
        Some(SubscriptionStatus::Active)
    );
    assert_eq!(
        source.find_subscription(&Path::record("moon", "secret")),
        Some(SubscriptionStatus::PermissionDenied)
    );
}

#[tokio::test]
async fn drain_settles_transitive_activations() {
    let store = Arc::new(MemoryStore::new());
    let mut moons = serde_json::Map::new();
    for id in ["m1", "m2", "m3"] {
        moons.insert(id.to_string(), json!(true));
        store
            .set(
                &Path::record("moon", id),
                json!({"name": id, "planet": "p1"}),
            )
            .await
            .unwrap();
    }
    store
        .set(
            &Path::record("planet", "p1"),
            json!({"name": "Jupiter", "moons": moons}),
        )
        .await
        .unwrap();

    let source = GraphSource::new(schema(), store);
    source
        .subscribe(
            &Path::record("planet", "p1"),
            IncludeOptions::from_includes(&["moons"]),
        )
        .await
        .unwrap();
    source.drain().await;

    // Everything the subscription fanned out to has settled, including the
    // member records the container pulled in.
    for id in ["m1", "m2", "m3"] {
        assert_eq!(
            source.find_subscription(&Path::record("moon", id)),
            Some(SubscriptionStatus::Active),
            "moon {id} should be active after drain"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn remote_member_addition_flows_into_the_cache() {
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

    let source = GraphSource::new(schema(), store.clone());
    source
        .subscribe(
            &Path::record("planet", "p1"),
            IncludeOptions::from_includes(&["moons"]),
        )
        .await
        .unwrap();
    quiesce(&source).await;

    // Another actor attaches a new moon.
    store
        .set(
            &Path::record("moon", "m2"),
            json!({"name": "Europa", "planet": "p1"}),
        )
        .await
        .unwrap();
    store
        .set(&Path::parse("planet/p1/moons/m2"), json!(true))
        .await
        .unwrap();
    quiesce(&source).await;

    let cache = source.cache();
    assert_eq!(
        cache.retrieve(&Path::link_member("planet", "p1", "moons", "m2")),
        Retrieved::Value(json!(true))
    );
    assert!(cache.retrieve(&Path::record("moon", "m2")).is_present());
    assert_eq!(
        source.find_subscription(&Path::record("moon", "m2")),
        Some(SubscriptionStatus::Active)
    );
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_all_stops_the_stream() {
    let store = Arc::new(MemoryStore::new());
    store
        .set(
            &Path::record("moon", "m1"),
            json!({"name": "Io"}),
        )
        .await
        .unwrap();

    let source = GraphSource::new(schema(), store.clone());
    let mut transforms = source.transforms();
    source
        .subscribe(&Path::record("moon", "m1"), IncludeOptions::none())
        .await
        .unwrap();
    quiesce(&source).await;
    collect(&mut transforms);
    assert!(!source.subscriptions().is_empty());

    source.unsubscribe_all().await.unwrap();
    assert!(source.subscriptions().is_empty());
    assert_eq!(source.find_subscription(&Path::record("moon", "m1")), None);

    store
        .set(&Path::parse("moon/m1/name"), json!("Renamed"))
        .await
        .unwrap();
    quiesce(&source).await;
    assert!(collect(&mut transforms).is_empty());
}
