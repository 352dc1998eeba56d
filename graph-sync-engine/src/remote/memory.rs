//! Deterministic in-memory remote store.
//!
//! Plays the role of the real realtime store in tests and local runs: a
//! JSON tree with point reads/writes and per-path watches. Writes diff the
//! tree before and after, then fan out value and child events to every
//! affected watch, the way the realtime collaborator does. Empty containers
//! and nulls are pruned, so writing `null` (or an empty map) at a path is
//! indistinguishable from removing it.
use crate::errors::RemoteError;
use crate::remote::{EventKind, EventSender, RemoteEvent, RemoteStore, WatchHandle};
use async_trait::async_trait;
use graph_sync_shared::Path;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct Watch {
    handle: WatchHandle,
    sender: EventSender,
}

/// In-memory JSON tree with watch fan-out and configurable permission
/// denial by path prefix.
pub struct MemoryStore {
    root: Mutex<Value>,
    watches: Mutex<HashMap<(String, EventKind), Vec<Watch>>>,
    denied: Mutex<Vec<String>>,
    next_handle: AtomicU64,
    next_push_key: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            root: Mutex::new(Value::Object(Map::new())),
            watches: Mutex::new(HashMap::new()),
            denied: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            next_push_key: AtomicU64::new(1),
        }
    }

    /// Denies all reads and watches at or below `path`.
    pub fn deny(&self, path: &Path) {
        self.denied
            .lock()
            .expect("store lock poisoned")
            .push(path.canonical());
    }

    fn check_allowed(&self, path: &Path) -> Result<(), RemoteError> {
        let key = path.canonical();
        let denied = self.denied.lock().expect("store lock poisoned");
        for prefix in denied.iter() {
            if key == *prefix || key.starts_with(&format!("{prefix}/")) {
                return Err(RemoteError::PermissionDenied(key));
            }
        }
        Ok(())
    }

    fn value_at_tree(root: &Value, path: &Path) -> Option<Value> {
        let mut current = root;
        for segment in path.segments() {
            current = current.as_object()?.get(segment)?;
        }
        Some(current.clone())
    }

    /// Writes `value` into the tree, creating intermediate objects. `None`
    /// removes the leaf. Empty objects and nulls are pruned bottom-up.
    fn write_tree(root: &mut Value, path: &Path, value: Option<Value>) {
        fn write(node: &mut Value, segments: &[String], value: Option<Value>) {
            let Some((head, rest)) = segments.split_first() else {
                return;
            };
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let map = node.as_object_mut().expect("just ensured object");
            if rest.is_empty() {
                match value {
                    Some(v) => {
                        map.insert(head.clone(), v);
                    }
                    None => {
                        map.remove(head);
                    }
                }
            } else {
                let child = map.entry(head.clone()).or_insert(Value::Object(Map::new()));
                write(child, rest, value);
                if prune(child) {
                    map.remove(head);
                }
            }
        }

        /// True when the node collapsed to nothing and should be dropped.
        fn prune(node: &mut Value) -> bool {
            match node {
                Value::Null => true,
                Value::Object(map) => {
                    let empty_keys: Vec<String> = map
                        .iter_mut()
                        .filter_map(|(k, v)| prune(v).then(|| k.clone()))
                        .collect();
                    for key in empty_keys {
                        map.remove(&key);
                    }
                    map.is_empty()
                }
                _ => false,
            }
        }

        let normalized = value.filter(|v| {
            !v.is_null() && !(v.as_object().map(Map::is_empty).unwrap_or(false))
        });
        write(root, path.segments(), normalized);
    }

    /// Diffs old vs new state at every watched path and delivers events.
    fn notify(&self, old_root: &Value, new_root: &Value) {
        let mut watches = self.watches.lock().expect("store lock poisoned");
        for ((raw_path, kind), entries) in watches.iter_mut() {
            let path = Path::parse(raw_path);
            let old = Self::value_at_tree(old_root, &path);
            let new = Self::value_at_tree(new_root, &path);
            if old == new {
                continue;
            }

            let events: Vec<RemoteEvent> = match kind {
                EventKind::ValueChanged => vec![RemoteEvent {
                    key: path
                        .segments()
                        .last()
                        .cloned()
                        .unwrap_or_default(),
                    value: new.clone(),
                }],
                EventKind::ChildAdded => {
                    child_diff(old.as_ref(), new.as_ref(), |old_map, new_map| {
                        new_map
                            .iter()
                            .filter(|(k, _)| !old_map.contains_key(*k))
                            .map(|(k, v)| RemoteEvent {
                                key: k.clone(),
                                value: Some(v.clone()),
                            })
                            .collect()
                    })
                }
                EventKind::ChildRemoved => {
                    child_diff(old.as_ref(), new.as_ref(), |old_map, new_map| {
                        old_map
                            .iter()
                            .filter(|(k, _)| !new_map.contains_key(*k))
                            .map(|(k, v)| RemoteEvent {
                                key: k.clone(),
                                value: Some(v.clone()),
                            })
                            .collect()
                    })
                }
            };

            entries.retain(|watch| {
                events
                    .iter()
                    .all(|event| watch.sender.send(event.clone()).is_ok())
            });
        }
    }
}

fn child_diff(
    old: Option<&Value>,
    new: Option<&Value>,
    diff: impl Fn(&Map<String, Value>, &Map<String, Value>) -> Vec<RemoteEvent>,
) -> Vec<RemoteEvent> {
    let empty = Map::new();
    let old_map = old.and_then(Value::as_object).unwrap_or(&empty);
    let new_map = new.and_then(Value::as_object).unwrap_or(&empty);
    diff(old_map, new_map)
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn value_at(&self, path: &Path) -> Result<Option<Value>, RemoteError> {
        self.check_allowed(path)?;
        let root = self.root.lock().expect("store lock poisoned");
        Ok(Self::value_at_tree(&root, path))
    }

    async fn set(&self, path: &Path, value: Value) -> Result<(), RemoteError> {
        self.check_allowed(path)?;
        let (old_root, new_root) = {
            let mut root = self.root.lock().expect("store lock poisoned");
            let old = root.clone();
            Self::write_tree(&mut root, path, Some(value));
            (old, root.clone())
        };
        self.notify(&old_root, &new_root);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<(), RemoteError> {
        self.check_allowed(path)?;
        let (old_root, new_root) = {
            let mut root = self.root.lock().expect("store lock poisoned");
            let old = root.clone();
            Self::write_tree(&mut root, path, None);
            (old, root.clone())
        };
        self.notify(&old_root, &new_root);
        Ok(())
    }

    async fn push(&self, path: &Path, value: Value) -> Result<String, RemoteError> {
        self.check_allowed(path)?;
        let key = format!("k{}", self.next_push_key.fetch_add(1, Ordering::Relaxed));
        self.set(&path.join(&key), value).await?;
        Ok(key)
    }

    async fn subscribe(
        &self,
        path: &Path,
        kind: EventKind,
        sender: EventSender,
    ) -> Result<WatchHandle, RemoteError> {
        self.check_allowed(path)?;
        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        // Value watches deliver the current snapshot as their first event
        // before the registration call resolves.
        if kind == EventKind::ValueChanged {
            let current = {
                let root = self.root.lock().expect("store lock poisoned");
                Self::value_at_tree(&root, path)
            };
            let _ = sender.send(RemoteEvent {
                key: path.segments().last().cloned().unwrap_or_default(),
                value: current,
            });
        }

        self.watches
            .lock()
            .expect("store lock poisoned")
            .entry((path.canonical(), kind))
            .or_default()
            .push(Watch { handle, sender });
        Ok(handle)
    }

    async fn unsubscribe(
        &self,
        path: &Path,
        kind: EventKind,
        handle: WatchHandle,
    ) -> Result<(), RemoteError> {
        let mut watches = self.watches.lock().expect("store lock poisoned");
        if let Some(entries) = watches.get_mut(&(path.canonical(), kind)) {
            entries.retain(|watch| watch.handle != handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<RemoteEvent>) -> Vec<RemoteEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn value_watch_fires_with_current_snapshot() {
        let store = MemoryStore::new();
        let path = Path::attribute("planet", "p1", "name");
        store.set(&path, json!("Jupiter")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        store
            .subscribe(&path, EventKind::ValueChanged, tx)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, Some(json!("Jupiter")));

        store.set(&path, json!("Saturn")).await.unwrap();
        assert_eq!(drain(&mut rx)[0].value, Some(json!("Saturn")));
    }

    #[tokio::test]
    async fn ancestor_value_watch_sees_descendant_writes() {
        let store = MemoryStore::new();
        let record = Path::record("planet", "p1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        store
            .subscribe(&record, EventKind::ValueChanged, tx)
            .await
            .unwrap();
        drain(&mut rx);

        store
            .set(&Path::attribute("planet", "p1", "name"), json!("Jupiter"))
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, Some(json!({"name": "Jupiter"})));
    }

    #[tokio::test]
    async fn child_watches_report_membership_changes() {
        let store = MemoryStore::new();
        let container = Path::parse("planet/p1/moons");
        store.set(&container.join("m1"), json!(true)).await.unwrap();

        let (added_tx, mut added_rx) = mpsc::unbounded_channel();
        let (removed_tx, mut removed_rx) = mpsc::unbounded_channel();
        store
            .subscribe(&container, EventKind::ChildAdded, added_tx)
            .await
            .unwrap();
        store
            .subscribe(&container, EventKind::ChildRemoved, removed_tx)
            .await
            .unwrap();

        // Registration does not replay existing children.
        assert!(drain(&mut added_rx).is_empty());

        store.set(&container.join("m2"), json!(true)).await.unwrap();
        let added = drain(&mut added_rx);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].key, "m2");

        store.remove(&container.join("m1")).await.unwrap();
        let removed = drain(&mut removed_rx);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, "m1");
    }

    #[tokio::test]
    async fn null_and_empty_writes_prune() {
        let store = MemoryStore::new();
        let path = Path::parse("planet/p1/moons");
        store.set(&path.join("m1"), json!(true)).await.unwrap();

        store.set(&path, json!({})).await.unwrap();
        assert_eq!(store.value_at(&path).await.unwrap(), None);
        assert_eq!(store.value_at(&Path::record("planet", "p1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn denied_prefixes_fail_with_permission_error() {
        let store = MemoryStore::new();
        let secret = Path::record("moon", "classified");
        store.deny(&secret);

        let result = store.value_at(&secret.join("name")).await;
        assert!(matches!(result, Err(RemoteError::PermissionDenied(_))));

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = store.subscribe(&secret, EventKind::ValueChanged, tx).await;
        assert!(matches!(result, Err(RemoteError::PermissionDenied(_))));

        // Sibling paths are unaffected.
        assert!(store.value_at(&Path::record("moon", "m1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_generates_distinct_keys() {
        let store = MemoryStore::new();
        let log = Path::parse("operation");
        let k1 = store.push(&log, json!({"op": "add"})).await.unwrap();
        let k2 = store.push(&log, json!({"op": "remove"})).await.unwrap();
        assert_ne!(k1, k2);
        let value = store.value_at(&log).await.unwrap().unwrap();
        assert_eq!(value.as_object().unwrap().len(), 2);
    }
}
