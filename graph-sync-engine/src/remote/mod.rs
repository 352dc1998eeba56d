//! The remote store seam.
//!
//! The engine consumes a realtime tree store through this trait: point
//! reads, point writes, and per-path event watches. The wire protocol and
//! authentication behind it are out of scope; the in-memory implementation
//! in [`memory`] stands in for the real collaborator in tests.
use crate::errors::RemoteError;
use async_trait::async_trait;
use graph_sync_shared::Path;
use serde_json::Value;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::MemoryStore;

/// Where a graph path lives in the persisted layout. Remotely a record is
/// flat: attributes and links are direct children of `/{type}/{id}`, with no
/// relationship marker segment.
pub fn persisted_path(path: &Path) -> Path {
    use graph_sync_shared::PathShape;
    match path.shape() {
        PathShape::Link => Path::from_segments(vec![
            path.model().to_string(),
            path.id().to_string(),
            path.link_name().to_string(),
        ]),
        PathShape::LinkMember => Path::from_segments(vec![
            path.model().to_string(),
            path.id().to_string(),
            path.link_name().to_string(),
            path.member_id().to_string(),
        ]),
        _ => path.clone(),
    }
}

/// The three event kinds a path can be watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ValueChanged,
    ChildAdded,
    ChildRemoved,
}

impl EventKind {
    /// Stable token used in listener registry keys.
    pub fn token(&self) -> &'static str {
        match self {
            EventKind::ValueChanged => "value",
            EventKind::ChildAdded => "child_added",
            EventKind::ChildRemoved => "child_removed",
        }
    }
}

/// One delivered watch event: the affected key (last path segment for value
/// events, child key for child events) and the value now at it (`None`
/// on removal).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub key: String,
    pub value: Option<Value>,
}

/// Identifies one live watch registration for teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

pub type EventSender = mpsc::UnboundedSender<RemoteEvent>;

/// Asynchronous point access to the shared realtime store.
///
/// `subscribe` for `ValueChanged` delivers the current value as its first
/// event before returning; child watches register and return immediately,
/// then stream an unbounded sequence of events. A permission failure is
/// reported as [`RemoteError::PermissionDenied`], at most once per watch.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn value_at(&self, path: &Path) -> Result<Option<Value>, RemoteError>;

    /// Writes `value` at `path`. A JSON `null` payload is normalized to a
    /// removal.
    async fn set(&self, path: &Path, value: Value) -> Result<(), RemoteError>;

    async fn remove(&self, path: &Path) -> Result<(), RemoteError>;

    /// Appends `value` under a store-generated key at `path`; returns the
    /// key.
    async fn push(&self, path: &Path, value: Value) -> Result<String, RemoteError>;

    async fn subscribe(
        &self,
        path: &Path,
        kind: EventKind,
        sender: EventSender,
    ) -> Result<WatchHandle, RemoteError>;

    async fn unsubscribe(
        &self,
        path: &Path,
        kind: EventKind,
        handle: WatchHandle,
    ) -> Result<(), RemoteError>;
}
