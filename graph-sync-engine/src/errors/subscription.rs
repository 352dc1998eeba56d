//! Errors raised by the subscription lifecycle manager.
use crate::errors::RemoteError;
use graph_sync_shared::SchemaError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("subscription worker for {0} is gone")]
    WorkerGone(String),
    #[error("path {0} is not subscribable")]
    UnsupportedPath(String),
}

impl SubscriptionError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SubscriptionError::Remote(e) if e.is_permission_denied())
    }
}
