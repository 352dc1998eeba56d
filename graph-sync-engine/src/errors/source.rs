//! Errors surfaced by the source coordinator to its caller.
use crate::errors::{CacheError, ExpanderError, RemoteError, SequencerError, SubscriptionError};
use graph_sync_shared::SchemaError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Expander(#[from] ExpanderError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("expansion of {0} does not contain its own trigger")]
    MissingTrigger(String),
}
