//! Errors raised while classifying or admitting remote operations.
use crate::errors::CacheError;
use graph_sync_shared::SchemaError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("operation path is malformed: {0}")]
    MalformedPath(String),
}
