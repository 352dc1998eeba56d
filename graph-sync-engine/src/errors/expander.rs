//! Errors raised while expanding a mutation into its bidirectional closure.
use graph_sync_shared::SchemaError;
use thiserror::Error;

/// Expansion failures. All of these are synchronous and fatal to the
/// triggering write; none are deferred.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpanderError {
    #[error("relationship references an empty id at {0}")]
    MalformedId(String),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}
