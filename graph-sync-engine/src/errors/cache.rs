//! Errors raised while applying an operation to the local graph cache.
use thiserror::Error;

/// Represents a malformed mutation against the cache. The cache applies one
/// operation atomically; a failed operation leaves it untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("operation path is malformed: {0}")]
    MalformedPath(String),
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("record not present: {0}")]
    MissingRecord(String),
    #[error("hasOne value can never be a set: {0}")]
    CardinalityMismatch(String),
}
