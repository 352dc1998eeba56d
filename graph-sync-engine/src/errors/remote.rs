//! Errors surfaced by the remote store collaborator.
use thiserror::Error;

/// Remote store failures. `PermissionDenied` is the only variant the engine
/// recovers from locally (the affected subscription parks in
/// `PermissionDenied`); everything else propagates to the caller of the
/// triggering operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("permission denied at {0}")]
    PermissionDenied(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RemoteError::PermissionDenied(_))
    }
}
