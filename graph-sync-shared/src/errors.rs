//! Schema lookup errors.
//!
//! Undeclared models, links, and broken inverse pairs are configuration
//! defects: they are raised synchronously at the point of lookup and are
//! never deferred or absorbed.
use thiserror::Error;

/// Represents a defect in the declared schema or a lookup against a name
/// that was never declared.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("unknown link: {model}/{link}")]
    UnknownLink { model: String, link: String },
    #[error("link {model}/{link} declares inverse {inverse} which does not point back")]
    BrokenInverse {
        model: String,
        link: String,
        inverse: String,
    },
}
