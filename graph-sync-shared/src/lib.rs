//! # Graph Sync Shared
//! This crate defines the data structures shared across the graph-sync
//! workspace: graph paths, operations, records, link values, and the schema
//! index consulted by every component that needs relationship metadata.
pub mod errors;
pub mod types;

pub use errors::SchemaError;
pub use types::{
    Cardinality, LinkDefinition, LinkValue, ModelDefinition, OpKind, Operation, Path, PathShape,
    Record, Schema, REL_MARKER, UNINITIALIZED_SENTINEL,
};
