pub mod operation;
pub mod path;
pub mod record;
pub mod schema;

pub use operation::{OpKind, Operation};
pub use path::{Path, PathShape, REL_MARKER};
pub use record::{LinkValue, Record, UNINITIALIZED_SENTINEL};
pub use schema::{Cardinality, LinkDefinition, ModelDefinition, Schema};
