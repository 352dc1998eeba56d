//! Causal consistency engine for an eventually-consistent realtime store.
//!
//! The engine keeps a local graph cache in sync with a shared remote tree
//! store whose updates arrive incrementally and in no guaranteed order. Local
//! writes are expanded into their bidirectional relationship closure, echo
//! registrations are taken out before anything is sent, and remote-originated
//! operations are deferred until the records and containers they reference
//! exist locally. [`source::GraphSource`] is the entry point; everything else
//! is a component it coordinates.
pub mod cache;
pub mod errors;
pub mod expander;
pub mod filter;
pub mod remote;
pub mod requester;
pub mod sequencer;
pub mod serializer;
pub mod source;
pub mod subscriptions;
pub mod writer;

pub use cache::{GraphCache, MemoryCache, Retrieved};
pub use expander::RelationshipExpander;
pub use filter::OperationFilter;
pub use remote::{EventKind, MemoryStore, RemoteEvent, RemoteStore, WatchHandle};
pub use requester::GraphRequester;
pub use sequencer::OperationSequencer;
pub use serializer::RecordSerializer;
pub use source::GraphSource;
pub use subscriptions::{IncludeOptions, SubscriptionManager, SubscriptionStatus};
pub use writer::GraphWriter;
