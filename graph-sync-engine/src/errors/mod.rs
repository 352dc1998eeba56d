//! Error types for the graph-sync engine, one enum per component.
mod cache;
mod expander;
mod remote;
mod sequencer;
mod source;
mod subscription;

pub use cache::CacheError;
pub use expander::ExpanderError;
pub use remote::RemoteError;
pub use sequencer::SequencerError;
pub use source::SourceError;
pub use subscription::SubscriptionError;
