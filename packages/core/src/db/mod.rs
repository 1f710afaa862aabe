//! Store Layer
//!
//! The in-memory normalized record graph and everything that writes to it:
//!
//! - [`RecordStore`]: authoritative records plus the optimistic overlay
//! - [`RecordWriter`]: field-level writes that report what changed
//! - [`payload`]: normalization of nested server payloads into records
//! - [`ChangeEmitter`]: batched change notifications keyed by record id
//! - [`GarbageCollector`]: reference counts and host-scheduled eviction
//!
//! # Architecture
//!
//! Records never embed each other; every edge is an id lookup, so the graph
//! may contain cycles freely. [`StoreData`] ties one record store, emitter and
//! collector together as a single store instance.

mod error;
pub mod events;
pub mod gc;
pub mod payload;
pub mod record_store;
mod store_data;
pub mod writer;

pub use error::StoreError;
pub use events::{ChangeEmitter, StoreChange, Subscription};
pub use gc::{GarbageCollector, GcScheduler, GcStep};
pub use record_store::{RecordStore, WriteLayer};
pub use store_data::StoreData;
pub use writer::{RecordWriter, WriteSummary};
