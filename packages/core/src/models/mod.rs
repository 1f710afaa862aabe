//! Data Models
//!
//! Plain data types shared by the store, the query services and the mutation
//! queue: normalized records, the abstract query tree, fragment pointers,
//! query paths and connection ranges.

pub mod path;
pub mod pointer;
pub mod query;
pub mod range;
pub mod record;

pub use path::QueryPath;
pub use pointer::{FragmentPointer, PointerIds, PointerKey};
pub use query::{
    flatten_fields, Call, CallValue, Field, FieldKind, Fragment, FragmentId, RootQuery, Selection,
    Variables,
};
pub use range::{PageInfo, Range, RangeBehavior, RangeCalls, RangeEdge, RangeWindow};
pub use record::{
    client_edge_id, is_client_id, ClientIdGenerator, ClientMutationId, DataId, FieldValue, Record, RecordState,
    CLIENT_ID_PREFIX, DATA_ID_KEY, RANGE_FIELD,
};
