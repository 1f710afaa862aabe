//! Query Services
//!
//! Everything that turns the record graph into data for consumers, or fills
//! it from the network:
//!
//! - `query_reader` - materializes selections and reports their dependencies
//! - `QueryResolver` - memoized resolution with change-driven invalidation
//! - `QueryRunner` - fetches what the store cannot answer yet
//!
//! Services read through `StoreData` and never hold the record lock across an
//! await point.

pub mod error;
pub mod query_reader;
pub mod query_resolver;
pub mod query_runner;

pub use error::{QueryError, QueryFailure};
pub use query_reader::{read_query_data, read_root_query, FieldFilter, ReadOptions, ReadResult};
pub use query_resolver::{QueryResolver, Resolved};
pub use query_runner::{QueryRunner, RunSummary};
