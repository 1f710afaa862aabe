//! Service Layer Error Types
//!
//! Errors surfaced while fetching queries: either the transport failed or the
//! payload could not be written to the store.

use crate::db::StoreError;
use crate::network::NetworkError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The network request failed
    #[error("Query request failed: {0}")]
    Network(#[from] NetworkError),

    /// The response could not be normalized, or the query is malformed
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),
}

/// A root query that could not be satisfied
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFailure {
    pub query: String,
    pub error: QueryError,
}
