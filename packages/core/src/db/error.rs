//! Store Error Types
//!
//! This module defines error types for record store operations: reads that hit
//! data the store does not have yet, malformed query definitions, and payloads
//! that do not match the query they were fetched with.

use crate::models::DataId;
use thiserror::Error;

/// Record store and query errors
///
/// `MissingData` is local to a single read; callers may treat it as "not
/// loaded yet". `InvariantViolation` is a programmer error in a query or
/// fragment definition and is never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A required record or field is absent from the store
    #[error("Missing data for record '{data_id}'{}", .field.as_ref().map(|f| format!(" field '{}'", f)).unwrap_or_default())]
    MissingData {
        data_id: DataId,
        field: Option<String>,
    },

    /// Malformed fragment or query definition
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A payload does not have the shape its query describes
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The record is not known to the store
    #[error("Unknown record: {data_id}")]
    UnknownRecord { data_id: DataId },
}

impl StoreError {
    /// Create a missing data error for a whole record
    pub fn missing_record(data_id: impl Into<DataId>) -> Self {
        Self::MissingData {
            data_id: data_id.into(),
            field: None,
        }
    }

    /// Create a missing data error for one field of a record
    pub fn missing_field(data_id: impl Into<DataId>, field: impl Into<String>) -> Self {
        Self::MissingData {
            data_id: data_id.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invariant violation error
    pub fn invariant_violation(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create an invalid payload error
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create an unknown record error
    pub fn unknown_record(data_id: impl Into<DataId>) -> Self {
        Self::UnknownRecord {
            data_id: data_id.into(),
        }
    }

    /// Whether this error only means "not loaded yet"
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Self::MissingData { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_data_messages() {
        assert_eq!(
            StoreError::missing_record("123").to_string(),
            "Missing data for record '123'"
        );
        assert_eq!(
            StoreError::missing_field("123", "name").to_string(),
            "Missing data for record '123' field 'name'"
        );
        assert!(StoreError::missing_record("1").is_missing_data());
        assert!(!StoreError::invariant_violation("bad").is_missing_data());
    }
}
