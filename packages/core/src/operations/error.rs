//! Error types for the mutation transaction queue
//!
//! Queue operations fail fast on programmer errors (unknown ids, operations
//! invalid for the current status). Network failures are not errors of the
//! queue itself; they are recorded on the failed transaction and handed to its
//! failure callback.

use crate::db::StoreError;
use crate::models::ClientMutationId;
use crate::network::NetworkError;
use crate::operations::transaction::TransactionStatus;
use thiserror::Error;

/// Errors that can occur during mutation queue operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    /// No transaction with this id is queued
    ///
    /// Raised for ids that were never created and for transactions already
    /// removed after success or rollback.
    #[error("Invalid transaction: no transaction with id '{id}' is queued")]
    InvalidTransaction { id: ClientMutationId },

    /// The operation is not allowed in the transaction's current status
    #[error("Cannot {operation} transaction '{id}' in status {status}")]
    InvalidStatus {
        id: ClientMutationId,
        status: TransactionStatus,
        operation: String,
    },

    /// The mutation request failed
    #[error("Mutation request failed: {0}")]
    Network(#[from] NetworkError),

    /// Writing a mutation payload to the store failed
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// Commit needs a tokio runtime to send the request on
    #[error("No tokio runtime is available to send the mutation")]
    RuntimeUnavailable,
}

impl MutationError {
    pub fn invalid_transaction(id: impl Into<ClientMutationId>) -> Self {
        Self::InvalidTransaction { id: id.into() }
    }

    pub fn invalid_status(
        id: impl Into<ClientMutationId>,
        status: TransactionStatus,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidStatus {
            id: id.into(),
            status,
            operation: operation.into(),
        }
    }
}
