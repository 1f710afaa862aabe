//! Mutation transactions
//!
//! A transaction is one mutation on its way through the queue. Callers hold a
//! [`MutationTransaction`] handle; the queue owns the state. Once the queue
//! removes a transaction (success or rollback) every operation on the handle
//! fails with `InvalidTransaction`.
//!
//! # Status
//!
//! ```text
//! UNCOMMITTED -> COMMITTING -> removed (success)
//!                COMMITTING <-> COMMIT_QUEUED
//!                COMMITTING -> COMMIT_FAILED
//!             COMMIT_QUEUED -> COLLISION_COMMIT_FAILED
//!   COMMIT_FAILED / COLLISION_COMMIT_FAILED -> (recommit) COMMITTING | COMMIT_QUEUED
//! ```

use crate::models::ClientMutationId;
use crate::network::NetworkError;
use crate::operations::error::MutationError;
use crate::operations::mutation_queue::QueueInner;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Created; optimistic data (if any) is visible, nothing sent yet
    Uncommitted,
    /// Waiting behind another transaction with the same collision key
    CommitQueued,
    /// Request in flight
    Committing,
    /// The request failed
    CommitFailed,
    /// A transaction ahead of this one with the same collision key failed
    CollisionCommitFailed,
}

impl TransactionStatus {
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            TransactionStatus::CommitFailed | TransactionStatus::CollisionCommitFailed
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Uncommitted => "UNCOMMITTED",
            TransactionStatus::CommitQueued => "COMMIT_QUEUED",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::CommitFailed => "COMMIT_FAILED",
            TransactionStatus::CollisionCommitFailed => "COLLISION_COMMIT_FAILED",
        };
        f.write_str(name)
    }
}

/// Passed to failure callbacks; calling [`prevent`](Self::prevent) keeps the
/// failed transaction and its optimistic data around for a later recommit
#[derive(Debug, Default)]
pub struct PreventAutoRollback {
    prevented: Cell<bool>,
}

impl PreventAutoRollback {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn prevent(&self) {
        self.prevented.set(true);
    }

    pub fn is_prevented(&self) -> bool {
        self.prevented.get()
    }
}

pub type SuccessCallback = Box<dyn FnOnce(&Value) + Send>;
pub type FailureCallback = Box<dyn FnMut(&MutationTransaction, &PreventAutoRollback) + Send>;

/// Callbacks registered when a transaction is created
#[derive(Default)]
pub struct TransactionCallbacks {
    pub on_success: Option<SuccessCallback>,
    /// Called on every failure, including failures after a recommit
    pub on_failure: Option<FailureCallback>,
}

impl TransactionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&MutationTransaction, &PreventAutoRollback) + Send + 'static,
    {
        self.on_failure = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for TransactionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Handle to a queued transaction
#[derive(Clone)]
pub struct MutationTransaction {
    id: ClientMutationId,
    queue: Weak<QueueInner>,
}

impl MutationTransaction {
    pub(crate) fn new(id: ClientMutationId, queue: &Arc<QueueInner>) -> Self {
        Self {
            id,
            queue: Arc::downgrade(queue),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn queue(&self) -> Result<Arc<QueueInner>, MutationError> {
        self.queue
            .upgrade()
            .ok_or_else(|| MutationError::invalid_transaction(self.id.clone()))
    }

    pub fn status(&self) -> Result<TransactionStatus, MutationError> {
        self.queue()?.status(&self.id)
    }

    /// Network error of the last failed commit
    pub fn error(&self) -> Result<Option<NetworkError>, MutationError> {
        self.queue()?.error(&self.id)
    }

    /// Send the transaction, or queue it behind its collision key
    pub fn commit(&self) -> Result<(), MutationError> {
        self.queue()?.commit(&self.id)
    }

    /// Send a failed transaction again, keeping its optimistic data
    pub fn recommit(&self) -> Result<(), MutationError> {
        self.queue()?.recommit(&self.id)
    }

    /// Discard optimistic data and remove the transaction
    pub fn rollback(&self) -> Result<(), MutationError> {
        self.queue()?.rollback(&self.id)
    }
}

impl fmt::Debug for MutationTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationTransaction")
            .field("id", &self.id)
            .finish()
    }
}
