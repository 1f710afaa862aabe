//! Mutation Transaction Queue
//!
//! Sequences mutations from creation to removal.
//!
//! # Lifecycle
//!
//! 1. **Create**: the transaction gets the next sequential id and, if the
//!    mutation has an optimistic response, its optimistic write is applied
//!    to the store immediately.
//! 2. **Commit**: the request is sent on the current tokio runtime, unless
//!    another transaction with the same collision key is in flight, in which
//!    case this one waits in that key's queue.
//! 3. **Success**: optimistic data is replaced by the server payload, the
//!    success callback runs, the transaction is removed and the next queued
//!    transaction for its key is sent.
//! 4. **Failure**: the transaction and everything queued behind it for the
//!    same key fail. Failure callbacks run in commit order; each transaction
//!    is rolled back afterwards unless its callback prevented that. Commits
//!    for the key made while these callbacks run are held until the last one
//!    returns.
//!
//! # Concurrency
//!
//! Completions are processed as one step each: a reentrant step lock is held
//! for the whole completion, so rollbacks and requeues from one completion
//! finish before another begins, while callbacks may still call back into
//! the queue on the same thread. The state lock itself is never held while a
//! callback runs.

use crate::db::{StoreData, WriteLayer};
use crate::models::ClientMutationId;
use crate::network::{MutationRequest, NetworkError, NetworkLayer};
use crate::operations::error::MutationError;
use crate::operations::mutation::{write_mutation_payload, Mutation};
use crate::operations::optimistic::infer_optimistic_query;
use crate::operations::transaction::{
    FailureCallback, MutationTransaction, PreventAutoRollback, SuccessCallback,
    TransactionCallbacks, TransactionStatus,
};
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::runtime::Handle;

struct PendingTransaction {
    mutation: Arc<dyn Mutation>,
    status: TransactionStatus,
    error: Option<NetworkError>,
    collision_key: Option<String>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

#[derive(Default)]
struct QueueState {
    transactions: HashMap<ClientMutationId, PendingTransaction>,
    /// Per key: the committing transaction first, then those queued behind it
    collision_queues: HashMap<String, VecDeque<ClientMutationId>>,
    /// Keys whose failed queue is still running failure callbacks, with the
    /// commits that arrived meanwhile
    draining: HashMap<String, Vec<ClientMutationId>>,
    next_id: u64,
}

pub(crate) struct QueueInner {
    store: Arc<StoreData>,
    network: Arc<dyn NetworkLayer>,
    state: Mutex<QueueState>,
    step: ReentrantMutex<()>,
}

/// Queue of pending mutation transactions for one store
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    pub fn new(store: Arc<StoreData>, network: Arc<dyn NetworkLayer>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                network,
                state: Mutex::new(QueueState::default()),
                step: ReentrantMutex::new(()),
            }),
        }
    }

    /// Create a transaction and apply its optimistic write
    pub fn create_transaction(
        &self,
        mutation: Arc<dyn Mutation>,
        callbacks: TransactionCallbacks,
    ) -> Result<MutationTransaction, MutationError> {
        self.inner.create(mutation, callbacks)
    }

    /// Create a transaction and commit it right away
    pub fn commit_update(
        &self,
        mutation: Arc<dyn Mutation>,
        callbacks: TransactionCallbacks,
    ) -> Result<MutationTransaction, MutationError> {
        let transaction = self.inner.create(mutation, callbacks)?;
        transaction.commit()?;
        Ok(transaction)
    }

    /// Handle for a queued transaction
    pub fn transaction(&self, id: &str) -> Result<MutationTransaction, MutationError> {
        self.inner.status(id)?;
        Ok(MutationTransaction::new(id.to_string(), &self.inner))
    }

    pub fn status(&self, id: &str) -> Result<TransactionStatus, MutationError> {
        self.inner.status(id)
    }

    pub fn error(&self, id: &str) -> Result<Option<NetworkError>, MutationError> {
        self.inner.error(id)
    }

    pub fn commit(&self, id: &str) -> Result<(), MutationError> {
        self.inner.commit(id)
    }

    pub fn recommit(&self, id: &str) -> Result<(), MutationError> {
        self.inner.recommit(id)
    }

    pub fn rollback(&self, id: &str) -> Result<(), MutationError> {
        self.inner.rollback(id)
    }

    /// Ids of every queued transaction, oldest first
    pub fn pending_ids(&self) -> Vec<ClientMutationId> {
        let mut ids: Vec<ClientMutationId> =
            self.inner.state.lock().transactions.keys().cloned().collect();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueInner {
    fn create(
        self: &Arc<Self>,
        mutation: Arc<dyn Mutation>,
        callbacks: TransactionCallbacks,
    ) -> Result<MutationTransaction, MutationError> {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id.to_string();
            state.next_id += 1;
            state.transactions.insert(
                id.clone(),
                PendingTransaction {
                    mutation: mutation.clone(),
                    status: TransactionStatus::Uncommitted,
                    error: None,
                    collision_key: mutation.collision_key(),
                    on_success: callbacks.on_success,
                    on_failure: callbacks.on_failure,
                },
            );
            id
        };

        if let Some(response) = mutation.optimistic_response() {
            let query = mutation
                .optimistic_query()
                .or_else(|| infer_optimistic_query(&mutation.fat_query(), &response));
            match query {
                Some(query) => {
                    let configs = mutation
                        .optimistic_configs()
                        .unwrap_or_else(|| mutation.configs());
                    let written = self.store.update(WriteLayer::Optimistic(id.clone()), |writer| {
                        write_mutation_payload(writer, &query, &response, &configs)
                    });
                    if let Err(error) = written {
                        self.store.clear_optimistic(&id);
                        self.state.lock().transactions.remove(&id);
                        return Err(error.into());
                    }
                }
                None => tracing::debug!(
                    "Optimistic response of '{}' shares no fields with its fat query",
                    mutation.mutation_name()
                ),
            }
        }

        tracing::info!(
            "Created mutation transaction '{}' for '{}'",
            id,
            mutation.mutation_name()
        );
        Ok(MutationTransaction::new(id, self))
    }

    pub(crate) fn status(&self, id: &str) -> Result<TransactionStatus, MutationError> {
        self.state
            .lock()
            .transactions
            .get(id)
            .map(|transaction| transaction.status)
            .ok_or_else(|| MutationError::invalid_transaction(id))
    }

    pub(crate) fn error(&self, id: &str) -> Result<Option<NetworkError>, MutationError> {
        self.state
            .lock()
            .transactions
            .get(id)
            .map(|transaction| transaction.error.clone())
            .ok_or_else(|| MutationError::invalid_transaction(id))
    }

    pub(crate) fn commit(self: &Arc<Self>, id: &str) -> Result<(), MutationError> {
        let _step = self.step.lock();
        let status = self.status(id)?;
        if status != TransactionStatus::Uncommitted {
            return Err(MutationError::invalid_status(id, status, "commit"));
        }
        let runtime = Handle::try_current().map_err(|_| MutationError::RuntimeUnavailable)?;
        tracing::info!("Committing mutation transaction '{}'", id);
        self.enqueue(id, &runtime)
    }

    pub(crate) fn recommit(self: &Arc<Self>, id: &str) -> Result<(), MutationError> {
        let _step = self.step.lock();
        let status = self.status(id)?;
        if !status.is_failed() {
            return Err(MutationError::invalid_status(id, status, "recommit"));
        }
        let runtime = Handle::try_current().map_err(|_| MutationError::RuntimeUnavailable)?;
        if let Some(transaction) = self.state.lock().transactions.get_mut(id) {
            transaction.error = None;
        }
        tracing::info!("Recommitting mutation transaction '{}'", id);
        self.enqueue(id, &runtime)
    }

    pub(crate) fn rollback(self: &Arc<Self>, id: &str) -> Result<(), MutationError> {
        let _step = self.step.lock();
        let status = self.status(id)?;
        if status == TransactionStatus::Committing {
            return Err(MutationError::invalid_status(id, status, "rollback"));
        }
        self.remove_and_rollback(id);
        Ok(())
    }

    /// Take the committing slot for the transaction's key, or wait behind it
    fn enqueue(self: &Arc<Self>, id: &str, runtime: &Handle) -> Result<(), MutationError> {
        let send_now = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let transaction = state
                .transactions
                .get_mut(id)
                .ok_or_else(|| MutationError::invalid_transaction(id))?;
            match &transaction.collision_key {
                Some(key) if state.draining.contains_key(key) => {
                    transaction.status = TransactionStatus::CommitQueued;
                    if let Some(waiting) = state.draining.get_mut(key) {
                        waiting.push(id.to_string());
                    }
                    tracing::debug!(
                        "Transaction '{}' waits for failure callbacks on key '{}'",
                        id,
                        key
                    );
                    false
                }
                Some(key) => {
                    let queue = state.collision_queues.entry(key.clone()).or_default();
                    queue.push_back(id.to_string());
                    if queue.len() > 1 {
                        transaction.status = TransactionStatus::CommitQueued;
                        tracing::debug!(
                            "Transaction '{}' queued behind '{:?}' for key '{}'",
                            id,
                            queue.front(),
                            key
                        );
                        false
                    } else {
                        transaction.status = TransactionStatus::Committing;
                        true
                    }
                }
                None => {
                    transaction.status = TransactionStatus::Committing;
                    true
                }
            }
        };
        if send_now {
            self.send(id, runtime)?;
        }
        Ok(())
    }

    fn send(self: &Arc<Self>, id: &str, runtime: &Handle) -> Result<(), MutationError> {
        let request = {
            let state = self.state.lock();
            let transaction = state
                .transactions
                .get(id)
                .ok_or_else(|| MutationError::invalid_transaction(id))?;
            let mutation = &transaction.mutation;
            let mut input = mutation.variables();
            if let Value::Object(fields) = &mut input {
                fields.insert("clientMutationId".to_string(), Value::String(id.to_string()));
            }
            MutationRequest {
                mutation_name: mutation.mutation_name().to_string(),
                client_mutation_id: id.to_string(),
                input,
                query: mutation.fat_query(),
            }
        };

        let queue = self.clone();
        let id = id.to_string();
        runtime.spawn(async move {
            let result = queue.network.send_mutation(request).await;
            queue.complete(&id, result);
        });
        Ok(())
    }

    fn complete(self: &Arc<Self>, id: &str, result: Result<Value, NetworkError>) {
        let _step = self.step.lock();
        match self.status(id) {
            Ok(TransactionStatus::Committing) => {}
            other => {
                tracing::warn!(
                    "Ignoring completion of mutation transaction '{}' in state {:?}",
                    id,
                    other
                );
                return;
            }
        }
        match result {
            Ok(response) => self.handle_success(id, response),
            Err(error) => self.handle_failure(id, error),
        }
    }

    fn handle_success(self: &Arc<Self>, id: &str, response: Value) {
        let Some((mutation, on_success)) = self
            .state
            .lock()
            .transactions
            .get_mut(id)
            .map(|transaction| (transaction.mutation.clone(), transaction.on_success.take()))
        else {
            return;
        };

        let configs = mutation.configs();
        let written = self.store.emitter().batch(|| {
            self.store.clear_optimistic(id);
            match infer_optimistic_query(&mutation.fat_query(), &response) {
                Some(query) => self
                    .store
                    .update(WriteLayer::Authoritative, |writer| {
                        write_mutation_payload(writer, &query, &response, &configs)
                    })
                    .map(|_| ()),
                None => Ok(()),
            }
        });
        if let Err(error) = written {
            tracing::warn!(
                "Payload of mutation transaction '{}' could not be written: {}",
                id,
                error
            );
        }

        if let Some(on_success) = on_success {
            on_success(&response);
        }

        let next = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let removed = state.transactions.remove(id);
            let mut next = None;
            if let Some(key) = removed.and_then(|transaction| transaction.collision_key) {
                if let Some(queue) = state.collision_queues.get_mut(&key) {
                    queue.retain(|queued| queued != id);
                    match queue.front() {
                        Some(front) => {
                            if let Some(transaction) = state.transactions.get_mut(front) {
                                transaction.status = TransactionStatus::Committing;
                            }
                            next = Some(front.clone());
                        }
                        None => {
                            state.collision_queues.remove(&key);
                        }
                    }
                }
            }
            next
        };
        tracing::info!("Mutation transaction '{}' succeeded", id);

        if let Some(next) = next {
            let sent = Handle::try_current()
                .map_err(|_| MutationError::RuntimeUnavailable)
                .and_then(|runtime| self.send(&next, &runtime));
            if let Err(error) = sent {
                tracing::warn!("Could not send queued transaction '{}': {}", next, error);
            }
        }
    }

    fn handle_failure(self: &Arc<Self>, id: &str, error: NetworkError) {
        let (key, affected) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let key = state
                .transactions
                .get(id)
                .and_then(|transaction| transaction.collision_key.clone());
            let mut affected: Vec<ClientMutationId> = key
                .as_ref()
                .and_then(|key| state.collision_queues.remove(key))
                .map(|queue| queue.into_iter().collect())
                .unwrap_or_default();
            if let Some(key) = &key {
                state.draining.insert(key.clone(), Vec::new());
            }
            if !affected.iter().any(|queued| queued == id) {
                affected.insert(0, id.to_string());
            }
            for queued in &affected {
                if let Some(transaction) = state.transactions.get_mut(queued) {
                    transaction.status = if queued == id {
                        TransactionStatus::CommitFailed
                    } else {
                        TransactionStatus::CollisionCommitFailed
                    };
                    transaction.error = Some(error.clone());
                }
            }
            (key, affected)
        };
        tracing::warn!(
            "Mutation transaction '{}' failed ({}); {} transaction(s) affected",
            id,
            error,
            affected.len()
        );

        for queued in affected {
            self.fail_transaction(&queued);
        }

        if let Some(key) = key {
            self.release_draining(&key);
        }
    }

    /// Admit the commits a failed key held back, in the order they arrived
    fn release_draining(self: &Arc<Self>, key: &str) {
        let waiting = self.state.lock().draining.remove(key).unwrap_or_default();
        if waiting.is_empty() {
            return;
        }
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No runtime to send transactions held on key '{}'", key);
                return;
            }
        };
        for id in waiting {
            // Rolled back or removed while waiting
            if self.status(&id) != Ok(TransactionStatus::CommitQueued) {
                continue;
            }
            if let Err(error) = self.enqueue(&id, &runtime) {
                tracing::warn!("Could not commit held transaction '{}': {}", id, error);
            }
        }
    }

    fn fail_transaction(self: &Arc<Self>, id: &str) {
        let callback = self
            .state
            .lock()
            .transactions
            .get_mut(id)
            .and_then(|transaction| transaction.on_failure.take());

        let prevent = PreventAutoRollback::new();
        if let Some(mut callback) = callback {
            let handle = MutationTransaction::new(id.to_string(), self);
            callback(&handle, &prevent);
            // Keep it for failures after a recommit
            if let Some(transaction) = self.state.lock().transactions.get_mut(id) {
                if transaction.on_failure.is_none() {
                    transaction.on_failure = Some(callback);
                }
            }
        }

        // A callback may have recommitted or rolled back already
        let still_failed = self.status(id).map(TransactionStatus::is_failed).unwrap_or(false);
        if still_failed && !prevent.is_prevented() {
            self.remove_and_rollback(id);
        }
    }

    fn remove_and_rollback(&self, id: &str) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let removed = state.transactions.remove(id);
            if let Some(key) = removed.and_then(|transaction| transaction.collision_key) {
                if let Some(queue) = state.collision_queues.get_mut(&key) {
                    queue.retain(|queued| queued != id);
                    if queue.is_empty() {
                        state.collision_queues.remove(&key);
                    }
                }
                if let Some(waiting) = state.draining.get_mut(&key) {
                    waiting.retain(|queued| queued != id);
                }
            }
        }
        let changed = self.store.clear_optimistic(id);
        tracing::info!(
            "Rolled back mutation transaction '{}' ({} records restored)",
            id,
            changed.len()
        );
    }
}
