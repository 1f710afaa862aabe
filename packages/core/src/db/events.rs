//! Change Emitter
//!
//! Record writes never notify anyone directly. Each write enqueues the ids it
//! touched, and the queue is flushed once per logical update (a payload write,
//! an optimistic write, a mutation response). Listeners registered for a set
//! of ids are called once per flushed batch with the subset of their ids that
//! changed.
//!
//! # Event Flow
//!
//! 1. A writer enqueues changed ids while the store lock is held
//! 2. The update completes and the store lock is released
//! 3. The batch is flushed: matching listeners run, then a `StoreChange` is
//!    published on a broadcast channel for async consumers
//!
//! Listeners may read the store and even write to it; writes made from a
//! listener become a new batch.

use crate::models::DataId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// One flushed batch of changes
///
/// For listener callbacks `data_ids` holds only the ids the listener asked
/// for; on the broadcast channel it holds every id in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChange {
    pub batch: u64,
    pub data_ids: Vec<DataId>,
}

type ChangeCallback = Arc<dyn Fn(&StoreChange) + Send + Sync>;

struct Listener {
    ids: HashSet<DataId>,
    callback: ChangeCallback,
}

#[derive(Default)]
struct PendingChanges {
    depth: usize,
    ids: BTreeSet<DataId>,
}

struct EmitterInner {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
    pending: Mutex<PendingChanges>,
    batch_counter: AtomicU64,
    events: broadcast::Sender<StoreChange>,
}

/// Pub/sub of record changes keyed by record id
#[derive(Clone)]
pub struct ChangeEmitter {
    inner: Arc<EmitterInner>,
}

impl ChangeEmitter {
    /// Create an emitter whose broadcast channel buffers `capacity` batches
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
                pending: Mutex::new(PendingChanges::default()),
                batch_counter: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Call `callback` whenever a flushed batch overlaps `ids`
    ///
    /// The listener stays registered until the returned subscription is
    /// disposed or dropped.
    pub fn add_listener_for_ids<I, F>(&self, ids: I, callback: F) -> Subscription
    where
        I: IntoIterator<Item = DataId>,
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            ids: ids.into_iter().collect(),
            callback: Arc::new(callback),
        };
        self.inner.listeners.lock().insert(id, listener);
        Subscription {
            emitter: Arc::downgrade(&self.inner),
            id,
            disposed: false,
        }
    }

    /// Enqueue one changed id; flushed immediately unless a batch is open
    pub fn broadcast_change_for_id(&self, data_id: impl Into<DataId>) {
        self.enqueue(std::iter::once(data_id.into()));
    }

    /// Enqueue changed ids; flushed immediately unless a batch is open
    pub fn enqueue<I>(&self, ids: I)
    where
        I: IntoIterator<Item = DataId>,
    {
        let flush_now = {
            let mut pending = self.inner.pending.lock();
            pending.ids.extend(ids);
            pending.depth == 0
        };
        if flush_now {
            self.flush();
        }
    }

    /// Run `f` as one logical update: changes enqueued inside are flushed
    /// together when the outermost batch ends
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.pending.lock().depth += 1;
        let depth = BatchDepth { emitter: self };
        let result = f();
        if depth.close() {
            self.flush();
        }
        result
    }

    fn flush(&self) {
        let changed = std::mem::take(&mut self.inner.pending.lock().ids);
        if changed.is_empty() {
            return;
        }
        let batch = self.inner.batch_counter.fetch_add(1, Ordering::Relaxed) + 1;

        // Snapshot matching listeners so callbacks run without the lock held
        let notifications: Vec<(ChangeCallback, StoreChange)> = {
            let listeners = self.inner.listeners.lock();
            listeners
                .values()
                .filter_map(|listener| {
                    let overlap: Vec<DataId> = changed
                        .iter()
                        .filter(|id| listener.ids.contains(*id))
                        .cloned()
                        .collect();
                    if overlap.is_empty() {
                        None
                    } else {
                        Some((
                            listener.callback.clone(),
                            StoreChange {
                                batch,
                                data_ids: overlap,
                            },
                        ))
                    }
                })
                .collect()
        };

        tracing::debug!(
            "Flushing change batch {} ({} ids, {} listeners)",
            batch,
            changed.len(),
            notifications.len()
        );

        for (callback, change) in notifications {
            callback(&change);
        }

        let event = StoreChange {
            batch,
            data_ids: changed.into_iter().collect(),
        };
        if self.inner.events.send(event).is_err() {
            tracing::trace!("No change stream subscribers for batch {}", batch);
        }
    }

    /// Receive every flushed batch
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.events.subscribe()
    }

    /// Every flushed batch as a `Stream`
    pub fn stream(&self) -> BroadcastStream<StoreChange> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Drop every listener and any unflushed changes
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
        self.inner.pending.lock().ids.clear();
    }
}

/// Open batch level; released on drop so a panicking update cannot leave the
/// emitter stuck inside a batch
struct BatchDepth<'a> {
    emitter: &'a ChangeEmitter,
}

impl BatchDepth<'_> {
    /// Leave the batch; `true` when it was the outermost one
    fn close(self) -> bool {
        let outermost = self.release();
        std::mem::forget(self);
        outermost
    }

    fn release(&self) -> bool {
        let mut pending = self.emitter.inner.pending.lock();
        pending.depth = pending.depth.saturating_sub(1);
        pending.depth == 0
    }
}

impl Drop for BatchDepth<'_> {
    fn drop(&mut self) {
        if self.release() {
            // Changes of an aborted batch are not published
            self.emitter.inner.pending.lock().ids.clear();
        }
    }
}

/// Handle keeping a listener registered
///
/// Dropping the subscription disposes it.
pub struct Subscription {
    emitter: Weak<EmitterInner>,
    id: u64,
    disposed: bool,
}

impl Subscription {
    pub fn dispose(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(emitter) = self.emitter.upgrade() {
            emitter.listeners.lock().remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("disposed", &self.disposed)
            .finish()
    }
}
