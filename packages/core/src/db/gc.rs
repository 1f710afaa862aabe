//! Garbage Collector
//!
//! Reference counts record reachability from live resolutions. Resolvers
//! increment the count of every record a resolution read and decrement it when
//! the resolution is replaced or disposed. Records whose count is zero are
//! eligible for eviction, but nothing is evicted until the host asks for a
//! collection pass.
//!
//! # Scheduling
//!
//! A pass is split into steps of at most `step_size` evictions. The host
//! supplies a scheduler that receives a step function and keeps calling it
//! until it returns `false`; the default scheduler runs every step
//! immediately. This lets the host spread collection over idle time.
//!
//! Records with pending optimistic writes are never collected.

use crate::models::DataId;
use crate::db::record_store::RecordStore;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One step of a collection pass; returns `true` while work remains
pub type GcStep = Box<dyn FnMut() -> bool + Send>;

/// Host hook that drives a collection pass
pub type GcScheduler = Arc<dyn Fn(GcStep) + Send + Sync>;

pub struct GarbageCollector {
    counts: Mutex<HashMap<DataId, usize>>,
    scheduler: Mutex<GcScheduler>,
    step_size: usize,
    collecting: Arc<AtomicBool>,
}

impl GarbageCollector {
    pub fn new(step_size: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(Arc::new(run_to_completion)),
            step_size: step_size.max(1),
            collecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the step runner used by [`collect`](Self::collect)
    pub fn set_scheduler<F>(&self, scheduler: F)
    where
        F: Fn(GcStep) + Send + Sync + 'static,
    {
        *self.scheduler.lock() = Arc::new(scheduler);
    }

    pub fn increment(&self, data_id: &str) {
        *self.counts.lock().entry(data_id.to_string()).or_insert(0) += 1;
    }

    /// Counts never go below zero; extra decrements are ignored
    pub fn decrement(&self, data_id: &str) {
        let mut counts = self.counts.lock();
        match counts.get_mut(data_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(data_id);
            }
            None => {
                tracing::warn!("Reference count of '{}' decremented below zero", data_id);
            }
        }
    }

    pub fn increment_all<'i>(&self, ids: impl IntoIterator<Item = &'i DataId>) {
        let mut counts = self.counts.lock();
        for id in ids {
            *counts.entry(id.clone()).or_insert(0) += 1;
        }
    }

    pub fn decrement_all<'i>(&self, ids: impl IntoIterator<Item = &'i DataId>) {
        for id in ids {
            self.decrement(id);
        }
    }

    pub fn ref_count(&self, data_id: &str) -> usize {
        self.counts.lock().get(data_id).copied().unwrap_or(0)
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    /// Evict every record nobody references
    ///
    /// Returns the number of records evicted by the time the scheduler
    /// returned; with a deferring scheduler the rest are evicted later.
    pub fn collect(self: &Arc<Self>, records: &Arc<RwLock<RecordStore>>) -> usize {
        if self.collecting.swap(true, Ordering::AcqRel) {
            tracing::debug!("Garbage collection already in progress");
            return 0;
        }

        let candidates: VecDeque<DataId> = {
            let store = records.read();
            let counts = self.counts.lock();
            store
                .record_ids()
                .into_iter()
                .filter(|id| !counts.contains_key(id))
                .collect()
        };
        tracing::info!("Starting garbage collection with {} candidates", candidates.len());

        let collected = Arc::new(AtomicUsize::new(0));
        let mut pass = CollectionPass {
            collector: self.clone(),
            records: records.clone(),
            queue: candidates,
            visited: HashSet::new(),
            collected: collected.clone(),
            finished: false,
        };
        let step: GcStep = Box::new(move || pass.step());
        let scheduler = self.scheduler.lock().clone();
        scheduler(step);
        collected.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("tracked", &self.counts.lock().len())
            .field("step_size", &self.step_size)
            .finish()
    }
}

fn run_to_completion(mut step: GcStep) {
    while step() {}
}

struct CollectionPass {
    collector: Arc<GarbageCollector>,
    records: Arc<RwLock<RecordStore>>,
    queue: VecDeque<DataId>,
    visited: HashSet<DataId>,
    collected: Arc<AtomicUsize>,
    finished: bool,
}

impl CollectionPass {
    fn step(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let mut store = self.records.write();
        let mut evicted = 0;
        while evicted < self.collector.step_size {
            let Some(data_id) = self.queue.pop_front() else {
                break;
            };
            if !self.visited.insert(data_id.clone()) {
                continue;
            }
            // Counts may have changed between steps
            if self.collector.ref_count(&data_id) > 0 || store.has_optimistic_update(&data_id) {
                continue;
            }
            if let Some(record) = store.remove_record(&data_id) {
                for target in record.outgoing_references() {
                    if !self.visited.contains(&target) && self.collector.ref_count(&target) == 0 {
                        self.queue.push_back(target);
                    }
                }
            }
            evicted += 1;
        }
        self.collected.fetch_add(evicted, Ordering::AcqRel);

        if self.queue.is_empty() {
            tracing::info!(
                "Garbage collection finished: {} records evicted, {} remain",
                self.collected.load(Ordering::Acquire),
                store.len()
            );
            self.finished = true;
            self.collector.collecting.store(false, Ordering::Release);
            false
        } else {
            true
        }
    }
}

impl Drop for CollectionPass {
    fn drop(&mut self) {
        // A host that abandons a pass must not block later passes
        if !self.finished {
            tracing::debug!(
                "Garbage collection pass dropped with {} candidates left",
                self.queue.len()
            );
            self.collector.collecting.store(false, Ordering::Release);
        }
    }
}
