//! Record Store
//!
//! The normalized `dataID -> Record` map plus an optimistic overlay.
//!
//! # Layers
//!
//! - **Authoritative records**: data confirmed by the server. A deleted record
//!   is kept as a tombstone so reads can tell "deleted" from "never fetched".
//! - **Optimistic overlay**: speculative writes made by pending mutations,
//!   recorded per mutation as an ordered write log. Reads consult the overlay
//!   first.
//!
//! Clearing a mutation's optimistic writes removes exactly the fields that
//! mutation touched and replays the remaining mutations' writes to those same
//! fields, so no snapshot of prior state is ever taken.

use crate::models::{
    ClientMutationId, DataId, FieldValue, QueryPath, Record, RecordState,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Which layer a write lands in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteLayer {
    Authoritative,
    Optimistic(ClientMutationId),
}

#[derive(Debug, Clone)]
pub(crate) enum RecordOp {
    Create,
    Delete,
    Field { key: String, value: FieldValue },
}

#[derive(Debug)]
struct OptimisticWrite {
    mutation_id: ClientMutationId,
    ops: Vec<(DataId, RecordOp)>,
}

#[derive(Debug, Default)]
struct OverlayRecord {
    state: Option<RecordState>,
    fields: BTreeMap<String, FieldValue>,
    mutations: BTreeSet<ClientMutationId>,
}

impl OverlayRecord {
    fn is_empty(&self) -> bool {
        self.state.is_none() && self.fields.is_empty() && self.mutations.is_empty()
    }
}

/// Prior state of everything one update touched
///
/// Restoring it with [`RecordStore::undo`] makes a failed update leave no
/// trace. Authoritative entries are captured on first touch; optimistic
/// writes are undone by truncating the mutation's write log.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    records: HashMap<DataId, Option<Option<Record>>>,
    root_calls: HashMap<String, Option<Vec<DataId>>>,
    paths: HashMap<DataId, Option<QueryPath>>,
    optimistic: Option<(ClientMutationId, usize)>,
}

impl UndoLog {
    pub(crate) fn new(store: &RecordStore, layer: &WriteLayer) -> Self {
        let optimistic = match layer {
            WriteLayer::Authoritative => None,
            WriteLayer::Optimistic(mutation_id) => Some((
                mutation_id.clone(),
                store.optimistic_write_count(mutation_id),
            )),
        };
        Self {
            optimistic,
            ..Self::default()
        }
    }

    pub(crate) fn remember_record(&mut self, store: &RecordStore, data_id: &str) {
        if self.optimistic.is_none() && !self.records.contains_key(data_id) {
            self.records
                .insert(data_id.to_string(), store.records.get(data_id).cloned());
        }
    }

    pub(crate) fn remember_root_call(&mut self, store: &RecordStore, storage_key: &str) {
        if !self.root_calls.contains_key(storage_key) {
            self.root_calls
                .insert(storage_key.to_string(), store.root_calls.get(storage_key).cloned());
        }
    }

    pub(crate) fn remember_path(&mut self, store: &RecordStore, data_id: &str) {
        if !self.paths.contains_key(data_id) {
            self.paths
                .insert(data_id.to_string(), store.paths.get(data_id).cloned());
        }
    }
}

/// Normalized record graph
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<DataId, Option<Record>>,
    overlay: HashMap<DataId, OverlayRecord>,
    optimistic_writes: Vec<OptimisticWrite>,
    root_calls: HashMap<String, Vec<DataId>>,
    paths: HashMap<DataId, QueryPath>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn authoritative_state(&self, data_id: &str) -> RecordState {
        match self.records.get(data_id) {
            Some(Some(_)) => RecordState::Existent,
            Some(None) => RecordState::Nonexistent,
            None => RecordState::Unknown,
        }
    }

    /// State of a record as seen through the optimistic overlay
    pub fn record_state(&self, data_id: &str) -> RecordState {
        match self.overlay.get(data_id).and_then(|o| o.state) {
            Some(state) => state,
            None => self.authoritative_state(data_id),
        }
    }

    /// Merged view of a record; `None` unless it exists
    pub fn get_record(&self, data_id: &str) -> Option<Record> {
        if self.record_state(data_id) != RecordState::Existent {
            return None;
        }
        let mut record = match self.records.get(data_id) {
            Some(Some(record)) => record.clone(),
            _ => Record::new(data_id),
        };
        if let Some(overlay) = self.overlay.get(data_id) {
            if overlay.state == Some(RecordState::Existent)
                && self.authoritative_state(data_id) != RecordState::Existent
            {
                record.fields.clear();
            }
            for (key, value) in &overlay.fields {
                record.fields.insert(key.clone(), value.clone());
            }
        }
        Some(record)
    }

    /// Merged value of one field; `None` if the record or field is absent
    pub fn get_field(&self, data_id: &str, storage_key: &str) -> Option<FieldValue> {
        if self.record_state(data_id) != RecordState::Existent {
            return None;
        }
        if let Some(value) = self
            .overlay
            .get(data_id)
            .and_then(|overlay| overlay.fields.get(storage_key))
        {
            return Some(value.clone());
        }
        let resurrected = self
            .overlay
            .get(data_id)
            .map(|o| o.state == Some(RecordState::Existent))
            .unwrap_or(false)
            && self.authoritative_state(data_id) != RecordState::Existent;
        if resurrected {
            return None;
        }
        self.records
            .get(data_id)
            .and_then(|record| record.as_ref())
            .and_then(|record| record.get(storage_key).cloned())
    }

    /// Authoritative record, ignoring optimistic writes
    pub fn get_authoritative_record(&self, data_id: &str) -> Option<&Record> {
        self.records.get(data_id).and_then(|record| record.as_ref())
    }

    /// Ids of pending mutations with optimistic writes to this record
    pub fn pending_mutations(&self, data_id: &str) -> Vec<ClientMutationId> {
        self.overlay
            .get(data_id)
            .map(|overlay| overlay.mutations.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_optimistic_update(&self, data_id: &str) -> bool {
        self.overlay
            .get(data_id)
            .map(|overlay| !overlay.mutations.is_empty())
            .unwrap_or(false)
    }

    /// Ids of every authoritative record, including tombstones
    pub fn record_ids(&self) -> Vec<DataId> {
        let mut ids: Vec<DataId> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, data_id: &str) -> bool {
        self.records.contains_key(data_id)
    }

    /// Records a root field without identifying arguments resolved to
    pub fn root_call_ids(&self, storage_key: &str) -> Option<&[DataId]> {
        self.root_calls.get(storage_key).map(Vec::as_slice)
    }

    pub(crate) fn put_root_call_ids(&mut self, storage_key: String, ids: Vec<DataId>) {
        self.root_calls.insert(storage_key, ids);
    }

    pub fn path(&self, data_id: &str) -> Option<&QueryPath> {
        self.paths.get(data_id)
    }

    pub(crate) fn put_path(&mut self, data_id: DataId, path: QueryPath) {
        self.paths.insert(data_id, path);
    }

    /// Evict a record entirely (no tombstone); used by garbage collection
    pub(crate) fn remove_record(&mut self, data_id: &str) -> Option<Record> {
        self.paths.remove(data_id);
        self.root_calls.retain(|_, ids| !ids.iter().any(|id| id == data_id));
        self.records.remove(data_id).flatten()
    }

    /// Apply one write; returns whether the merged view changed
    pub(crate) fn apply(&mut self, layer: &WriteLayer, data_id: &str, op: RecordOp) -> bool {
        match layer {
            WriteLayer::Authoritative => self.apply_authoritative(data_id, op),
            WriteLayer::Optimistic(mutation_id) => {
                let before = self.merged_snapshot(data_id, &op);
                match self
                    .optimistic_writes
                    .iter_mut()
                    .find(|write| &write.mutation_id == mutation_id)
                {
                    Some(write) => write.ops.push((data_id.to_string(), op.clone())),
                    None => self.optimistic_writes.push(OptimisticWrite {
                        mutation_id: mutation_id.clone(),
                        ops: vec![(data_id.to_string(), op.clone())],
                    }),
                }
                self.apply_overlay(mutation_id, data_id, &op);
                before != self.merged_snapshot(data_id, &op)
            }
        }
    }

    fn merged_snapshot(&self, data_id: &str, op: &RecordOp) -> (RecordState, Option<FieldValue>) {
        let field = match op {
            RecordOp::Field { key, .. } => self.get_field(data_id, key),
            _ => None,
        };
        (self.record_state(data_id), field)
    }

    fn apply_authoritative(&mut self, data_id: &str, op: RecordOp) -> bool {
        match op {
            RecordOp::Create => match self.records.get(data_id) {
                Some(Some(_)) => false,
                _ => {
                    self.records
                        .insert(data_id.to_string(), Some(Record::new(data_id)));
                    true
                }
            },
            RecordOp::Delete => {
                let changed = self.authoritative_state(data_id) != RecordState::Nonexistent;
                self.records.insert(data_id.to_string(), None);
                changed
            }
            RecordOp::Field { key, value } => {
                let slot = self.records.entry(data_id.to_string()).or_insert(None);
                let record = slot.get_or_insert_with(|| Record::new(data_id));
                if record.fields.get(&key) == Some(&value) {
                    return false;
                }
                record.fields.insert(key, value);
                true
            }
        }
    }

    fn apply_overlay(&mut self, mutation_id: &str, data_id: &str, op: &RecordOp) {
        let base_exists = self.authoritative_state(data_id) == RecordState::Existent;
        let overlay = self.overlay.entry(data_id.to_string()).or_default();
        overlay.mutations.insert(mutation_id.to_string());
        match op {
            RecordOp::Create => {
                if overlay.state != Some(RecordState::Existent) && !base_exists {
                    overlay.state = Some(RecordState::Existent);
                } else if overlay.state == Some(RecordState::Nonexistent) {
                    overlay.state = Some(RecordState::Existent);
                }
            }
            RecordOp::Delete => {
                overlay.state = Some(RecordState::Nonexistent);
                overlay.fields.clear();
            }
            RecordOp::Field { key, value } => {
                if overlay.state.is_none() && !base_exists {
                    overlay.state = Some(RecordState::Existent);
                }
                overlay.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// Remove every optimistic write made by `mutation_id`
    ///
    /// Returns the ids of records whose merged view may have changed.
    pub(crate) fn clear_optimistic(&mut self, mutation_id: &str) -> Vec<DataId> {
        let Some(position) = self
            .optimistic_writes
            .iter()
            .position(|write| write.mutation_id == mutation_id)
        else {
            return Vec::new();
        };
        let removed = self.optimistic_writes.remove(position);

        let mut touched_fields: HashMap<DataId, HashSet<String>> = HashMap::new();
        let mut touched_state: HashSet<DataId> = HashSet::new();
        for (data_id, op) in &removed.ops {
            match op {
                RecordOp::Field { key, .. } => {
                    touched_fields
                        .entry(data_id.clone())
                        .or_default()
                        .insert(key.clone());
                    touched_state.insert(data_id.clone());
                }
                RecordOp::Create | RecordOp::Delete => {
                    touched_state.insert(data_id.clone());
                }
            }
        }

        for data_id in &touched_state {
            if let Some(overlay) = self.overlay.get_mut(data_id) {
                overlay.mutations.remove(mutation_id);
                overlay.state = None;
                if let Some(keys) = touched_fields.get(data_id) {
                    for key in keys {
                        overlay.fields.remove(key);
                    }
                }
            }
        }

        // Replay what the remaining mutations wrote to the same records and fields
        let replay: Vec<(ClientMutationId, DataId, RecordOp)> = self
            .optimistic_writes
            .iter()
            .flat_map(|write| {
                write
                    .ops
                    .iter()
                    .filter(|(data_id, op)| match op {
                        RecordOp::Field { key, .. } => touched_fields
                            .get(data_id)
                            .map(|keys| keys.contains(key))
                            .unwrap_or(false)
                            || touched_state.contains(data_id),
                        RecordOp::Create | RecordOp::Delete => touched_state.contains(data_id),
                    })
                    .map(|(data_id, op)| (write.mutation_id.clone(), data_id.clone(), op.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (other_mutation, data_id, op) in replay {
            self.apply_overlay(&other_mutation, &data_id, &op);
        }

        let mut changed: Vec<DataId> = touched_state.into_iter().collect();
        for data_id in &changed {
            if self.overlay.get(data_id).map(OverlayRecord::is_empty).unwrap_or(false) {
                self.overlay.remove(data_id);
            }
        }
        changed.sort();
        changed
    }

    fn optimistic_write_count(&self, mutation_id: &str) -> usize {
        self.optimistic_writes
            .iter()
            .find(|write| write.mutation_id == mutation_id)
            .map(|write| write.ops.len())
            .unwrap_or(0)
    }

    /// Put back everything recorded in `log`
    pub(crate) fn undo(&mut self, log: UndoLog) {
        for (data_id, record) in log.records {
            match record {
                Some(record) => self.records.insert(data_id, record),
                None => self.records.remove(&data_id),
            };
        }
        for (storage_key, ids) in log.root_calls {
            match ids {
                Some(ids) => self.root_calls.insert(storage_key, ids),
                None => self.root_calls.remove(&storage_key),
            };
        }
        for (data_id, path) in log.paths {
            match path {
                Some(path) => self.paths.insert(data_id, path),
                None => self.paths.remove(&data_id),
            };
        }
        if let Some((mutation_id, kept)) = log.optimistic {
            self.truncate_optimistic(&mutation_id, kept);
        }
    }

    /// Keep only the first `kept` writes of `mutation_id`
    fn truncate_optimistic(&mut self, mutation_id: &str, kept: usize) {
        let Some(position) = self
            .optimistic_writes
            .iter()
            .position(|write| write.mutation_id == mutation_id)
        else {
            return;
        };
        if kept == 0 {
            self.optimistic_writes.remove(position);
        } else {
            self.optimistic_writes[position].ops.truncate(kept);
        }

        // Rebuilt in commit order so later mutations still win
        self.overlay.clear();
        let writes = std::mem::take(&mut self.optimistic_writes);
        for write in &writes {
            for (data_id, op) in &write.ops {
                self.apply_overlay(&write.mutation_id, data_id, op);
            }
        }
        self.optimistic_writes = writes;
    }

    /// Whether `mutation_id` has any optimistic writes in the overlay
    pub fn has_optimistic_writes(&self, mutation_id: &str) -> bool {
        self.optimistic_writes
            .iter()
            .any(|write| write.mutation_id == mutation_id)
    }

    /// Drop all records, overlays and bookkeeping
    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.overlay.clear();
        self.optimistic_writes.clear();
        self.root_calls.clear();
        self.paths.clear();
    }
}
