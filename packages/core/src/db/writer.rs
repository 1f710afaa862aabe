//! Record Writer
//!
//! Field-level write API over a locked [`RecordStore`]. A writer targets one
//! layer (authoritative or one mutation's optimistic overlay) and remembers
//! which records actually changed so the caller can broadcast them as a single
//! batch once the store lock is released.

use crate::db::record_store::{RecordOp, RecordStore, UndoLog, WriteLayer};
use crate::models::{
    ClientIdGenerator, DataId, FieldValue, QueryPath, Range, Record, RecordState, RANGE_FIELD,
};
use serde_json::Value;
use std::collections::BTreeSet;

/// Records touched by one logical update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Records whose merged view changed
    pub changed: Vec<DataId>,
    /// Records that did not exist before the update
    pub created: Vec<DataId>,
}

impl WriteSummary {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.created.is_empty()
    }
}

pub struct RecordWriter<'a> {
    store: &'a mut RecordStore,
    layer: WriteLayer,
    id_generator: &'a ClientIdGenerator,
    changed: BTreeSet<DataId>,
    created: BTreeSet<DataId>,
    undo: UndoLog,
}

impl<'a> RecordWriter<'a> {
    pub fn new(
        store: &'a mut RecordStore,
        layer: WriteLayer,
        id_generator: &'a ClientIdGenerator,
    ) -> Self {
        let undo = UndoLog::new(store, &layer);
        Self {
            store,
            layer,
            id_generator,
            changed: BTreeSet::new(),
            created: BTreeSet::new(),
            undo,
        }
    }

    pub fn layer(&self) -> &WriteLayer {
        &self.layer
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self.layer, WriteLayer::Optimistic(_))
    }

    /// Read access to the store, including writes made so far
    pub fn store(&self) -> &RecordStore {
        self.store
    }

    fn apply(&mut self, data_id: &str, op: RecordOp) -> bool {
        self.undo.remember_record(self.store, data_id);
        let changed = self.store.apply(&self.layer, data_id, op);
        if changed {
            self.changed.insert(data_id.to_string());
        }
        changed
    }

    pub fn record_state(&self, data_id: &str) -> RecordState {
        self.store.record_state(data_id)
    }

    pub fn get_record(&self, data_id: &str) -> Option<Record> {
        self.store.get_record(data_id)
    }

    pub fn get_field(&self, data_id: &str, storage_key: &str) -> Option<FieldValue> {
        self.store.get_field(data_id, storage_key)
    }

    /// Create the record unless it already exists
    pub fn put_record(&mut self, data_id: &str) {
        if self.store.record_state(data_id) == RecordState::Existent {
            return;
        }
        if self.apply(data_id, RecordOp::Create) {
            tracing::debug!("Created record '{}'", data_id);
            self.created.insert(data_id.to_string());
        }
    }

    /// Mark the record deleted; reads see it as null from now on
    pub fn delete_record(&mut self, data_id: &str) {
        if self.apply(data_id, RecordOp::Delete) {
            tracing::debug!("Deleted record '{}'", data_id);
        }
    }

    /// Write one field; last write wins
    pub fn put_field(&mut self, data_id: &str, storage_key: &str, value: FieldValue) {
        self.apply(
            data_id,
            RecordOp::Field {
                key: storage_key.to_string(),
                value,
            },
        );
    }

    pub fn put_scalar(&mut self, data_id: &str, storage_key: &str, value: Value) {
        let value = if value.is_null() {
            FieldValue::Null
        } else {
            FieldValue::Scalar(value)
        };
        self.put_field(data_id, storage_key, value);
    }

    /// Point a field at another record, or sever the edge with `None`
    pub fn put_record_reference(&mut self, data_id: &str, storage_key: &str, target: Option<&str>) {
        let value = match target {
            Some(target) => FieldValue::Reference(target.to_string()),
            None => FieldValue::Null,
        };
        self.put_field(data_id, storage_key, value);
    }

    pub fn put_linked_record_ids(&mut self, data_id: &str, storage_key: &str, ids: Vec<DataId>) {
        self.put_field(data_id, storage_key, FieldValue::References(ids));
    }

    pub fn get_range(&self, data_id: &str) -> Option<Range> {
        match self.store.get_field(data_id, RANGE_FIELD) {
            Some(FieldValue::Range(range)) => Some(range),
            _ => None,
        }
    }

    pub fn put_range(&mut self, data_id: &str, range: Range) {
        self.put_field(data_id, RANGE_FIELD, FieldValue::Range(range));
    }

    /// Existing reference held by a field, if it points at a single record
    pub fn get_reference(&self, data_id: &str, storage_key: &str) -> Option<DataId> {
        match self.store.get_field(data_id, storage_key) {
            Some(FieldValue::Reference(id)) => Some(id),
            _ => None,
        }
    }

    pub fn get_references(&self, data_id: &str, storage_key: &str) -> Option<Vec<DataId>> {
        match self.store.get_field(data_id, storage_key) {
            Some(FieldValue::References(ids)) => Some(ids),
            _ => None,
        }
    }

    pub fn root_call_ids(&self, storage_key: &str) -> Option<Vec<DataId>> {
        self.store.root_call_ids(storage_key).map(<[DataId]>::to_vec)
    }

    /// Remember which records a root field without identifying arguments resolved to
    pub fn put_root_call_ids(&mut self, storage_key: &str, ids: Vec<DataId>) {
        // Root calls describe server state; optimistic payloads never move them
        if self.is_optimistic() {
            return;
        }
        self.undo.remember_root_call(self.store, storage_key);
        self.store.put_root_call_ids(storage_key.to_string(), ids);
    }

    /// Record how to refetch a record; the first known path is kept
    pub fn put_path(&mut self, data_id: &str, path: QueryPath) {
        if self.is_optimistic() {
            return;
        }
        let replace = match self.store.path(data_id) {
            None => true,
            Some(existing) => !existing.is_rooted_at_node() && path.depth() < existing.depth(),
        };
        if replace {
            self.undo.remember_path(self.store, data_id);
            self.store.put_path(data_id.to_string(), path);
        }
    }

    pub fn generate_client_id(&self) -> DataId {
        self.id_generator.generate()
    }

    pub fn into_summary(self) -> WriteSummary {
        self.into_parts().0
    }

    pub(crate) fn into_parts(self) -> (WriteSummary, UndoLog) {
        let summary = WriteSummary {
            changed: self.changed.into_iter().collect(),
            created: self.created.into_iter().collect(),
        };
        (summary, self.undo)
    }
}
