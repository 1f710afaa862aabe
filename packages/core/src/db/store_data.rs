//! Store Data
//!
//! One store instance: the record graph, its change emitter, the garbage
//! collector and the client id generator. Components that need the store
//! hold an `Arc<StoreData>` instead of reaching for a global.
//!
//! # Write Path
//!
//! Every logical update goes through [`StoreData::update`]: the record lock is
//! taken for the whole update, changed ids are collected by the writer, and
//! the batch is broadcast only after the lock is released so listeners can
//! read the store. An update whose closure fails is undone before the lock
//! is released: readers see either all of its writes or none.

use crate::config::StoreConfig;
use crate::db::events::ChangeEmitter;
use crate::db::gc::GarbageCollector;
use crate::db::payload::write_query_payload;
use crate::db::record_store::{RecordStore, WriteLayer};
use crate::db::writer::{RecordWriter, WriteSummary};
use crate::db::StoreError;
use crate::models::{ClientIdGenerator, DataId, RootQuery, Variables};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

pub struct StoreData {
    records: Arc<RwLock<RecordStore>>,
    emitter: ChangeEmitter,
    gc: Option<Arc<GarbageCollector>>,
    id_generator: ClientIdGenerator,
}

impl StoreData {
    pub fn new(config: &StoreConfig) -> Self {
        let gc = config
            .gc
            .enabled
            .then(|| Arc::new(GarbageCollector::new(config.gc.step_size)));
        Self {
            records: Arc::new(RwLock::new(RecordStore::new())),
            emitter: ChangeEmitter::new(config.event_channel_capacity),
            gc,
            id_generator: ClientIdGenerator::new(),
        }
    }

    pub fn emitter(&self) -> &ChangeEmitter {
        &self.emitter
    }

    pub fn gc(&self) -> Option<&Arc<GarbageCollector>> {
        self.gc.as_ref()
    }

    /// Run `f` with shared access to the records
    pub fn read<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        f(&self.records.read())
    }

    /// Run one logical update against `layer` and broadcast what changed
    pub fn update<R, E>(
        &self,
        layer: WriteLayer,
        f: impl FnOnce(&mut RecordWriter<'_>) -> Result<R, E>,
    ) -> Result<(R, WriteSummary), E> {
        self.emitter.batch(|| {
            let (result, summary) = {
                let mut records = self.records.write();
                let mut writer = RecordWriter::new(&mut *records, layer, &self.id_generator);
                let result = f(&mut writer);
                let (summary, undo) = writer.into_parts();
                if result.is_err() {
                    records.undo(undo);
                }
                (result, summary)
            };
            // A failed update is undone as a whole and never broadcast
            let value = result?;
            self.emitter.enqueue(summary.changed.iter().cloned());
            Ok((value, summary))
        })
    }

    /// Normalize a root query payload as authoritative data
    pub fn handle_query_payload(
        &self,
        query: &Arc<RootQuery>,
        variables: &Variables,
        payload: &Value,
    ) -> Result<WriteSummary, StoreError> {
        let (roots, summary) = self.update(WriteLayer::Authoritative, |writer| {
            write_query_payload(writer, query, variables, payload)
        })?;
        tracing::debug!(
            "Wrote payload for '{}': roots {:?}, {} changed, {} created",
            query.name,
            roots,
            summary.changed.len(),
            summary.created.len()
        );
        Ok(summary)
    }

    /// Remove a mutation's optimistic writes and broadcast the affected records
    pub fn clear_optimistic(&self, mutation_id: &str) -> Vec<DataId> {
        self.emitter.batch(|| {
            let changed = self.records.write().clear_optimistic(mutation_id);
            self.emitter.enqueue(changed.iter().cloned());
            changed
        })
    }

    /// Run a garbage collection pass; 0 when collection is disabled
    pub fn collect_garbage(&self) -> usize {
        match &self.gc {
            Some(gc) => gc.collect(&self.records),
            None => 0,
        }
    }

    pub fn generate_client_id(&self) -> DataId {
        self.id_generator.generate()
    }

    /// Drop every listener and record
    pub fn clear(&self) {
        self.emitter.clear();
        self.records.write().clear();
    }
}

impl std::fmt::Debug for StoreData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreData")
            .field("records", &self.records.read().len())
            .field("gc", &self.gc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Field, Selection};
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_payload_write_is_one_broadcast() {
        let store = StoreData::new(&StoreConfig::default());
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let _sub = store.emitter().add_listener_for_ids(
            vec!["1".to_string(), "2".to_string()],
            move |change| sink.lock().push(change.data_ids.clone()),
        );

        let query = RootQuery::new(
            "UsersQuery",
            Field::plural(
                "nodes",
                vec![Selection::Field(Field::scalar("id")), Selection::Field(Field::scalar("name"))],
            )
            .with_call(crate::models::Call::literal("ids", json!(["1", "2"]))),
        )
        .unwrap();
        let payload = json!({"nodes": [{"id": "1", "name": "A"}, {"id": "2", "name": "B"}]});
        let summary = store
            .handle_query_payload(&query, &Variables::new(), &payload)
            .unwrap();
        assert_eq!(summary.created.len(), 2);

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_failed_payload_leaves_store_unchanged() {
        let store = StoreData::new(&StoreConfig::default());
        let query = RootQuery::new(
            "UserQuery",
            Field::linked(
                "node",
                vec![
                    Selection::Field(Field::scalar("id")),
                    Selection::Field(Field::scalar("name")),
                    Selection::Field(Field::plural(
                        "friends",
                        vec![Selection::Field(Field::scalar("name"))],
                    )),
                ],
            )
            .with_call(crate::models::Call::literal("id", json!("123"))),
        )
        .unwrap();
        store
            .handle_query_payload(
                &query,
                &Variables::new(),
                &json!({"node": {"id": "123", "name": "Grace", "friends": []}}),
            )
            .unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let _sub = store
            .emitter()
            .add_listener_for_ids(vec!["123".to_string()], move |change| {
                sink.lock().push(change.batch)
            });
        let mut changes = store.emitter().subscribe();

        let payload = json!({"node": {"id": "123", "name": "Ada", "friends": [{"name": "x"}, "oops"]}});
        let result = store.handle_query_payload(&query, &Variables::new(), &payload);
        assert!(matches!(result, Err(StoreError::InvalidPayload(_))));

        assert_eq!(store.read(|records| records.record_ids()), vec!["123".to_string()]);
        assert_eq!(
            store.read(|records| records.get_field("123", "name")),
            Some(crate::models::FieldValue::Scalar(json!("Grace")))
        );
        assert!(store.read(|records| records.path("client:1").is_none()));
        assert!(batches.lock().is_empty());
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_collection_disabled() {
        let store = StoreData::new(&StoreConfig::default().without_gc());
        assert!(store.gc().is_none());
        store
            .update(WriteLayer::Authoritative, |writer| {
                writer.put_record("1");
                Ok::<_, StoreError>(())
            })
            .unwrap();
        assert_eq!(store.collect_garbage(), 0);
        assert!(store.read(|records| records.contains("1")));
    }
}
