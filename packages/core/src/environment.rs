//! Environment
//!
//! One store instance and everything that operates on it: the record store
//! with its change emitter and collector, the mutation queue and the query
//! runner. Components never reach for a global; they are handed the
//! environment's [`StoreData`] explicitly.

use crate::config::{ConfigError, StoreConfig};
use crate::db::{StoreData, StoreError, WriteSummary};
use crate::models::{FragmentPointer, RootQuery, Variables};
use crate::network::{NetworkLayer, QueryRequest};
use crate::operations::{Mutation, MutationError, MutationQueue, MutationTransaction, TransactionCallbacks};
use crate::services::{read_root_query, QueryResolver, QueryRunner, ReadOptions, RunSummary};
use serde_json::Value;
use std::sync::Arc;

pub struct Environment {
    store: Arc<StoreData>,
    queue: MutationQueue,
    runner: QueryRunner,
}

impl Environment {
    pub fn new(config: StoreConfig, network: Arc<dyn NetworkLayer>) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(StoreData::new(&config));
        tracing::info!(
            "Environment created (gc: {}, event channel capacity: {})",
            if config.gc.enabled { "enabled" } else { "disabled" },
            config.event_channel_capacity
        );
        Ok(Self {
            queue: MutationQueue::new(store.clone(), network.clone()),
            runner: QueryRunner::new(store.clone(), network),
            store,
        })
    }

    pub fn store(&self) -> &Arc<StoreData> {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Read a root query from the store; absent optional fields read as null
    pub fn read(&self, query: &RootQuery, variables: &Variables) -> Result<Value, StoreError> {
        self.store
            .read(|records| read_root_query(records, query, variables, ReadOptions::default()))
            .map(|result| result.data)
    }

    /// Resolver whose results stay identical until their records change;
    /// `on_change` runs once per change batch that invalidates one of them
    pub fn create_resolver<F>(&self, on_change: F) -> QueryResolver
    where
        F: Fn() + Send + Sync + 'static,
    {
        QueryResolver::new(self.store.clone(), on_change)
    }

    pub fn create_transaction(
        &self,
        mutation: Arc<dyn Mutation>,
        callbacks: TransactionCallbacks,
    ) -> Result<MutationTransaction, MutationError> {
        self.queue.create_transaction(mutation, callbacks)
    }

    pub fn commit_update(
        &self,
        mutation: Arc<dyn Mutation>,
        callbacks: TransactionCallbacks,
    ) -> Result<MutationTransaction, MutationError> {
        self.queue.commit_update(mutation, callbacks)
    }

    pub async fn run_queries(&self, requests: Vec<QueryRequest>) -> RunSummary {
        self.runner.run(requests).await
    }

    pub async fn force_fetch(&self, requests: Vec<QueryRequest>) -> RunSummary {
        self.runner.force_fetch(requests).await
    }

    pub async fn refetch(&self, pointer: &FragmentPointer) -> RunSummary {
        self.runner.refetch(pointer).await
    }

    /// Run a full collection pass now; 0 when collection is disabled
    pub fn collect_garbage(&self) -> usize {
        self.store.collect_garbage()
    }

    /// Write a server payload for `query` without going through the runner
    pub fn handle_query_payload(
        &self,
        query: &Arc<RootQuery>,
        variables: &Variables,
        payload: &Value,
    ) -> Result<WriteSummary, StoreError> {
        self.store.handle_query_payload(query, variables, payload)
    }

    /// Drop every listener and record; requests in flight still complete
    /// against the emptied store
    pub fn dispose(self) {
        let pending = self.queue.len();
        self.store.emitter().clear();
        self.store.clear();
        tracing::info!("Environment disposed ({} transactions pending)", pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::models::{Call, CallValue, Field, Selection};
    use crate::network::{MutationRequest, NetworkError};
    use async_trait::async_trait;
    use serde_json::json;

    struct OfflineNetwork;

    #[async_trait]
    impl NetworkLayer for OfflineNetwork {
        async fn send_query(&self, _request: QueryRequest) -> Result<Value, NetworkError> {
            Err(NetworkError::request("offline"))
        }

        async fn send_mutation(&self, _request: MutationRequest) -> Result<Value, NetworkError> {
            Err(NetworkError::request("offline"))
        }
    }

    fn node_query() -> Arc<RootQuery> {
        RootQuery::new(
            "NodeQuery",
            Field::linked(
                "node",
                vec![
                    Selection::Field(Field::scalar("id")),
                    Selection::Field(Field::scalar("name")),
                ],
            )
            .with_call(Call {
                name: "id".to_string(),
                value: CallValue::Literal(json!("4")),
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StoreConfig {
            gc: GcConfig {
                enabled: true,
                step_size: 0,
            },
            ..StoreConfig::default()
        };
        assert!(Environment::new(config, Arc::new(OfflineNetwork)).is_err());
    }

    #[test]
    fn test_payload_then_read() {
        let env = Environment::new(StoreConfig::default(), Arc::new(OfflineNetwork)).unwrap();
        let query = node_query();
        let variables = Variables::new();
        env.handle_query_payload(&query, &variables, &json!({"node": {"id": "4", "name": "Mark"}}))
            .unwrap();

        let data = env.read(&query, &variables).unwrap();
        assert_eq!(data["node"]["name"], json!("Mark"));
        assert_eq!(data["node"]["__dataID__"], json!("4"));

        // Nothing holds the record, so collection removes it
        assert_eq!(env.collect_garbage(), 1);
        env.dispose();
    }

    #[tokio::test]
    async fn test_cached_query_is_not_sent() {
        let env = Environment::new(StoreConfig::default(), Arc::new(OfflineNetwork)).unwrap();
        let query = node_query();
        env.handle_query_payload(&query, &Variables::new(), &json!({"node": {"id": "4", "name": "Mark"}}))
            .unwrap();

        let summary = env
            .run_queries(vec![QueryRequest::new(query.clone(), Variables::new())])
            .await;
        assert_eq!(summary.cached, vec!["NodeQuery".to_string()]);

        let summary = env
            .force_fetch(vec![QueryRequest::new(query, Variables::new())])
            .await;
        assert_eq!(summary.failed.len(), 1);
        assert!(!summary.is_success());
    }
}
