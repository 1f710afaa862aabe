//! Query Runner
//!
//! Satisfies root queries from the network, sending only what the store
//! cannot already answer. Each payload is written as soon as its own request
//! completes, so one slow query never holds back the others.
//!
//! Refetching a record without a server id walks its stored query path back
//! to the nearest refetchable ancestor and replays the fields below it.

use crate::db::{StoreData, StoreError};
use crate::models::{is_client_id, FragmentPointer, QueryPath, Selection};
use crate::network::{NetworkError, NetworkLayer, QueryRequest, BATCH_CAPABILITY};
use crate::services::error::{QueryError, QueryFailure};
use crate::services::query_reader::{read_root_query, ReadOptions};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Queries answered from the store without a request
    pub cached: Vec<String>,
    /// Queries fetched and written successfully
    pub fetched: Vec<String>,
    pub failed: Vec<QueryFailure>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct QueryRunner {
    store: Arc<StoreData>,
    network: Arc<dyn NetworkLayer>,
}

impl QueryRunner {
    pub fn new(store: Arc<StoreData>, network: Arc<dyn NetworkLayer>) -> Self {
        Self { store, network }
    }

    /// Whether the store can answer the query completely
    pub fn is_satisfied(&self, request: &QueryRequest) -> Result<bool, StoreError> {
        let read = self.store.read(|records| {
            read_root_query(records, &request.query, &request.variables, ReadOptions::strict())
        });
        match read {
            Ok(_) => Ok(true),
            Err(error) if error.is_missing_data() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Fetch whatever the store is missing for `requests`
    pub async fn run(&self, requests: Vec<QueryRequest>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut missing = Vec::new();
        for request in requests {
            match self.is_satisfied(&request) {
                Ok(true) => summary.cached.push(request.name().to_string()),
                Ok(false) => missing.push(request),
                Err(error) => summary.failed.push(QueryFailure {
                    query: request.name().to_string(),
                    error: error.into(),
                }),
            }
        }
        tracing::debug!(
            "Running queries: {} cached, {} to fetch",
            summary.cached.len(),
            missing.len()
        );
        self.fetch(missing, &mut summary).await;
        summary
    }

    /// Fetch every request regardless of what the store holds
    pub async fn force_fetch(&self, requests: Vec<QueryRequest>) -> RunSummary {
        let mut summary = RunSummary::default();
        self.fetch(requests, &mut summary).await;
        summary
    }

    async fn fetch(&self, requests: Vec<QueryRequest>, summary: &mut RunSummary) {
        if requests.is_empty() {
            return;
        }

        if requests.len() > 1 && self.network.supports(&[BATCH_CAPABILITY]) {
            let mut responses = self.network.send_queries(requests.clone()).await.into_iter();
            if responses.len() != requests.len() {
                tracing::warn!(
                    "Batched transport answered {} of {} queries",
                    responses.len(),
                    requests.len()
                );
            }
            for request in &requests {
                // Queries the transport never answered count as cancelled
                let response = responses.next().unwrap_or(Err(NetworkError::Cancelled));
                self.complete(request, response, summary);
            }
        } else {
            let mut pending: FuturesUnordered<_> = requests
                .into_iter()
                .map(|request| {
                    let network = self.network.clone();
                    async move {
                        let response = network.send_query(request.clone()).await;
                        (request, response)
                    }
                })
                .collect();
            while let Some((request, response)) = pending.next().await {
                self.complete(&request, response, summary);
            }
        }

        tracing::info!(
            "Query run finished: {} fetched, {} failed",
            summary.fetched.len(),
            summary.failed.len()
        );
    }

    fn complete(
        &self,
        request: &QueryRequest,
        response: Result<Value, NetworkError>,
        summary: &mut RunSummary,
    ) {
        let name = request.name().to_string();
        let written = response.map_err(QueryError::from).and_then(|payload| {
            self.store
                .handle_query_payload(&request.query, &request.variables, &payload)
                .map_err(QueryError::from)
        });
        match written {
            Ok(_) => summary.fetched.push(name),
            Err(error) => {
                tracing::warn!("Query '{}' failed: {}", name, error);
                summary.failed.push(QueryFailure { query: name, error });
            }
        }
    }

    /// Refetch a pointer's fragment for each of its records
    pub async fn refetch(&self, pointer: &FragmentPointer) -> RunSummary {
        let mut requests = Vec::new();
        let mut summary = RunSummary::default();
        for data_id in pointer.data_ids() {
            match self.refetch_request(pointer, &data_id) {
                Ok(request) => requests.push(request),
                Err(error) => summary.failed.push(QueryFailure {
                    query: data_id,
                    error: error.into(),
                }),
            }
        }
        self.fetch(requests, &mut summary).await;
        summary
    }

    fn refetch_request(
        &self,
        pointer: &FragmentPointer,
        data_id: &str,
    ) -> Result<QueryRequest, StoreError> {
        let path = match self.store.read(|records| records.path(data_id).cloned()) {
            Some(path) => path,
            None if !is_client_id(data_id) => QueryPath::for_node(data_id),
            None => return Err(StoreError::unknown_record(data_id)),
        };
        let fragment = pointer.fragment();
        let (query, mut variables) = path.refetch_query(
            &format!("{}Refetch", fragment.name),
            vec![Selection::Fragment(fragment.clone())],
        )?;
        for (name, value) in pointer.variables() {
            variables.entry(name.clone()).or_insert_with(|| value.clone());
        }
        tracing::debug!(
            "Refetching '{}' for '{}' through a path of depth {}",
            fragment.name,
            data_id,
            path.depth()
        );
        Ok(QueryRequest::new(query, variables))
    }
}
