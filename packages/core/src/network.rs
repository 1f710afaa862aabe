//! Network Layer Contract
//!
//! The transport that actually talks to the server lives outside this crate.
//! The store only needs a way to send root queries and mutations and to get
//! back either a payload or an error, eventually. Timeouts and retries of the
//! transport itself are the implementation's concern.

use crate::models::{ClientMutationId, Field, RootQuery, Variables};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Capability name for transports that accept several queries in one request
pub const BATCH_CAPABILITY: &str = "batch";

/// Network failures as reported by the transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// The request never produced a response
    #[error("Request failed: {0}")]
    Request(String),

    /// The server answered with errors
    #[error("Server error: {message}")]
    Server {
        message: String,
        source_errors: Vec<Value>,
    },

    /// The transport dropped the request
    #[error("Request cancelled")]
    Cancelled,
}

impl NetworkError {
    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }

    pub fn server(message: impl Into<String>, source_errors: Vec<Value>) -> Self {
        Self::Server {
            message: message.into(),
            source_errors,
        }
    }
}

/// One root query to fetch
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: Arc<RootQuery>,
    pub variables: Variables,
}

impl QueryRequest {
    pub fn new(query: Arc<RootQuery>, variables: Variables) -> Self {
        Self { query, variables }
    }

    pub fn name(&self) -> &str {
        &self.query.name
    }
}

/// One mutation to send
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub mutation_name: String,
    pub client_mutation_id: ClientMutationId,
    /// Input variables, including `clientMutationId`
    pub input: Value,
    /// Fields of the mutation payload the client wants back
    pub query: Field,
}

#[async_trait]
pub trait NetworkLayer: Send + Sync {
    /// Fetch one root query; resolves to the response data
    async fn send_query(&self, request: QueryRequest) -> Result<Value, NetworkError>;

    /// Fetch several root queries; one result per request, in order
    async fn send_queries(&self, requests: Vec<QueryRequest>) -> Vec<Result<Value, NetworkError>> {
        futures::future::join_all(requests.into_iter().map(|request| self.send_query(request)))
            .await
    }

    /// Send a mutation; resolves to the mutation payload
    async fn send_mutation(&self, request: MutationRequest) -> Result<Value, NetworkError>;

    /// Whether the transport has every named capability
    fn supports(&self, capabilities: &[&str]) -> bool {
        capabilities.is_empty()
    }
}
