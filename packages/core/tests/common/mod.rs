//! Shared helpers for integration tests
//!
//! `mock_network` returns a network layer whose requests are handed to the
//! test over an mpsc channel; the test answers each one through its oneshot
//! reply, so it decides exactly when and how every request completes.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use nodespace_sync::models::{Call, Field, Fragment, RootQuery, Selection};
use nodespace_sync::network::{MutationRequest, NetworkError, NetworkLayer, QueryRequest};
use nodespace_sync::operations::{Mutation, MutationConfig};
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use tokio::sync::{mpsc, oneshot};

static TRACING: Once = Once::new();

/// Install a test subscriber once; filter with `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub type Reply = oneshot::Sender<Result<Value, NetworkError>>;

pub struct PendingQuery {
    pub request: QueryRequest,
    reply: Reply,
}

impl PendingQuery {
    pub fn resolve(self, payload: Value) {
        let _ = self.reply.send(Ok(payload));
    }

    pub fn reject(self, error: NetworkError) {
        let _ = self.reply.send(Err(error));
    }
}

pub struct PendingMutation {
    pub request: MutationRequest,
    reply: Reply,
}

impl PendingMutation {
    pub fn resolve(self, payload: Value) {
        let _ = self.reply.send(Ok(payload));
    }

    pub fn reject(self, error: NetworkError) {
        let _ = self.reply.send(Err(error));
    }
}

enum PendingRequest {
    Query(PendingQuery),
    Mutation(PendingMutation),
}

pub struct MockNetwork {
    requests: mpsc::UnboundedSender<PendingRequest>,
    batch: bool,
}

#[async_trait]
impl NetworkLayer for MockNetwork {
    async fn send_query(&self, request: QueryRequest) -> Result<Value, NetworkError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(PendingRequest::Query(PendingQuery { request, reply }))
            .map_err(|_| NetworkError::Cancelled)?;
        response.await.map_err(|_| NetworkError::Cancelled)?
    }

    async fn send_mutation(&self, request: MutationRequest) -> Result<Value, NetworkError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(PendingRequest::Mutation(PendingMutation { request, reply }))
            .map_err(|_| NetworkError::Cancelled)?;
        response.await.map_err(|_| NetworkError::Cancelled)?
    }

    fn supports(&self, capabilities: &[&str]) -> bool {
        capabilities.iter().all(|capability| self.batch && *capability == "batch")
    }
}

/// Test side of a [`MockNetwork`]
pub struct NetworkHandle {
    requests: mpsc::UnboundedReceiver<PendingRequest>,
}

impl NetworkHandle {
    pub async fn next_query(&mut self) -> Result<PendingQuery> {
        match self.requests.recv().await {
            Some(PendingRequest::Query(query)) => Ok(query),
            Some(PendingRequest::Mutation(mutation)) => Err(anyhow!(
                "expected a query, got mutation '{}'",
                mutation.request.client_mutation_id
            )),
            None => Err(anyhow!("network dropped")),
        }
    }

    pub async fn next_mutation(&mut self) -> Result<PendingMutation> {
        match self.requests.recv().await {
            Some(PendingRequest::Mutation(mutation)) => Ok(mutation),
            Some(PendingRequest::Query(query)) => {
                Err(anyhow!("expected a mutation, got query '{}'", query.request.name()))
            }
            None => Err(anyhow!("network dropped")),
        }
    }
}

pub fn mock_network(batch: bool) -> (Arc<MockNetwork>, NetworkHandle) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        Arc::new(MockNetwork {
            requests: sender,
            batch,
        }),
        NetworkHandle { requests: receiver },
    )
}

/// Let spawned tasks run until they are all waiting again
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn scalar(name: &str) -> Selection {
    Selection::Field(Field::scalar(name))
}

pub fn linked(name: &str, selections: Vec<Selection>) -> Selection {
    Selection::Field(Field::linked(name, selections))
}

/// `node(id: <id>) { id name address { city } bestFriend { name } }`
pub fn user_query(id: &str) -> Result<Arc<RootQuery>> {
    Ok(RootQuery::new(
        "UserQuery",
        Field::linked("node", user_selections()).with_call(Call::literal("id", json!(id))),
    )?)
}

pub fn user_selections() -> Vec<Selection> {
    vec![
        scalar("id"),
        scalar("name"),
        linked("address", vec![scalar("city")]),
        linked("bestFriend", vec![scalar("name")]),
    ]
}

pub fn user_fragment() -> Result<Arc<Fragment>> {
    Ok(Fragment::new("UserFragment", "User", user_selections())?)
}

pub fn users_fragment() -> Result<Arc<Fragment>> {
    Ok(Fragment::new_plural("UsersFragment", "User", user_selections())?)
}

pub fn user_payload(id: &str, name: &str) -> Value {
    json!({
        "node": {
            "id": id,
            "name": name,
            "address": {"city": "Lisbon"},
            "bestFriend": {"name": "Grace"}
        }
    })
}

/// Renames a user; optimistic by default
pub struct RenameUser {
    pub user_id: String,
    pub name: String,
    pub collision_key: Option<String>,
}

impl RenameUser {
    pub fn new(user_id: &str, name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: name.to_string(),
            collision_key: None,
        }
    }

    pub fn keyed(mut self, key: &str) -> Self {
        self.collision_key = Some(key.to_string());
        self
    }
}

impl Mutation for RenameUser {
    fn mutation_name(&self) -> &str {
        "renameUser"
    }

    fn fat_query(&self) -> Field {
        Field::linked("renameUser", vec![linked("user", vec![scalar("id"), scalar("name")])])
    }

    fn configs(&self) -> Vec<MutationConfig> {
        vec![MutationConfig::fields_change("user", self.user_id.clone())]
    }

    fn variables(&self) -> Value {
        json!({"id": self.user_id, "name": self.name})
    }

    fn optimistic_response(&self) -> Option<Value> {
        Some(json!({"user": {"id": self.user_id, "name": self.name}}))
    }

    fn collision_key(&self) -> Option<String> {
        self.collision_key.clone()
    }
}

pub fn rename_response(user_id: &str, name: &str) -> Value {
    json!({"user": {"id": user_id, "name": name}, "clientMutationId": "ignored"})
}
