//! NodeSpace Sync Client Data Layer
//!
//! This crate keeps a normalized client-side graph of server records and the
//! machinery around it: reading query data out of the graph, caching resolved
//! fragments with stable identity, collecting unreferenced records, fetching
//! missing queries and sending mutations through an optimistic transaction
//! queue.
//!
//! # Architecture
//!
//! - **Arena of records**: records reference each other by id only; every
//!   edge is a lookup into the store
//! - **Batched change events**: one broadcast per logical update, delivered to
//!   id-keyed listeners and a tokio broadcast stream
//! - **Optimistic overlay**: per transaction write logs on top of the
//!   authoritative records, removed field by field on rollback
//! - **Explicit context**: an [`Environment`] owns one store instance; nothing
//!   is global
//!
//! # Modules
//!
//! - [`models`] - Records, the query tree, fragment pointers, query paths, ranges
//! - [`db`] - Record store, change emitter, payload writer, garbage collector
//! - [`services`] - Query reader, query resolver, query runner
//! - [`operations`] - Mutations and the transaction queue
//! - [`network`] - Network layer seam
//! - [`config`] - Store configuration

pub mod config;
pub mod db;
pub mod environment;
pub mod models;
pub mod network;
pub mod operations;
pub mod services;

// Re-export commonly used types
pub use config::{ConfigError, GcConfig, StoreConfig};
pub use db::{StoreData, StoreError};
pub use environment::Environment;
pub use models::*;
pub use network::{MutationRequest, NetworkError, NetworkLayer, QueryRequest};
pub use operations::{
    Mutation, MutationConfig, MutationError, MutationQueue, MutationTransaction,
    PreventAutoRollback, TransactionCallbacks, TransactionStatus,
};
pub use services::{QueryError, QueryResolver, QueryRunner, ReadOptions, ReadResult, Resolved, RunSummary};
