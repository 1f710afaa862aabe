//! Mutation Operations
//!
//! Mutations, their optimistic writes, and the transaction queue that sends
//! them to the network layer.

pub mod error;
pub mod mutation;
pub mod mutation_queue;
pub mod optimistic;
pub mod transaction;

pub use error::MutationError;
pub use mutation::{write_mutation_payload, Mutation, MutationConfig};
pub use mutation_queue::MutationQueue;
pub use optimistic::infer_optimistic_query;
pub use transaction::{
    FailureCallback, MutationTransaction, PreventAutoRollback, SuccessCallback,
    TransactionCallbacks, TransactionStatus,
};
