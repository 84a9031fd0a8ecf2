//! Storage provider implementations.
//!
//! This module contains implementations of the collaborator traits in
//! [`crate::client`]. Cloud bindings live outside this crate.

pub mod memory;

pub use memory::{
    InMemoryDelayedStore, InMemoryLeaseClient, InMemoryQueueClient, InMemoryQueueService,
    QueueCallCounts,
};
