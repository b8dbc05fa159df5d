//! Persistence for service requests and worker availability
//!
//! This module defines the store interface the lifecycle manager and sweeper
//! depend on, plus an in-memory implementation.

pub mod memory;
pub mod request_store;

// Re-export commonly used types
pub use memory::InMemoryRequestStore;
pub use request_store::{RequestStore, StatusUpdate};

#[cfg(test)]
pub use request_store::MockRequestStore;
