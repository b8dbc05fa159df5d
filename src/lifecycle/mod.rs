//! Service request lifecycle
//!
//! This module contains the request state machine: the status enum with its
//! transition table, and the manager that applies transitions through the
//! store's compare-and-swap.

pub mod manager;
pub mod state;

// Re-export commonly used types
pub use manager::{ExpiryOutcome, LifecycleConfig, RequestLifecycleManager};
pub use state::RequestStatus;
