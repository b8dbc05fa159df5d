//! Service Dispatch - realtime dispatch of service requests
//!
//! This crate connects customers and service workers over websockets,
//! fans new requests out to nearby eligible workers, arbitrates concurrent
//! accepts, expires unanswered requests and falls back to push
//! notifications for users that are offline.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod hub;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{DispatchError, Result};
pub use types::*;

// Re-export key components
pub use dispatch::{MessageDispatcher, RequestFanOut};
pub use geo::{RadiusMatcher, WorkerMatcher};
pub use hub::ConnectionHub;
pub use lifecycle::{RequestLifecycleManager, RequestStatus};
pub use notify::{Notifier, PushNotifier, ServerEvent};
pub use store::{InMemoryRequestStore, RequestStore};
pub use sweeper::ExpirySweeper;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
