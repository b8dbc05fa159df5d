//! Inbound message dispatch
//!
//! This module decodes client envelopes, routes them by kind, and fans new
//! requests out to eligible workers.

pub mod dispatcher;
pub mod fanout;
pub mod messages;

// Re-export commonly used types
pub use dispatcher::MessageDispatcher;
pub use fanout::{FanOutReport, RequestFanOut};
pub use messages::{InboundEnvelope, MessageKind, RelayEnvelope, RequestRef};
