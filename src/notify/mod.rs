//! Outbound notifications
//!
//! This module defines the server events sent to clients and the notifier
//! that delivers them live through the hub or by push fallback.

pub mod events;
pub mod notifier;
pub mod push;

// Re-export commonly used types
pub use events::{RequestSummary, ServerEvent};
pub use notifier::{Delivery, Notifier};
pub use push::{LoggingPushNotifier, MockPushNotifier, PushNotifier, SentPush};
