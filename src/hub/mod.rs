//! Connection hub
//!
//! This module contains the registry of live connections and rooms, the
//! per-connection reader/writer tasks, and the websocket endpoint that admits
//! authenticated clients.

pub mod connection;
pub mod endpoint;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use connection::{encode_frame, Connection, Frame, SendOutcome};
pub use endpoint::{router, RealtimeServer, RealtimeServerConfig, RealtimeState};
pub use registry::{ConnectionHub, HubStats};
pub use session::serve_socket;
