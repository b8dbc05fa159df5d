//! Error types for the dispatch service
//!
//! Domain failures are expressed as [`DispatchError`] and carried through the
//! crate inside `anyhow::Error`, so callers that need to react to a specific
//! class (a lost accept race, a bad coordinate) can recover it with
//! [`DispatchError::classify`].

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific dispatch scenarios
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Request {request_id} is no longer available: {reason}")]
    StateConflict { request_id: String, reason: String },

    #[error("Request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("Worker not found: {worker_id}")]
    WorkerNotFound { worker_id: String },

    #[error("Not permitted: {reason}")]
    Forbidden { reason: String },

    #[error("Persistence unavailable: {message}")]
    PersistenceUnavailable { message: String },

    #[error("Delivery to {user_id} failed: {reason}")]
    Delivery { user_id: String, reason: String },

    #[error("Push fallback failed for {user_id}: {reason}")]
    Fallback { user_id: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal service error: {message}")]
    Internal { message: String },
}

impl DispatchError {
    /// Shorthand for a validation failure
    pub fn validation(reason: impl Into<String>) -> Self {
        DispatchError::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a poisoned or unavailable lock
    pub fn lock_poisoned(what: &str) -> Self {
        DispatchError::Internal {
            message: format!("Failed to acquire {} lock", what),
        }
    }

    /// Recover the domain error from an `anyhow::Error`, if it carries one
    pub fn classify(error: &anyhow::Error) -> Option<&DispatchError> {
        error.downcast_ref::<DispatchError>()
    }

    /// Machine-readable code sent to clients in `error` events
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Validation { .. } => "validation_error",
            DispatchError::StateConflict { .. } => "no_longer_available",
            DispatchError::RequestNotFound { .. } => "request_not_found",
            DispatchError::WorkerNotFound { .. } => "worker_not_found",
            DispatchError::Forbidden { .. } => "forbidden",
            DispatchError::PersistenceUnavailable { .. } => "persistence_unavailable",
            DispatchError::Delivery { .. } => "delivery_failure",
            DispatchError::Fallback { .. } => "fallback_failure",
            DispatchError::Configuration { .. } => "configuration_error",
            DispatchError::Internal { .. } => "internal_error",
        }
    }
}
