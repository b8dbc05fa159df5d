//! Service layer for the dispatch service
//!
//! This module contains the main application state, service coordination,
//! and background task management for the production service.

pub mod app;
pub mod health;

pub use app::{AppState, Collaborators, ServiceError};
pub use health::{HealthCheck, HealthStatus};
