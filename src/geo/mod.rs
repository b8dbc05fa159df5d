//! Geospatial matching of service requests to nearby workers
//!
//! This module provides the haversine distance primitives and the matcher
//! that selects eligible workers for a request's fan-out.

pub mod distance;
pub mod matcher;

// Re-export commonly used types
pub use distance::{eta_minutes, haversine_km, EARTH_RADIUS_KM};
pub use matcher::{MatchQuery, MatchedWorker, MatchingConfig, RadiusMatcher, WorkerMatcher};
