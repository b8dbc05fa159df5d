//! Utility functions for the dispatch service

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Generate a new unique request ID
pub fn generate_request_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique connection ID
pub fn generate_connection_id() -> Uuid {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Canonical form of a service category for comparisons
pub fn normalize_category(category: &str) -> String {
    category.trim().to_lowercase()
}

/// Check whether two category labels name the same category
pub fn categories_match(a: &str, b: &str) -> bool {
    normalize_category(a) == normalize_category(b)
}

/// Convert a configured number of seconds, saturating instead of overflowing
pub fn seconds_to_duration(seconds: u64) -> Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}
