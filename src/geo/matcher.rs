//! Worker matching for new service requests
//!
//! The matcher filters a snapshot of worker states down to the workers that
//! should receive a request's fan-out. There is no ranking: every eligible
//! worker is notified at once and the first accept wins.

use crate::config::MatchingSettings;
use crate::error::{DispatchError, Result};
use crate::geo::distance::{eta_minutes, haversine_km};
use crate::types::{GeoPoint, UserId, WorkerAvailability};
use crate::utils::{categories_match, normalize_category, seconds_to_duration};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for worker matching behavior
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Radius used when the request does not specify one
    pub default_radius_km: f64,
    /// Upper bound for any requested radius
    pub max_radius_km: f64,
    /// Maximum age of a worker's location fix
    pub location_freshness: Duration,
    /// Assumed average travel speed for ETA estimates
    pub average_speed_kmh: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self::from(&MatchingSettings::default())
    }
}

impl From<&MatchingSettings> for MatchingConfig {
    fn from(settings: &MatchingSettings) -> Self {
        Self {
            default_radius_km: settings.default_radius_km,
            max_radius_km: settings.max_radius_km,
            location_freshness: seconds_to_duration(settings.location_freshness_seconds),
            average_speed_kmh: settings.average_speed_kmh,
        }
    }
}

impl MatchingConfig {
    /// Apply the default radius and reject values outside (0, max]
    pub fn resolve_radius(&self, requested: Option<f64>) -> Result<f64> {
        let radius = requested.unwrap_or(self.default_radius_km);
        if !radius.is_finite() || radius <= 0.0 || radius > self.max_radius_km {
            return Err(DispatchError::validation(format!(
                "radius {} km outside (0, {}]",
                radius, self.max_radius_km
            ))
            .into());
        }
        Ok(radius)
    }
}

/// A validated matching query
#[derive(Debug, Clone, PartialEq)]
pub struct MatchQuery {
    pub location: GeoPoint,
    /// Normalized (trimmed, lowercased) category
    pub category: String,
    pub radius_km: f64,
}

impl MatchQuery {
    /// Validate raw request inputs against the matching configuration
    pub fn new(
        location: GeoPoint,
        category: &str,
        radius_km: Option<f64>,
        config: &MatchingConfig,
    ) -> Result<Self> {
        location.validate()?;

        let category = normalize_category(category);
        if category.is_empty() {
            return Err(DispatchError::validation("category must not be empty").into());
        }

        let radius_km = config.resolve_radius(radius_km)?;

        Ok(Self {
            location,
            category,
            radius_km,
        })
    }
}

/// A worker selected for fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedWorker {
    pub worker_id: UserId,
    pub distance_km: f64,
    pub eta_minutes: f64,
}

/// Trait for worker matching algorithms
pub trait WorkerMatcher: Send + Sync {
    /// Select every eligible worker from a snapshot, ordered by worker id
    fn find_eligible_workers(
        &self,
        query: &MatchQuery,
        workers: &[WorkerAvailability],
        now: DateTime<Utc>,
    ) -> Vec<MatchedWorker>;

    /// Distance to the worker if it is eligible for the query
    fn eligible_distance(
        &self,
        query: &MatchQuery,
        worker: &WorkerAvailability,
        now: DateTime<Utc>,
    ) -> Option<f64>;
}

/// Radius-based matcher implementation
///
/// A worker is eligible when all of the following hold:
/// - same category (case-insensitive, trimmed)
/// - marked available and without an active assignment
/// - has a location fix no older than the freshness window
/// - haversine distance within the query radius
#[derive(Debug, Clone, Default)]
pub struct RadiusMatcher {
    config: MatchingConfig,
}

impl RadiusMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    fn has_fresh_fix(&self, worker: &WorkerAvailability, now: DateTime<Utc>) -> Option<GeoPoint> {
        let location = worker.location?;
        let fixed_at = worker.location_updated_at?;
        if now.signed_duration_since(fixed_at) > self.config.location_freshness {
            return None;
        }
        Some(location)
    }
}

impl WorkerMatcher for RadiusMatcher {
    fn find_eligible_workers(
        &self,
        query: &MatchQuery,
        workers: &[WorkerAvailability],
        now: DateTime<Utc>,
    ) -> Vec<MatchedWorker> {
        let mut matched: Vec<MatchedWorker> = workers
            .iter()
            .filter_map(|worker| {
                self.eligible_distance(query, worker, now)
                    .map(|distance_km| MatchedWorker {
                        worker_id: worker.worker_id.clone(),
                        distance_km,
                        eta_minutes: eta_minutes(distance_km, self.config.average_speed_kmh),
                    })
            })
            .collect();

        matched.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        matched.dedup_by(|a, b| a.worker_id == b.worker_id);
        matched
    }

    fn eligible_distance(
        &self,
        query: &MatchQuery,
        worker: &WorkerAvailability,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if !worker.is_available || worker.has_active_assignment() {
            return None;
        }
        if !categories_match(&worker.category, &query.category) {
            return None;
        }

        let location = self.has_fresh_fix(worker, now)?;
        let distance = haversine_km(query.location, location);
        (distance <= query.radius_km).then_some(distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn create_test_worker(id: &str, category: &str, location: GeoPoint) -> WorkerAvailability {
        WorkerAvailability {
            worker_id: id.to_string(),
            category: category.to_string(),
            location: Some(location),
            location_updated_at: Some(Utc::now()),
            is_available: true,
            active_request_id: None,
        }
    }

    /// Point roughly `km` kilometres north of `origin`
    fn north_of(origin: GeoPoint, km: f64) -> GeoPoint {
        GeoPoint::new(origin.lat + km / 111.19, origin.lng)
    }

    fn customer() -> GeoPoint {
        GeoPoint::new(18.10, -15.95)
    }

    #[test]
    fn test_only_nearby_worker_matches() {
        let matcher = RadiusMatcher::default();
        let query =
            MatchQuery::new(customer(), "Plomberie", Some(10.0), matcher.config()).unwrap();

        let workers = vec![
            create_test_worker("w1", "Plomberie", north_of(customer(), 5.0)),
            create_test_worker("w2", "Plomberie", north_of(customer(), 20.0)),
        ];

        let matched = matcher.find_eligible_workers(&query, &workers, Utc::now());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].worker_id, "w1");
        assert!((matched[0].distance_km - 5.0).abs() < 0.05);
        assert!((matched[0].eta_minutes - 10.0).abs() < 0.1);
    }

    #[test]
    fn test_category_is_case_insensitive() {
        let matcher = RadiusMatcher::default();
        let query = MatchQuery::new(customer(), "  plomberie ", None, matcher.config()).unwrap();
        let workers = vec![create_test_worker("w1", "PLOMBERIE", customer())];

        assert_eq!(
            matcher
                .find_eligible_workers(&query, &workers, Utc::now())
                .len(),
            1
        );
    }

    #[test]
    fn test_ineligible_workers_filtered() {
        let matcher = RadiusMatcher::default();
        let query = MatchQuery::new(customer(), "Plomberie", None, matcher.config()).unwrap();
        let now = Utc::now();

        let mut unavailable = create_test_worker("a", "Plomberie", customer());
        unavailable.is_available = false;

        let mut busy = create_test_worker("b", "Plomberie", customer());
        busy.active_request_id = Some(Uuid::new_v4());

        let mut no_fix = create_test_worker("c", "Plomberie", customer());
        no_fix.location = None;

        let mut stale = create_test_worker("d", "Plomberie", customer());
        stale.location_updated_at = Some(now - Duration::minutes(16));

        let other_trade = create_test_worker("e", "Menuiserie", customer());
        let eligible = create_test_worker("f", "Plomberie", customer());

        let workers = vec![unavailable, busy, no_fix, stale, other_trade, eligible];
        let matched = matcher.find_eligible_workers(&query, &workers, now);

        let ids: Vec<&str> = matched.iter().map(|m| m.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["f"]);
    }

    #[test]
    fn test_output_ordered_by_worker_id() {
        let matcher = RadiusMatcher::default();
        let query = MatchQuery::new(customer(), "Plomberie", None, matcher.config()).unwrap();
        let workers = vec![
            create_test_worker("w3", "Plomberie", customer()),
            create_test_worker("w1", "Plomberie", north_of(customer(), 2.0)),
            create_test_worker("w2", "Plomberie", north_of(customer(), 1.0)),
        ];

        let matched = matcher.find_eligible_workers(&query, &workers, Utc::now());
        let ids: Vec<&str> = matched.iter().map(|m| m.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_query_validation() {
        let config = MatchingConfig::default();

        assert!(MatchQuery::new(GeoPoint::new(91.0, 0.0), "Plomberie", None, &config).is_err());
        assert!(MatchQuery::new(customer(), "   ", None, &config).is_err());
        assert!(MatchQuery::new(customer(), "Plomberie", Some(0.0), &config).is_err());
        assert!(MatchQuery::new(customer(), "Plomberie", Some(51.0), &config).is_err());

        let query = MatchQuery::new(customer(), "Plomberie", None, &config).unwrap();
        assert_eq!(query.radius_km, 10.0);
        assert_eq!(query.category, "plomberie");
    }

    #[test]
    fn test_validation_error_is_classified() {
        let config = MatchingConfig::default();
        let err = MatchQuery::new(customer(), "", None, &config).unwrap_err();
        assert!(matches!(
            DispatchError::classify(&err),
            Some(DispatchError::Validation { .. })
        ));
    }
}
