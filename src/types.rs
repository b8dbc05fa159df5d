//! Common types used throughout the dispatch service

use crate::error::{DispatchError, Result};
use crate::lifecycle::RequestStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for customers and workers
pub type UserId = String;

/// Unique identifier for service requests
pub type RequestId = Uuid;

/// Identifier of a chat room / session
pub type RoomId = String;

/// Kind of authenticated principal behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    Customer,
    Worker,
}

impl std::fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalKind::Customer => write!(f, "customer"),
            PrincipalKind::Worker => write!(f, "worker"),
        }
    }
}

/// An authenticated participant, resolved before the hub admits a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub kind: PrincipalKind,
}

impl Principal {
    pub fn customer(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: PrincipalKind::Customer,
        }
    }

    pub fn worker(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: PrincipalKind::Worker,
        }
    }
}

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Reject non-finite or out-of-range coordinates
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(DispatchError::validation(format!(
                "latitude {} outside [-90, 90]",
                self.lat
            ))
            .into());
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(DispatchError::validation(format!(
                "longitude {} outside [-180, 180]",
                self.lng
            ))
            .into());
        }
        Ok(())
    }
}

/// How soon the customer needs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Urgent,
    #[default]
    Standard,
    Scheduled,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Urgent => write!(f, "urgent"),
            Urgency::Standard => write!(f, "standard"),
            Urgency::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Payload of a customer's `service_request` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServiceRequest {
    pub category: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub radius_km: Option<f64>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewServiceRequest {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

/// A service request as persisted by the request store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: RequestId,
    pub customer_id: UserId,
    pub category: String,
    pub location: GeoPoint,
    pub radius_km: f64,
    pub urgency: Urgency,
    pub description: Option<String>,
    pub status: RequestStatus,
    /// Deadline for acceptance while broadcast
    pub expires_at: Option<DateTime<Utc>>,
    /// Promotion time for scheduled requests
    pub scheduled_for: Option<DateTime<Utc>>,
    pub assigned_worker_id: Option<UserId>,
    /// Workers that received the fan-out
    pub notified_workers: Vec<UserId>,
    /// Workers that explicitly declined
    pub declined_workers: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ServiceRequest {
    /// Workers that were notified and have not declined
    pub fn pending_workers(&self) -> Vec<UserId> {
        self.notified_workers
            .iter()
            .filter(|w| !self.declined_workers.contains(w))
            .cloned()
            .collect()
    }
}

/// Read-only projection of a worker used by the geo matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAvailability {
    pub worker_id: UserId,
    pub category: String,
    pub location: Option<GeoPoint>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub is_available: bool,
    pub active_request_id: Option<RequestId>,
}

impl WorkerAvailability {
    pub fn has_active_assignment(&self) -> bool {
        self.active_request_id.is_some()
    }
}

/// Payload of a worker's `worker_availability` message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailabilityUpdate {
    #[serde(default)]
    pub is_available: Option<bool>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(18.10, -15.95).validate().is_ok());
        assert!(GeoPoint::new(90.0, 180.0).validate().is_ok());
        assert!(GeoPoint::new(90.1, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, -180.5).validate().is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn test_new_request_defaults() {
        let raw = r#"{"category":"Plomberie","lat":18.1,"lng":-15.95}"#;
        let draft: NewServiceRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(draft.urgency, Urgency::Standard);
        assert!(draft.radius_km.is_none());
        assert_eq!(draft.location(), GeoPoint::new(18.1, -15.95));
    }

    #[test]
    fn test_principal_kind_wire_format() {
        let json = serde_json::to_string(&PrincipalKind::Worker).unwrap();
        assert_eq!(json, "\"worker\"");
    }
}
