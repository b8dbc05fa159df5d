//! Persistence interface for service requests and worker snapshots
//!
//! The lifecycle manager never mutates a request's status except through
//! [`RequestStore::cas_update_request_status`], which must compare and swap
//! the persisted status in one atomic operation.

use crate::error::Result;
use crate::lifecycle::RequestStatus;
use crate::types::{GeoPoint, RequestId, ServiceRequest, UserId, WorkerAvailability};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Fields written together with a status change
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// When the transition happened; stored in the timestamp matching the new status
    pub at: DateTime<Utc>,
    /// Set only by the accept transition
    pub assigned_worker_id: Option<UserId>,
    /// New acceptance deadline, set when entering broadcast
    pub expires_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            assigned_worker_id: None,
            expires_at: None,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<UserId>) -> Self {
        self.assigned_worker_id = Some(worker_id.into());
        self
    }

    pub fn with_deadline(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Apply the update to a request whose status already matched
    pub fn apply(&self, request: &mut ServiceRequest, new_status: RequestStatus) {
        request.status = new_status;
        if let Some(worker_id) = &self.assigned_worker_id {
            request.assigned_worker_id = Some(worker_id.clone());
        }
        if let Some(expires_at) = self.expires_at {
            request.expires_at = Some(expires_at);
        }
        match new_status {
            RequestStatus::Accepted => request.accepted_at = Some(self.at),
            RequestStatus::InProgress => request.started_at = Some(self.at),
            RequestStatus::Completed => request.completed_at = Some(self.at),
            RequestStatus::Cancelled => request.cancelled_at = Some(self.at),
            RequestStatus::Scheduled | RequestStatus::Broadcast | RequestStatus::Expired => {}
        }
    }
}

/// Trait for request and worker persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Get a request by id
    async fn load_request(&self, request_id: RequestId) -> Result<Option<ServiceRequest>>;

    /// Persist a newly created request
    async fn insert_request(&self, request: ServiceRequest) -> Result<()>;

    /// Atomically move a request from `expected` to `new_status`
    ///
    /// Returns the updated request, or `None` when the persisted status no
    /// longer equals `expected` (the CAS lost).
    async fn cas_update_request_status(
        &self,
        request_id: RequestId,
        expected: RequestStatus,
        new_status: RequestStatus,
        update: StatusUpdate,
    ) -> Result<Option<ServiceRequest>>;

    /// Candidate workers for a category near a location
    ///
    /// Implementations may prefilter on location and radius; the geo matcher
    /// applies the exact eligibility rules afterwards.
    async fn find_eligible_workers(
        &self,
        category: &str,
        location: GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<WorkerAvailability>>;

    /// Claim (`Some`) or release (`None`) a worker's active assignment
    ///
    /// A claim succeeds only if the worker holds no active request and
    /// returns `false` otherwise, so a successful claim is always fresh.
    async fn mark_worker_assignment(
        &self,
        worker_id: &str,
        request_id: Option<RequestId>,
    ) -> Result<bool>;

    /// Broadcast requests whose deadline is at or before `now`
    async fn find_expired_broadcasts(&self, now: DateTime<Utc>) -> Result<Vec<ServiceRequest>>;

    /// Scheduled requests whose start time is at or before `now`
    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<ServiceRequest>>;

    /// Get a worker snapshot by id
    async fn load_worker(&self, worker_id: &str) -> Result<Option<WorkerAvailability>>;

    /// Insert or replace a worker snapshot, keeping any active assignment
    async fn upsert_worker(&self, worker: WorkerAvailability) -> Result<()>;

    /// Append workers to a request's notified set
    async fn record_fan_out(&self, request_id: RequestId, worker_ids: Vec<UserId>) -> Result<()>;

    /// Add a worker to a request's declined set
    async fn record_decline(&self, request_id: RequestId, worker_id: &str) -> Result<()>;

    /// Number of stored requests, for health and stats reporting
    async fn request_count(&self) -> Result<usize>;
}
