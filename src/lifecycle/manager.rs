//! Request lifecycle manager
//!
//! Owns every status change of a service request. Each transition is checked
//! against the transition table, then written through the store's
//! compare-and-swap so no two callers can both win the same transition.
//! Accept additionally claims the worker first, so a worker never holds two
//! active requests.

use crate::error::{DispatchError, Result};
use crate::geo::{eta_minutes, haversine_km, MatchQuery, MatchingConfig};
use crate::lifecycle::state::RequestStatus;
use crate::metrics::MetricsCollector;
use crate::notify::{Notifier, RequestSummary, ServerEvent};
use crate::store::{RequestStore, StatusUpdate};
use crate::types::{
    AvailabilityUpdate, GeoPoint, NewServiceRequest, Principal, PrincipalKind, RequestId,
    ServiceRequest, Urgency, UserId, WorkerAvailability,
};
use crate::utils::{categories_match, generate_request_id};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts made by cancel when the status changes underneath it
const CANCEL_ATTEMPTS: usize = 3;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a broadcast request stays open for acceptance
    pub broadcast_deadline: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            broadcast_deadline: Duration::minutes(3),
        }
    }
}

/// Result of an expiry attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExpiryOutcome {
    /// The request moved to `expired`
    Expired(ServiceRequest),
    /// The request left `broadcast` before the CAS (usually a late accept)
    Raced,
    /// The deadline has not passed yet
    NotDue,
}

fn conflict(request_id: RequestId, reason: impl Into<String>) -> anyhow::Error {
    DispatchError::StateConflict {
        request_id: request_id.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn forbidden(reason: impl Into<String>) -> anyhow::Error {
    DispatchError::Forbidden {
        reason: reason.into(),
    }
    .into()
}

fn require_kind(principal: &Principal, kind: PrincipalKind) -> Result<()> {
    if principal.kind != kind {
        return Err(forbidden(format!(
            "{} {} cannot perform a {} action",
            principal.kind, principal.user_id, kind
        )));
    }
    Ok(())
}

/// The request lifecycle state machine
#[derive(Clone)]
pub struct RequestLifecycleManager {
    store: Arc<dyn RequestStore>,
    notifier: Arc<Notifier>,
    matching: MatchingConfig,
    config: LifecycleConfig,
    metrics: Arc<MetricsCollector>,
}

impl RequestLifecycleManager {
    pub fn new(
        store: Arc<dyn RequestStore>,
        notifier: Arc<Notifier>,
        matching: MatchingConfig,
        config: LifecycleConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            notifier,
            matching,
            config,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn matching_config(&self) -> &MatchingConfig {
        &self.matching
    }

    /// Acceptance deadline for a request opened at `now`
    fn deadline_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_add_signed(self.config.broadcast_deadline)
            .ok_or_else(|| {
                DispatchError::Internal {
                    message: format!(
                        "broadcast deadline of {}s overflows the clock",
                        self.config.broadcast_deadline.num_seconds()
                    ),
                }
                .into()
            })
    }

    async fn load(&self, request_id: RequestId) -> Result<ServiceRequest> {
        self.store
            .load_request(request_id)
            .await?
            .ok_or_else(|| {
                DispatchError::RequestNotFound {
                    request_id: request_id.to_string(),
                }
                .into()
            })
    }

    /// Write a transition through the store CAS, checking the table first
    async fn transition(
        &self,
        request_id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
        update: StatusUpdate,
    ) -> Result<Option<ServiceRequest>> {
        if !from.can_transition_to(to) {
            return Err(conflict(
                request_id,
                format!("cannot move from {} to {}", from, to),
            ));
        }

        let updated = self
            .store
            .cas_update_request_status(request_id, from, to, update)
            .await?;
        if updated.is_some() {
            self.metrics.record_transition(to);
            debug!("Request {} moved {} -> {}", request_id, from, to);
        }
        Ok(updated)
    }

    /// Create a request from a customer's draft
    ///
    /// Urgent and standard requests start in `broadcast` with a deadline;
    /// scheduled requests wait in `scheduled` until promoted. The caller is
    /// responsible for fanning out broadcast requests.
    pub async fn create_request(
        &self,
        customer: &Principal,
        draft: NewServiceRequest,
        now: DateTime<Utc>,
    ) -> Result<ServiceRequest> {
        require_kind(customer, PrincipalKind::Customer)?;
        let query = MatchQuery::new(
            draft.location(),
            &draft.category,
            draft.radius_km,
            &self.matching,
        )?;

        let (status, expires_at, scheduled_for) = match draft.urgency {
            Urgency::Scheduled => {
                let at = draft.scheduled_for.ok_or_else(|| {
                    DispatchError::validation("scheduled requests need scheduled_for")
                })?;
                if at <= now {
                    return Err(
                        DispatchError::validation("scheduled_for must be in the future").into(),
                    );
                }
                (RequestStatus::Scheduled, None, Some(at))
            }
            Urgency::Urgent | Urgency::Standard => (
                RequestStatus::Broadcast,
                Some(self.deadline_from(now)?),
                None,
            ),
        };

        let request = ServiceRequest {
            id: generate_request_id(),
            customer_id: customer.user_id.clone(),
            category: draft.category.trim().to_string(),
            location: query.location,
            radius_km: query.radius_km,
            urgency: draft.urgency,
            description: draft.description,
            status,
            expires_at,
            scheduled_for,
            assigned_worker_id: None,
            notified_workers: Vec::new(),
            declined_workers: Vec::new(),
            created_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        };

        self.store.insert_request(request.clone()).await?;
        self.metrics.record_request_created(request.urgency);
        self.metrics.record_transition(request.status);

        info!(
            "Created {} request {} for customer {} ({}, {:.1} km)",
            request.urgency, request.id, request.customer_id, request.category, request.radius_km
        );

        self.notifier.deliver(
            &request.customer_id,
            &ServerEvent::RequestCreated {
                request: RequestSummary::from(&request),
            },
        );

        Ok(request)
    }

    /// Move a due scheduled request to `broadcast`
    ///
    /// Returns `None` if the request is not due or left `scheduled` first.
    pub async fn promote_scheduled(
        &self,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Option<ServiceRequest>> {
        let request = self.load(request_id).await?;
        if request.status != RequestStatus::Scheduled {
            return Ok(None);
        }
        if request.scheduled_for.is_some_and(|at| at > now) {
            return Ok(None);
        }

        let update = StatusUpdate::at(now).with_deadline(self.deadline_from(now)?);
        let promoted = self
            .transition(
                request_id,
                RequestStatus::Scheduled,
                RequestStatus::Broadcast,
                update,
            )
            .await?;

        if promoted.is_some() {
            info!("Promoted scheduled request {} to broadcast", request_id);
        }
        Ok(promoted)
    }

    /// Record which workers received a request's fan-out
    pub async fn record_fan_out(&self, request_id: RequestId, workers: Vec<UserId>) -> Result<()> {
        self.store.record_fan_out(request_id, workers).await
    }

    /// Worker accept; the only contested transition
    pub async fn accept(
        &self,
        worker: &Principal,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<ServiceRequest> {
        require_kind(worker, PrincipalKind::Worker)?;
        let request = self.load(request_id).await?;

        if request.status != RequestStatus::Broadcast {
            self.metrics.record_accept_conflict();
            return Err(conflict(
                request_id,
                format!("request is {}", request.status),
            ));
        }

        let snapshot = self
            .store
            .load_worker(&worker.user_id)
            .await?
            .ok_or_else(|| DispatchError::WorkerNotFound {
                worker_id: worker.user_id.clone(),
            })?;
        if !categories_match(&snapshot.category, &request.category) {
            return Err(forbidden(format!(
                "worker {} does not serve {}",
                worker.user_id, request.category
            )));
        }

        if !self
            .store
            .mark_worker_assignment(&worker.user_id, Some(request_id))
            .await?
        {
            self.metrics.record_accept_conflict();
            return Err(conflict(
                request_id,
                format!("worker {} already has an active request", worker.user_id),
            ));
        }

        let update = StatusUpdate::at(now).with_worker(worker.user_id.clone());
        let accepted = match self
            .transition(
                request_id,
                RequestStatus::Broadcast,
                RequestStatus::Accepted,
                update,
            )
            .await
        {
            Ok(Some(accepted)) => accepted,
            Ok(None) => {
                self.release_worker(&worker.user_id).await;
                self.metrics.record_accept_conflict();
                info!(
                    "Worker {} lost the accept race for request {}",
                    worker.user_id, request_id
                );
                return Err(conflict(request_id, "already accepted by another worker"));
            }
            Err(e) => {
                self.release_worker(&worker.user_id).await;
                return Err(e);
            }
        };

        info!(
            "Request {} accepted by worker {}",
            request_id, worker.user_id
        );

        let eta = snapshot.location.map(|at| {
            eta_minutes(
                haversine_km(at, accepted.location),
                self.matching.average_speed_kmh,
            )
        });
        self.notifier.deliver(
            &accepted.customer_id,
            &ServerEvent::RequestAccepted {
                request_id,
                worker_id: worker.user_id.clone(),
                eta_minutes: eta,
            },
        );
        self.notifier
            .send_live(&worker.user_id, &ServerEvent::RequestConfirmed { request_id });

        let taken = ServerEvent::RequestUnavailable {
            request_id: Some(request_id),
            reason: "accepted by another worker".to_string(),
        };
        for other in accepted.pending_workers() {
            if other != worker.user_id {
                self.notifier.send_live(&other, &taken);
            }
        }

        Ok(accepted)
    }

    /// Worker decline; the request stays open for the other candidates
    pub async fn decline(&self, worker: &Principal, request_id: RequestId) -> Result<()> {
        require_kind(worker, PrincipalKind::Worker)?;
        let request = self.load(request_id).await?;
        if request.status != RequestStatus::Broadcast {
            return Err(conflict(
                request_id,
                format!("request is {}", request.status),
            ));
        }

        self.store.record_decline(request_id, &worker.user_id).await?;
        debug!("Worker {} declined request {}", worker.user_id, request_id);

        self.notifier
            .send_live(&worker.user_id, &ServerEvent::RequestDeclined { request_id });
        Ok(())
    }

    fn require_assigned(request: &ServiceRequest, worker: &Principal) -> Result<()> {
        if request.assigned_worker_id.as_deref() != Some(worker.user_id.as_str()) {
            return Err(forbidden(format!(
                "worker {} is not assigned to request {}",
                worker.user_id, request.id
            )));
        }
        Ok(())
    }

    /// Assigned worker starts the job
    pub async fn start(
        &self,
        worker: &Principal,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<ServiceRequest> {
        require_kind(worker, PrincipalKind::Worker)?;
        let request = self.load(request_id).await?;
        Self::require_assigned(&request, worker)?;

        let started = self
            .transition(
                request_id,
                request.status,
                RequestStatus::InProgress,
                StatusUpdate::at(now),
            )
            .await?
            .ok_or_else(|| conflict(request_id, "request changed before it could start"))?;

        info!("Worker {} started request {}", worker.user_id, request_id);
        self.notifier.deliver(
            &started.customer_id,
            &ServerEvent::RequestStarted {
                request_id,
                worker_id: worker.user_id.clone(),
            },
        );
        Ok(started)
    }

    /// Assigned worker completes the job, releasing the worker
    pub async fn complete(
        &self,
        worker: &Principal,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<ServiceRequest> {
        require_kind(worker, PrincipalKind::Worker)?;
        let request = self.load(request_id).await?;
        Self::require_assigned(&request, worker)?;

        let completed = self
            .transition(
                request_id,
                request.status,
                RequestStatus::Completed,
                StatusUpdate::at(now),
            )
            .await?
            .ok_or_else(|| conflict(request_id, "request changed before it could complete"))?;

        self.release_worker(&worker.user_id).await;
        info!("Worker {} completed request {}", worker.user_id, request_id);

        self.notifier.deliver(
            &completed.customer_id,
            &ServerEvent::RequestCompleted {
                request_id,
                worker_id: worker.user_id.clone(),
            },
        );
        Ok(completed)
    }

    /// Owning customer cancels a non-terminal request
    pub async fn cancel(
        &self,
        customer: &Principal,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<ServiceRequest> {
        require_kind(customer, PrincipalKind::Customer)?;

        for _ in 0..CANCEL_ATTEMPTS {
            let request = self.load(request_id).await?;
            if request.customer_id != customer.user_id {
                return Err(forbidden(format!(
                    "customer {} does not own request {}",
                    customer.user_id, request_id
                )));
            }
            if request.status.is_terminal() {
                return Err(conflict(
                    request_id,
                    format!("request is already {}", request.status),
                ));
            }

            let Some(cancelled) = self
                .transition(
                    request_id,
                    request.status,
                    RequestStatus::Cancelled,
                    StatusUpdate::at(now),
                )
                .await?
            else {
                // Status moved underneath us; re-read and try again
                continue;
            };

            info!(
                "Customer {} cancelled request {} (was {})",
                customer.user_id, request_id, request.status
            );

            let event = ServerEvent::RequestCancelled {
                request_id,
                cancelled_by: customer.user_id.clone(),
            };
            if request.status.holds_worker() {
                if let Some(worker_id) = &cancelled.assigned_worker_id {
                    self.release_worker(worker_id).await;
                    self.notifier.deliver(worker_id, &event);
                }
            } else {
                for worker_id in cancelled.pending_workers() {
                    self.notifier.send_live(&worker_id, &event);
                }
            }
            return Ok(cancelled);
        }

        Err(conflict(request_id, "request kept changing during cancel"))
    }

    /// Sweeper-driven expiry of an unaccepted broadcast request
    pub async fn expire(&self, request_id: RequestId, now: DateTime<Utc>) -> Result<ExpiryOutcome> {
        let request = self.load(request_id).await?;
        if request.status != RequestStatus::Broadcast {
            self.metrics.record_expiry_race();
            return Ok(ExpiryOutcome::Raced);
        }
        if request.expires_at.map_or(true, |deadline| deadline > now) {
            return Ok(ExpiryOutcome::NotDue);
        }

        let Some(expired) = self
            .transition(
                request_id,
                RequestStatus::Broadcast,
                RequestStatus::Expired,
                StatusUpdate::at(now),
            )
            .await?
        else {
            self.metrics.record_expiry_race();
            return Ok(ExpiryOutcome::Raced);
        };

        info!(
            "Request {} expired without acceptance ({} workers notified)",
            request_id,
            expired.notified_workers.len()
        );

        let event = ServerEvent::RequestExpired { request_id };
        self.notifier.deliver(&expired.customer_id, &event);
        for worker_id in expired.pending_workers() {
            self.notifier.deliver(&worker_id, &event);
        }

        Ok(ExpiryOutcome::Expired(expired))
    }

    /// Apply a worker's availability update to its snapshot
    pub async fn update_availability(
        &self,
        worker: &Principal,
        update: AvailabilityUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkerAvailability> {
        require_kind(worker, PrincipalKind::Worker)?;

        let existing = self.store.load_worker(&worker.user_id).await?;
        let mut snapshot = existing.unwrap_or_else(|| WorkerAvailability {
            worker_id: worker.user_id.clone(),
            category: String::new(),
            location: None,
            location_updated_at: None,
            is_available: false,
            active_request_id: None,
        });

        match (update.lat, update.lng) {
            (Some(lat), Some(lng)) => {
                let location = GeoPoint::new(lat, lng);
                location.validate()?;
                snapshot.location = Some(location);
                snapshot.location_updated_at = Some(now);
            }
            (None, None) => {}
            _ => {
                return Err(
                    DispatchError::validation("lat and lng must be provided together").into(),
                )
            }
        }
        if let Some(category) = update.category {
            let category = category.trim().to_string();
            if category.is_empty() {
                return Err(DispatchError::validation("category must not be empty").into());
            }
            snapshot.category = category;
        }
        if let Some(is_available) = update.is_available {
            snapshot.is_available = is_available;
        }

        self.store.upsert_worker(snapshot.clone()).await?;
        debug!(
            "Worker {} availability: available={}, located={}",
            worker.user_id,
            snapshot.is_available,
            snapshot.location.is_some()
        );
        Ok(snapshot)
    }

    async fn release_worker(&self, worker_id: &str) {
        if let Err(e) = self.store.mark_worker_assignment(worker_id, None).await {
            warn!("Failed to release worker {}: {}", worker_id, e);
        }
    }
}
