//! In-memory request store
//!
//! Requests and workers live in two maps behind separate `RwLock`s. Every
//! conditional write (status CAS, worker claim) happens under a single write
//! guard, which is what makes it atomic with respect to concurrent callers.

use crate::error::{DispatchError, Result};
use crate::lifecycle::RequestStatus;
use crate::store::request_store::{RequestStore, StatusUpdate};
use crate::types::{GeoPoint, RequestId, ServiceRequest, UserId, WorkerAvailability};
use crate::utils::categories_match;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

fn unavailable(what: &str) -> DispatchError {
    DispatchError::PersistenceUnavailable {
        message: format!("Failed to acquire {} lock", what),
    }
}

/// In-memory implementation of [`RequestStore`]
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    requests: RwLock<HashMap<RequestId, ServiceRequest>>,
    workers: RwLock<HashMap<UserId, WorkerAvailability>>,
}

impl InMemoryRequestStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read_requests(&self) -> Result<RwLockReadGuard<'_, HashMap<RequestId, ServiceRequest>>> {
        Ok(self
            .requests
            .read()
            .map_err(|_| unavailable("requests read"))?)
    }

    fn write_requests(&self) -> Result<RwLockWriteGuard<'_, HashMap<RequestId, ServiceRequest>>> {
        Ok(self
            .requests
            .write()
            .map_err(|_| unavailable("requests write"))?)
    }

    fn read_workers(&self) -> Result<RwLockReadGuard<'_, HashMap<UserId, WorkerAvailability>>> {
        Ok(self
            .workers
            .read()
            .map_err(|_| unavailable("workers read"))?)
    }

    fn write_workers(&self) -> Result<RwLockWriteGuard<'_, HashMap<UserId, WorkerAvailability>>> {
        Ok(self
            .workers
            .write()
            .map_err(|_| unavailable("workers write"))?)
    }

    fn not_found(request_id: RequestId) -> anyhow::Error {
        DispatchError::RequestNotFound {
            request_id: request_id.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn load_request(&self, request_id: RequestId) -> Result<Option<ServiceRequest>> {
        let requests = self.read_requests()?;
        Ok(requests.get(&request_id).cloned())
    }

    async fn insert_request(&self, request: ServiceRequest) -> Result<()> {
        let mut requests = self.write_requests()?;
        if requests.contains_key(&request.id) {
            return Err(DispatchError::Internal {
                message: format!("Request {} already exists", request.id),
            }
            .into());
        }
        requests.insert(request.id, request);
        Ok(())
    }

    async fn cas_update_request_status(
        &self,
        request_id: RequestId,
        expected: RequestStatus,
        new_status: RequestStatus,
        update: StatusUpdate,
    ) -> Result<Option<ServiceRequest>> {
        let mut requests = self.write_requests()?;
        let request = requests
            .get_mut(&request_id)
            .ok_or_else(|| Self::not_found(request_id))?;

        if request.status != expected {
            return Ok(None);
        }

        update.apply(request, new_status);
        Ok(Some(request.clone()))
    }

    async fn find_eligible_workers(
        &self,
        category: &str,
        _location: GeoPoint,
        _radius_km: f64,
    ) -> Result<Vec<WorkerAvailability>> {
        // Linear scan; the matcher applies distance and freshness rules
        let workers = self.read_workers()?;
        Ok(workers
            .values()
            .filter(|w| w.is_available && !w.has_active_assignment())
            .filter(|w| categories_match(&w.category, category))
            .cloned()
            .collect())
    }

    async fn mark_worker_assignment(
        &self,
        worker_id: &str,
        request_id: Option<RequestId>,
    ) -> Result<bool> {
        let mut workers = self.write_workers()?;
        let worker = match workers.get_mut(worker_id) {
            Some(worker) => worker,
            None if request_id.is_none() => return Ok(false),
            None => {
                return Err(DispatchError::WorkerNotFound {
                    worker_id: worker_id.to_string(),
                }
                .into())
            }
        };

        match (request_id, worker.active_request_id) {
            (Some(_), Some(_)) => Ok(false),
            (Some(claim), None) => {
                worker.active_request_id = Some(claim);
                Ok(true)
            }
            (None, _) => {
                worker.active_request_id = None;
                Ok(true)
            }
        }
    }

    async fn find_expired_broadcasts(&self, now: DateTime<Utc>) -> Result<Vec<ServiceRequest>> {
        let requests = self.read_requests()?;
        let mut expired: Vec<ServiceRequest> = requests
            .values()
            .filter(|r| r.status == RequestStatus::Broadcast)
            .filter(|r| r.expires_at.is_some_and(|deadline| deadline <= now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<ServiceRequest>> {
        let requests = self.read_requests()?;
        let mut due: Vec<ServiceRequest> = requests
            .values()
            .filter(|r| r.status == RequestStatus::Scheduled)
            .filter(|r| r.scheduled_for.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.scheduled_for);
        Ok(due)
    }

    async fn load_worker(&self, worker_id: &str) -> Result<Option<WorkerAvailability>> {
        let workers = self.read_workers()?;
        Ok(workers.get(worker_id).cloned())
    }

    async fn upsert_worker(&self, mut worker: WorkerAvailability) -> Result<()> {
        let mut workers = self.write_workers()?;
        if let Some(existing) = workers.get(&worker.worker_id) {
            worker.active_request_id = existing.active_request_id;
        }
        workers.insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn record_fan_out(&self, request_id: RequestId, worker_ids: Vec<UserId>) -> Result<()> {
        let mut requests = self.write_requests()?;
        let request = requests
            .get_mut(&request_id)
            .ok_or_else(|| Self::not_found(request_id))?;

        for worker_id in worker_ids {
            if !request.notified_workers.contains(&worker_id) {
                request.notified_workers.push(worker_id);
            }
        }
        Ok(())
    }

    async fn record_decline(&self, request_id: RequestId, worker_id: &str) -> Result<()> {
        let mut requests = self.write_requests()?;
        let request = requests
            .get_mut(&request_id)
            .ok_or_else(|| Self::not_found(request_id))?;

        if !request.declined_workers.iter().any(|w| w == worker_id) {
            request.declined_workers.push(worker_id.to_string());
        }
        Ok(())
    }

    async fn request_count(&self) -> Result<usize> {
        Ok(self.read_requests()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Urgency;
    use crate::utils::{current_timestamp, generate_request_id};
    use chrono::Duration;

    fn create_test_request(status: RequestStatus) -> ServiceRequest {
        let now = current_timestamp();
        ServiceRequest {
            id: generate_request_id(),
            customer_id: "c1".to_string(),
            category: "Plomberie".to_string(),
            location: GeoPoint::new(18.10, -15.95),
            radius_km: 10.0,
            urgency: Urgency::Urgent,
            description: None,
            status,
            expires_at: Some(now + Duration::minutes(3)),
            scheduled_for: None,
            assigned_worker_id: None,
            notified_workers: Vec::new(),
            declined_workers: Vec::new(),
            created_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    fn create_test_worker(id: &str) -> WorkerAvailability {
        WorkerAvailability {
            worker_id: id.to_string(),
            category: "Plomberie".to_string(),
            location: Some(GeoPoint::new(18.10, -15.95)),
            location_updated_at: Some(current_timestamp()),
            is_available: true,
            active_request_id: None,
        }
    }

    #[tokio::test]
    async fn test_cas_succeeds_once() {
        let store = InMemoryRequestStore::new();
        let request = create_test_request(RequestStatus::Broadcast);
        let id = request.id;
        store.insert_request(request).await.unwrap();

        let first = store
            .cas_update_request_status(
                id,
                RequestStatus::Broadcast,
                RequestStatus::Accepted,
                StatusUpdate::at(current_timestamp()).with_worker("w1"),
            )
            .await
            .unwrap();
        let updated = first.unwrap();
        assert_eq!(updated.status, RequestStatus::Accepted);
        assert_eq!(updated.assigned_worker_id.as_deref(), Some("w1"));
        assert!(updated.accepted_at.is_some());

        let second = store
            .cas_update_request_status(
                id,
                RequestStatus::Broadcast,
                RequestStatus::Accepted,
                StatusUpdate::at(current_timestamp()).with_worker("w2"),
            )
            .await
            .unwrap();
        assert!(second.is_none());

        let stored = store.load_request(id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_cas_unknown_request() {
        let store = InMemoryRequestStore::new();
        let err = store
            .cas_update_request_status(
                generate_request_id(),
                RequestStatus::Broadcast,
                RequestStatus::Expired,
                StatusUpdate::at(current_timestamp()),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            DispatchError::classify(&err),
            Some(DispatchError::RequestNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_claim_is_exclusive() {
        let store = InMemoryRequestStore::new();
        store.upsert_worker(create_test_worker("w1")).await.unwrap();

        let r1 = generate_request_id();
        let r2 = generate_request_id();

        assert!(store.mark_worker_assignment("w1", Some(r1)).await.unwrap());
        // A second claim fails even for the held request
        assert!(!store.mark_worker_assignment("w1", Some(r1)).await.unwrap());
        assert!(!store.mark_worker_assignment("w1", Some(r2)).await.unwrap());

        assert!(store.mark_worker_assignment("w1", None).await.unwrap());
        assert!(store.mark_worker_assignment("w1", Some(r2)).await.unwrap());

        assert!(store
            .mark_worker_assignment("ghost", Some(r1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_upsert_keeps_assignment() {
        let store = InMemoryRequestStore::new();
        store.upsert_worker(create_test_worker("w1")).await.unwrap();
        let request_id = generate_request_id();
        store
            .mark_worker_assignment("w1", Some(request_id))
            .await
            .unwrap();

        let mut update = create_test_worker("w1");
        update.location = Some(GeoPoint::new(18.2, -15.9));
        store.upsert_worker(update).await.unwrap();

        let worker = store.load_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.active_request_id, Some(request_id));
        assert_eq!(worker.location, Some(GeoPoint::new(18.2, -15.9)));
    }

    #[tokio::test]
    async fn test_find_expired_and_due() {
        let store = InMemoryRequestStore::new();
        let now = current_timestamp();

        let mut stale = create_test_request(RequestStatus::Broadcast);
        stale.expires_at = Some(now - Duration::seconds(1));
        let fresh = create_test_request(RequestStatus::Broadcast);
        let mut accepted = create_test_request(RequestStatus::Accepted);
        accepted.expires_at = Some(now - Duration::seconds(1));

        let mut due = create_test_request(RequestStatus::Scheduled);
        due.expires_at = None;
        due.scheduled_for = Some(now - Duration::minutes(1));
        let mut later = create_test_request(RequestStatus::Scheduled);
        later.expires_at = None;
        later.scheduled_for = Some(now + Duration::hours(1));

        let stale_id = stale.id;
        let due_id = due.id;
        for request in [stale, fresh, accepted, due, later] {
            store.insert_request(request).await.unwrap();
        }

        let expired = store.find_expired_broadcasts(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale_id);

        let scheduled = store.find_due_scheduled(now).await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].id, due_id);

        assert_eq!(store.request_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_fan_out_and_decline_are_deduplicated() {
        let store = InMemoryRequestStore::new();
        let request = create_test_request(RequestStatus::Broadcast);
        let id = request.id;
        store.insert_request(request).await.unwrap();

        store
            .record_fan_out(id, vec!["w1".to_string(), "w2".to_string()])
            .await
            .unwrap();
        store.record_fan_out(id, vec!["w1".to_string()]).await.unwrap();
        store.record_decline(id, "w2").await.unwrap();
        store.record_decline(id, "w2").await.unwrap();

        let stored = store.load_request(id).await.unwrap().unwrap();
        assert_eq!(stored.notified_workers, vec!["w1", "w2"]);
        assert_eq!(stored.declined_workers, vec!["w2"]);
        assert_eq!(stored.pending_workers(), vec!["w1"]);
    }

    #[tokio::test]
    async fn test_candidates_filtered_by_category_and_availability() {
        let store = InMemoryRequestStore::new();
        store.upsert_worker(create_test_worker("w1")).await.unwrap();
        let mut off = create_test_worker("w2");
        off.is_available = false;
        store.upsert_worker(off).await.unwrap();
        let mut other = create_test_worker("w3");
        other.category = "Menuiserie".to_string();
        store.upsert_worker(other).await.unwrap();

        let candidates = store
            .find_eligible_workers("plomberie", GeoPoint::new(18.1, -15.95), 10.0)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].worker_id, "w1");
    }
}
