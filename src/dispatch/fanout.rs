//! Fan-out of a broadcast request to every eligible worker

use crate::error::Result;
use crate::geo::{MatchQuery, MatchedWorker, WorkerMatcher};
use crate::lifecycle::RequestLifecycleManager;
use crate::metrics::MetricsCollector;
use crate::notify::{Delivery, Notifier, RequestSummary, ServerEvent};
use crate::store::RequestStore;
use crate::types::ServiceRequest;
use crate::utils::normalize_category;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Summary of one fan-out
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOutReport {
    pub matched: Vec<MatchedWorker>,
    pub live: usize,
    pub pushed: usize,
    pub dropped: usize,
}

impl FanOutReport {
    pub fn recipients(&self) -> usize {
        self.matched.len()
    }
}

/// Matches workers for a request and notifies all of them at once
pub struct RequestFanOut {
    store: Arc<dyn RequestStore>,
    matcher: Arc<dyn WorkerMatcher>,
    lifecycle: Arc<RequestLifecycleManager>,
    notifier: Arc<Notifier>,
    metrics: Arc<MetricsCollector>,
}

impl RequestFanOut {
    pub fn new(
        store: Arc<dyn RequestStore>,
        matcher: Arc<dyn WorkerMatcher>,
        lifecycle: Arc<RequestLifecycleManager>,
        notifier: Arc<Notifier>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            matcher,
            lifecycle,
            notifier,
            metrics,
        }
    }

    /// Notify every eligible worker of a broadcast request
    ///
    /// No ranking: every match gets the same event, live if connected and by
    /// push otherwise. The first accept wins in the lifecycle manager.
    pub async fn fan_out(&self, request: &ServiceRequest, now: DateTime<Utc>) -> Result<FanOutReport> {
        let query = MatchQuery {
            location: request.location,
            category: normalize_category(&request.category),
            radius_km: request.radius_km,
        };

        let candidates = self
            .store
            .find_eligible_workers(&query.category, query.location, query.radius_km)
            .await?;
        let matched = self.matcher.find_eligible_workers(&query, &candidates, now);

        debug!(
            "Request {}: {} candidates, {} eligible within {:.1} km",
            request.id,
            candidates.len(),
            matched.len(),
            query.radius_km
        );

        self.lifecycle
            .record_fan_out(
                request.id,
                matched.iter().map(|m| m.worker_id.clone()).collect(),
            )
            .await?;

        let summary = RequestSummary::from(request);
        let mut report = FanOutReport::default();
        for worker in &matched {
            let event = ServerEvent::NewServiceRequest {
                request: summary.clone(),
                distance_km: worker.distance_km,
                eta_minutes: worker.eta_minutes,
            };
            match self.notifier.deliver(&worker.worker_id, &event) {
                Delivery::Live => report.live += 1,
                Delivery::Pushed => report.pushed += 1,
                Delivery::Dropped => report.dropped += 1,
            }
        }
        report.matched = matched;

        self.metrics.record_fan_out(report.recipients());
        info!(
            "Fanned out request {} to {} workers ({} live, {} pushed, {} dropped)",
            request.id,
            report.recipients(),
            report.live,
            report.pushed,
            report.dropped
        );

        Ok(report)
    }
}
