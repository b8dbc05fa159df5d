//! Periodic expiry of unaccepted broadcasts and promotion of due schedules

use crate::dispatch::RequestFanOut;
use crate::error::Result;
use crate::lifecycle::{ExpiryOutcome, RequestLifecycleManager};
use crate::metrics::MetricsCollector;
use crate::store::RequestStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweeper tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Requests moved to `expired`
    pub expired: usize,
    /// Expiry attempts that lost to a concurrent transition
    pub races: usize,
    /// Rows that failed and will be retried next tick
    pub failures: usize,
    /// Scheduled requests moved to `broadcast`
    pub promoted: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Background task that expires stale broadcasts
pub struct ExpirySweeper {
    store: Arc<dyn RequestStore>,
    lifecycle: Arc<RequestLifecycleManager>,
    fan_out: Arc<RequestFanOut>,
    metrics: Arc<MetricsCollector>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn RequestStore>,
        lifecycle: Arc<RequestLifecycleManager>,
        fan_out: Arc<RequestFanOut>,
        metrics: Arc<MetricsCollector>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            lifecycle,
            fan_out,
            metrics,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one tick against the given clock
    ///
    /// A failing row is logged and counted; it never aborts the rest of the
    /// scan. Only listing the candidates can fail the tick as a whole.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let timer = self.metrics.start_timer();
        let mut report = SweepReport::default();

        for request in self.store.find_expired_broadcasts(now).await? {
            match self.lifecycle.expire(request.id, now).await {
                Ok(ExpiryOutcome::Expired(_)) => report.expired += 1,
                Ok(ExpiryOutcome::Raced) => {
                    debug!("Request {} left broadcast before expiry", request.id);
                    report.races += 1;
                }
                Ok(ExpiryOutcome::NotDue) => {}
                Err(e) => {
                    warn!("Failed to expire request {}: {}", request.id, e);
                    report.failures += 1;
                }
            }
        }

        for request in self.store.find_due_scheduled(now).await? {
            let promoted = match self.lifecycle.promote_scheduled(request.id, now).await {
                Ok(Some(promoted)) => promoted,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to promote scheduled request {}: {}", request.id, e);
                    report.failures += 1;
                    continue;
                }
            };

            report.promoted += 1;
            if let Err(e) = self.fan_out.fan_out(&promoted, now).await {
                warn!("Fan-out for promoted request {} failed: {}", promoted.id, e);
                report.failures += 1;
            }
        }

        self.metrics.record_sweep(timer.stop());
        Ok(report)
    }

    /// Tick on the configured interval until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        info!(
            "Expiry sweeper started ({}s interval)",
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.is_idle() => {
                    debug!("Sweep completed - nothing to expire or promote");
                }
                Ok(report) => info!(
                    "Sweep completed - expired: {}, promoted: {}, races: {}, failures: {}",
                    report.expired, report.promoted, report.races, report.failures
                ),
                Err(e) => warn!("Sweep failed, retrying next tick: {}", e),
            }
        }

        info!("Expiry sweeper stopped");
    }
}
