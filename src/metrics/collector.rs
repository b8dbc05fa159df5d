//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the dispatch service using
//! Prometheus metrics, grouped by the component that records them.

use crate::lifecycle::RequestStatus;
use crate::types::Urgency;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the dispatch service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Connection hub metrics
    hub_metrics: HubMetrics,

    /// Request lifecycle metrics
    request_metrics: RequestMetrics,

    /// Push fallback metrics
    push_metrics: PushMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Connection hub metrics
#[derive(Clone)]
pub struct HubMetrics {
    /// Live connections in the registry
    pub active_connections: IntGauge,

    /// Total connections registered
    pub connections_total: IntCounter,

    /// Connections replaced by a newer one for the same user
    pub replacements_total: IntCounter,

    /// Frames accepted by an outbound queue
    pub frames_delivered_total: IntCounterVec,

    /// Frames dropped for a recipient
    pub frames_dropped_total: IntCounterVec,

    /// Inbound messages by kind
    pub inbound_messages_total: IntCounterVec,

    /// Inbound messages with an unknown type
    pub unknown_messages_total: IntCounter,
}

/// Request lifecycle metrics
#[derive(Clone)]
pub struct RequestMetrics {
    /// Requests created by urgency
    pub requests_created_total: IntCounterVec,

    /// Successful transitions by target status
    pub transitions_total: IntCounterVec,

    /// Accepts that lost the race
    pub accept_conflicts_total: IntCounter,

    /// Sweeper CAS misses
    pub expiry_races_total: IntCounter,

    /// Workers notified per fan-out
    pub fan_out_size: Histogram,

    /// Time spent in one sweeper tick
    pub sweep_duration: Histogram,

    /// Time spent handling one inbound message
    pub dispatch_duration: HistogramVec,
}

/// Push fallback metrics
#[derive(Clone)]
pub struct PushMetrics {
    /// Push sends by outcome
    pub push_sends_total: IntCounterVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let hub_metrics = HubMetrics::new(&registry)?;
        let request_metrics = RequestMetrics::new(&registry)?;
        let push_metrics = PushMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            hub_metrics,
            request_metrics,
            push_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Get service metrics
    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Get hub metrics
    pub fn hub(&self) -> &HubMetrics {
        &self.hub_metrics
    }

    /// Get request metrics
    pub fn requests(&self) -> &RequestMetrics {
        &self.request_metrics
    }

    /// Get push metrics
    pub fn push(&self) -> &PushMetrics {
        &self.push_metrics
    }

    /// Record a connection entering the registry
    pub fn record_connection_opened(&self, replaced_existing: bool) {
        self.hub_metrics.connections_total.inc();
        if replaced_existing {
            self.hub_metrics.replacements_total.inc();
        } else {
            self.hub_metrics.active_connections.inc();
        }
    }

    /// Record a connection leaving the registry
    pub fn record_connection_closed(&self) {
        self.hub_metrics.active_connections.dec();
    }

    /// Record a frame queued for a recipient (`user`, `room` or `broadcast`)
    pub fn record_frame_delivered(&self, scope: &str) {
        self.hub_metrics
            .frames_delivered_total
            .with_label_values(&[scope])
            .inc();
    }

    /// Record a frame dropped for a recipient (`queue_full` or `closed`)
    pub fn record_frame_dropped(&self, reason: &str) {
        self.hub_metrics
            .frames_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record an inbound message of a known kind
    pub fn record_inbound(&self, kind: &str) {
        self.hub_metrics
            .inbound_messages_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Record an inbound message with an unknown type
    pub fn record_unknown_message(&self) {
        self.hub_metrics.unknown_messages_total.inc();
    }

    /// Record a request being created
    pub fn record_request_created(&self, urgency: Urgency) {
        let urgency_str = match urgency {
            Urgency::Urgent => "urgent",
            Urgency::Standard => "standard",
            Urgency::Scheduled => "scheduled",
        };

        self.request_metrics
            .requests_created_total
            .with_label_values(&[urgency_str])
            .inc();
    }

    /// Record a successful status transition
    pub fn record_transition(&self, status: RequestStatus) {
        self.request_metrics
            .transitions_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    /// Record an accept that lost the race
    pub fn record_accept_conflict(&self) {
        self.request_metrics.accept_conflicts_total.inc();
    }

    /// Record a sweeper CAS miss
    pub fn record_expiry_race(&self) {
        self.request_metrics.expiry_races_total.inc();
    }

    /// Record the number of workers notified by a fan-out
    pub fn record_fan_out(&self, recipients: usize) {
        self.request_metrics
            .fan_out_size
            .observe(recipients as f64);
    }

    /// Record sweeper tick duration
    pub fn record_sweep(&self, duration: Duration) {
        self.request_metrics
            .sweep_duration
            .observe(duration.as_secs_f64());
    }

    /// Record the time spent dispatching one inbound message
    pub fn record_dispatch(&self, kind: &str, duration: Duration) {
        self.request_metrics
            .dispatch_duration
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
    }

    /// Record a push fallback attempt
    pub fn record_push(&self, success: bool) {
        let outcome = if success { "sent" } else { "failed" };
        self.push_metrics
            .push_sends_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds = IntGauge::new("dispatch_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "dispatch_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("dispatch_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

impl HubMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let active_connections = IntGauge::new(
            "dispatch_active_connections",
            "Live connections in the hub registry",
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let connections_total = IntCounter::new(
            "dispatch_connections_total",
            "Total connections registered",
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let replacements_total = IntCounter::new(
            "dispatch_connection_replacements_total",
            "Connections replaced by a newer connection for the same user",
        )?;
        registry.register(Box::new(replacements_total.clone()))?;

        let frames_delivered_total = IntCounterVec::new(
            Opts::new(
                "dispatch_frames_delivered_total",
                "Frames accepted by an outbound queue",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(frames_delivered_total.clone()))?;

        let frames_dropped_total = IntCounterVec::new(
            Opts::new(
                "dispatch_frames_dropped_total",
                "Frames dropped for a recipient",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(frames_dropped_total.clone()))?;

        let inbound_messages_total = IntCounterVec::new(
            Opts::new(
                "dispatch_inbound_messages_total",
                "Inbound messages by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(inbound_messages_total.clone()))?;

        let unknown_messages_total = IntCounter::new(
            "dispatch_unknown_messages_total",
            "Inbound messages with an unknown type",
        )?;
        registry.register(Box::new(unknown_messages_total.clone()))?;

        Ok(Self {
            active_connections,
            connections_total,
            replacements_total,
            frames_delivered_total,
            frames_dropped_total,
            inbound_messages_total,
            unknown_messages_total,
        })
    }
}

impl RequestMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_created_total = IntCounterVec::new(
            Opts::new("dispatch_requests_created_total", "Service requests created"),
            &["urgency"],
        )?;
        registry.register(Box::new(requests_created_total.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "dispatch_request_transitions_total",
                "Request status transitions by target status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let accept_conflicts_total = IntCounter::new(
            "dispatch_accept_conflicts_total",
            "Accepts rejected because the request was no longer available",
        )?;
        registry.register(Box::new(accept_conflicts_total.clone()))?;

        let expiry_races_total = IntCounter::new(
            "dispatch_expiry_races_total",
            "Expiry attempts skipped because the request changed first",
        )?;
        registry.register(Box::new(expiry_races_total.clone()))?;

        let fan_out_size = Histogram::with_opts(
            HistogramOpts::new("dispatch_fan_out_size", "Workers notified per fan-out")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]),
        )?;
        registry.register(Box::new(fan_out_size.clone()))?;

        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_sweep_duration_seconds",
                "Expiry sweeper tick duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_message_duration_seconds",
                "Inbound message handling duration",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
            &["kind"],
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        Ok(Self {
            requests_created_total,
            transitions_total,
            accept_conflicts_total,
            expiry_races_total,
            fan_out_size,
            sweep_duration,
            dispatch_duration,
        })
    }
}

impl PushMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let push_sends_total = IntCounterVec::new(
            Opts::new(
                "dispatch_push_sends_total",
                "Push notification fallback attempts",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(push_sends_total.clone()))?;

        Ok(Self { push_sends_total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        // Test that we can access all metric groups
        let _service = collector.service();
        let _hub = collector.hub();
        let _requests = collector.requests();
        let _push = collector.push();
    }

    #[test]
    fn test_connection_gauge_ignores_replacements() {
        let collector = MetricsCollector::new().unwrap();

        collector.record_connection_opened(false);
        collector.record_connection_opened(false);
        collector.record_connection_opened(true);
        collector.record_connection_closed();

        assert_eq!(collector.hub().active_connections.get(), 1);
        assert_eq!(collector.hub().connections_total.get(), 3);
        assert_eq!(collector.hub().replacements_total.get(), 1);
    }

    #[test]
    fn test_request_recording() {
        let collector = MetricsCollector::new().unwrap();

        collector.record_request_created(Urgency::Urgent);
        collector.record_transition(RequestStatus::Accepted);
        collector.record_accept_conflict();
        collector.record_fan_out(3);
        collector.record_sweep(Duration::from_millis(2));

        assert_eq!(
            collector
                .requests()
                .requests_created_total
                .with_label_values(&["urgent"])
                .get(),
            1
        );
        assert_eq!(
            collector
                .requests()
                .transitions_total
                .with_label_values(&["accepted"])
                .get(),
            1
        );
        assert_eq!(collector.requests().accept_conflicts_total.get(), 1);
    }

    #[test]
    fn test_registry_exports_families() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_frame_dropped("queue_full");
        collector.record_push(false);

        let names: Vec<String> = collector
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"dispatch_frames_dropped_total".to_string()));
        assert!(names.contains(&"dispatch_push_sends_total".to_string()));
    }

    #[test]
    fn test_health_status_updates() {
        let collector = MetricsCollector::new().unwrap();

        collector.update_health_status(2); // Healthy
        collector.update_component_health("hub", true);
        collector.update_component_health("store", false);
        assert_eq!(collector.service().health_status.get(), 2);
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().unwrap();
        let timer = collector.start_timer();

        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.elapsed();

        assert!(duration >= Duration::from_millis(10));

        let final_duration = timer.stop();
        assert!(final_duration >= Duration::from_millis(10));
    }
}
