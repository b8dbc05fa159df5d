//! Test fixtures for integration testing
//!
//! Builds the full dispatch pipeline over the in-memory store and a
//! recording push notifier, plus helpers to connect fake clients.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::Value;
use service_dispatch::dispatch::{MessageDispatcher, RequestFanOut};
use service_dispatch::geo::{MatchingConfig, RadiusMatcher};
use service_dispatch::hub::{Connection, ConnectionHub, Frame};
use service_dispatch::lifecycle::{LifecycleConfig, RequestLifecycleManager};
use service_dispatch::metrics::MetricsCollector;
use service_dispatch::notify::{MockPushNotifier, Notifier};
use service_dispatch::store::{InMemoryRequestStore, RequestStore};
use service_dispatch::sweeper::ExpirySweeper;
use service_dispatch::types::{GeoPoint, Principal, WorkerAvailability};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Latitude and longitude of the reference customer
pub const CUSTOMER_LAT: f64 = 18.10;
pub const CUSTOMER_LNG: f64 = -15.95;

/// Degrees of latitude per kilometre, close enough for test placement
const DEG_PER_KM: f64 = 1.0 / 111.195;

/// Every component of the service wired together
pub struct TestSystem {
    pub metrics: Arc<MetricsCollector>,
    pub hub: Arc<ConnectionHub>,
    pub store: Arc<InMemoryRequestStore>,
    pub push: Arc<MockPushNotifier>,
    pub notifier: Arc<Notifier>,
    pub lifecycle: Arc<RequestLifecycleManager>,
    pub fan_out: Arc<RequestFanOut>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub sweeper: Arc<ExpirySweeper>,
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_queue_capacity(32)
    }

    pub fn with_queue_capacity(capacity: usize) -> Self {
        let metrics = Arc::new(MetricsCollector::new().expect("metrics registry"));
        let store = Arc::new(InMemoryRequestStore::new());
        let push = Arc::new(MockPushNotifier::new());
        let hub = Arc::new(ConnectionHub::new(capacity, metrics.clone()));
        let notifier = Arc::new(Notifier::new(hub.clone(), push.clone(), metrics.clone()));
        let lifecycle = Arc::new(RequestLifecycleManager::new(
            store.clone(),
            notifier.clone(),
            MatchingConfig::default(),
            LifecycleConfig::default(),
            metrics.clone(),
        ));
        let fan_out = Arc::new(RequestFanOut::new(
            store.clone(),
            Arc::new(RadiusMatcher::default()),
            lifecycle.clone(),
            notifier.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            hub.clone(),
            lifecycle.clone(),
            fan_out.clone(),
            notifier.clone(),
            metrics.clone(),
        ));
        let sweeper = Arc::new(ExpirySweeper::new(
            store.clone(),
            lifecycle.clone(),
            fan_out.clone(),
            metrics.clone(),
            Duration::from_secs(30),
        ));

        Self {
            metrics,
            hub,
            store,
            push,
            notifier,
            lifecycle,
            fan_out,
            dispatcher,
            sweeper,
        }
    }

    /// Register a live connection and return its outbound queue
    pub fn connect(&self, principal: &Principal) -> mpsc::Receiver<Frame> {
        let (conn, rx) = Connection::new(principal.clone(), self.hub.queue_capacity());
        self.hub.register(conn).expect("register connection");
        rx
    }

    /// Put an available worker `km_north` kilometres north of the customer
    pub async fn seed_worker(&self, worker_id: &str, category: &str, km_north: f64) {
        self.store
            .upsert_worker(worker_near(worker_id, category, km_north, Utc::now()))
            .await
            .expect("seed worker");
    }

    /// Send a raw JSON message as the given principal
    pub async fn send(&self, sender: &Principal, message: Value) {
        self.dispatcher.dispatch(sender, &message.to_string()).await;
    }
}

pub fn worker_near(
    worker_id: &str,
    category: &str,
    km_north: f64,
    seen_at: DateTime<Utc>,
) -> WorkerAvailability {
    WorkerAvailability {
        worker_id: worker_id.to_string(),
        category: category.to_string(),
        location: Some(GeoPoint::new(
            CUSTOMER_LAT + km_north * DEG_PER_KM,
            CUSTOMER_LNG,
        )),
        location_updated_at: Some(seen_at),
        is_available: true,
        active_request_id: None,
    }
}

/// Every event queued so far, decoded
pub fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        events.push(serde_json::from_str(&frame).expect("frame is JSON"));
    }
    events
}

/// Event types in arrival order
pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["type"].as_str().map(str::to_string))
        .collect()
}

pub fn service_request_message(category: &str, radius_km: f64) -> Value {
    serde_json::json!({
        "type": "service_request",
        "data": {
            "category": category,
            "lat": CUSTOMER_LAT,
            "lng": CUSTOMER_LNG,
            "radius_km": radius_km,
            "urgency": "urgent"
        }
    })
}
