//! Event delivery with push fallback
//!
//! Live delivery goes through the hub. Only recipients with no live
//! connection get a push; a full outbound queue is a drop, not a fallback.
//! Pushes run on tracked background tasks so they never hold up the
//! realtime path.

use crate::hub::ConnectionHub;
use crate::metrics::MetricsCollector;
use crate::notify::events::ServerEvent;
use crate::notify::push::PushNotifier;
use serde_json::json;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// How an event reached (or failed to reach) its recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's live connection
    Live,
    /// Recipient offline; handed to the push fallback
    Pushed,
    /// Recipient online but the frame was dropped, or nothing to push
    Dropped,
}

/// Delivers server events to users, live or by push
pub struct Notifier {
    hub: Arc<ConnectionHub>,
    push: Arc<dyn PushNotifier>,
    metrics: Arc<MetricsCollector>,
    push_tasks: TaskTracker,
}

impl Notifier {
    pub fn new(
        hub: Arc<ConnectionHub>,
        push: Arc<dyn PushNotifier>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            hub,
            push,
            metrics,
            push_tasks: TaskTracker::new(),
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Send an event over the live connection only
    pub fn send_live(&self, user_id: &str, event: &ServerEvent) -> bool {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {} event: {}", event.kind(), e);
                return false;
            }
        };

        match self.hub.send_to_user(user_id, frame) {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Live delivery to {} failed: {}", user_id, e);
                false
            }
        }
    }

    /// Deliver an event, falling back to push when the user is offline
    pub fn deliver(&self, user_id: &str, event: &ServerEvent) -> Delivery {
        if self.send_live(user_id, event) {
            return Delivery::Live;
        }

        match self.hub.is_online(user_id) {
            Ok(true) => return Delivery::Dropped,
            Ok(false) => {}
            Err(e) => warn!("Could not check presence of {}: {}", user_id, e),
        }

        let Some((title, body)) = event.push_text() else {
            debug!(
                "User {} offline, {} event has no push form",
                user_id,
                event.kind()
            );
            return Delivery::Dropped;
        };

        let data = json!({
            "type": event.kind(),
            "request_id": event.request_id(),
        });
        let push = self.push.clone();
        let metrics = self.metrics.clone();
        let user_id = user_id.to_string();

        self.push_tasks.spawn(async move {
            match push.send_push(&user_id, &title, &body, data).await {
                Ok(()) => {
                    debug!("Push fallback sent to {}", user_id);
                    metrics.record_push(true);
                }
                Err(e) => {
                    warn!("Push fallback to {} failed: {}", user_id, e);
                    metrics.record_push(false);
                }
            }
        });

        Delivery::Pushed
    }

    /// Wait for every push handed off so far to finish
    pub async fn flush_pushes(&self) {
        self.push_tasks.close();
        self.push_tasks.wait().await;
        self.push_tasks.reopen();
    }
}
