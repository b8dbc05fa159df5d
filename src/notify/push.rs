//! Push notification fallback for recipients without a live connection

use crate::error::{DispatchError, Result};
use crate::types::UserId;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// Trait for push notification providers
#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Send a best-effort push notification to a user's devices
    async fn send_push(
        &self,
        user_id: &str,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<()>;
}

/// Push notifier that only logs, used when no provider is configured
#[derive(Debug, Default)]
pub struct LoggingPushNotifier;

#[async_trait]
impl PushNotifier for LoggingPushNotifier {
    async fn send_push(
        &self,
        user_id: &str,
        title: &str,
        body: &str,
        _data: serde_json::Value,
    ) -> Result<()> {
        info!("Push to {}: {} - {}", user_id, title, body);
        Ok(())
    }
}

/// A push recorded by [`MockPushNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentPush {
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// Mock push notifier for testing
#[derive(Debug, Default)]
pub struct MockPushNotifier {
    sent: Mutex<Vec<SentPush>>,
    fail: bool,
}

impl MockPushNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every send fails
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Pushes sent so far
    pub fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Pushes sent to one user
    pub fn sent_to(&self, user_id: &str) -> Vec<SentPush> {
        self.sent()
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect()
    }
}

#[async_trait]
impl PushNotifier for MockPushNotifier {
    async fn send_push(
        &self,
        user_id: &str,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        if self.fail {
            return Err(DispatchError::Fallback {
                user_id: user_id.to_string(),
                reason: "provider unavailable".to_string(),
            }
            .into());
        }

        let mut sent = self
            .sent
            .lock()
            .map_err(|_| DispatchError::lock_poisoned("sent pushes"))?;
        sent.push(SentPush {
            user_id: user_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            data,
        });
        Ok(())
    }
}
