//! Inbound message routing
//!
//! The dispatcher decodes an envelope, resolves its kind, and hands it to the
//! matching handler. Handlers only route: relays go through the hub, and
//! anything that changes a request goes through the lifecycle manager.
//! A failing handler answers the sender with an `error` (or
//! `request_unavailable`) event; it never tears down the connection.

use crate::dispatch::fanout::RequestFanOut;
use crate::dispatch::messages::{InboundEnvelope, MessageKind, RelayEnvelope, RequestRef};
use crate::error::{DispatchError, Result};
use crate::hub::{encode_frame, ConnectionHub};
use crate::lifecycle::{RequestLifecycleManager, RequestStatus};
use crate::metrics::MetricsCollector;
use crate::notify::{Notifier, ServerEvent};
use crate::types::{AvailabilityUpdate, NewServiceRequest, Principal};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Routes decoded inbound messages to their handlers
pub struct MessageDispatcher {
    hub: Arc<ConnectionHub>,
    lifecycle: Arc<RequestLifecycleManager>,
    fan_out: Arc<RequestFanOut>,
    notifier: Arc<Notifier>,
    metrics: Arc<MetricsCollector>,
}

impl MessageDispatcher {
    pub fn new(
        hub: Arc<ConnectionHub>,
        lifecycle: Arc<RequestLifecycleManager>,
        fan_out: Arc<RequestFanOut>,
        notifier: Arc<Notifier>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            hub,
            lifecycle,
            fan_out,
            notifier,
            metrics,
        }
    }

    /// Handle one raw inbound frame from an authenticated sender
    pub async fn dispatch(&self, sender: &Principal, raw: &str) {
        let timer = self.metrics.start_timer();

        let envelope = match InboundEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Bad frame from user {}: {}", sender.user_id, e);
                self.reply_error(sender, &e);
                return;
            }
        };

        let Some(kind) = MessageKind::from_wire(&envelope.kind) else {
            warn!(
                "Ignoring unknown message type '{}' from user {}",
                envelope.kind, sender.user_id
            );
            self.metrics.record_unknown_message();
            return;
        };
        self.metrics.record_inbound(kind.as_str());

        if let Err(e) = self.handle(kind, sender, envelope).await {
            self.reply_error(sender, &e);
        }

        self.metrics.record_dispatch(kind.as_str(), timer.stop());
    }

    async fn handle(
        &self,
        kind: MessageKind,
        sender: &Principal,
        envelope: InboundEnvelope,
    ) -> Result<()> {
        match kind {
            MessageKind::Chat | MessageKind::Typing | MessageKind::ReadReceipt => {
                self.relay_to_room(kind, sender, envelope)
            }
            MessageKind::Ping => {
                self.notifier.send_live(&sender.user_id, &ServerEvent::Pong);
                Ok(())
            }
            MessageKind::JoinRoom => {
                let room_id = envelope.room_id()?;
                self.hub.join_room(room_id, &sender.user_id)
            }
            MessageKind::LeaveRoom => {
                let room_id = envelope.room_id()?;
                self.hub.leave_room(room_id, &sender.user_id)?;
                Ok(())
            }
            MessageKind::ServiceRequest => self.handle_service_request(sender, envelope).await,
            MessageKind::WorkerAvailability => {
                let update: AvailabilityUpdate = envelope.payload()?;
                self.lifecycle
                    .update_availability(sender, update, Utc::now())
                    .await?;
                Ok(())
            }
            MessageKind::RequestAccepted => {
                let RequestRef { request_id } = envelope.payload()?;
                self.lifecycle.accept(sender, request_id, Utc::now()).await?;
                Ok(())
            }
            MessageKind::RequestDeclined => {
                let RequestRef { request_id } = envelope.payload()?;
                self.lifecycle.decline(sender, request_id).await
            }
            MessageKind::RequestStarted => {
                let RequestRef { request_id } = envelope.payload()?;
                self.lifecycle.start(sender, request_id, Utc::now()).await?;
                Ok(())
            }
            MessageKind::RequestCompleted => {
                let RequestRef { request_id } = envelope.payload()?;
                self.lifecycle
                    .complete(sender, request_id, Utc::now())
                    .await?;
                Ok(())
            }
            MessageKind::RequestCancelled => {
                let RequestRef { request_id } = envelope.payload()?;
                self.lifecycle.cancel(sender, request_id, Utc::now()).await?;
                Ok(())
            }
        }
    }

    /// Stamp and relay a room message to every other member
    fn relay_to_room(
        &self,
        kind: MessageKind,
        sender: &Principal,
        envelope: InboundEnvelope,
    ) -> Result<()> {
        let room_id = envelope.room_id()?.to_string();
        if !self.hub.rooms_of(&sender.user_id)?.contains(&room_id) {
            return Err(DispatchError::Forbidden {
                reason: format!("user {} is not in room {}", sender.user_id, room_id),
            }
            .into());
        }

        let relay = RelayEnvelope::stamp(kind, &room_id, sender, envelope, Utc::now());
        let frame = encode_frame(&relay)?;
        let delivered = self
            .hub
            .send_to_room(&room_id, frame, Some(&sender.user_id))?;

        debug!(
            "Relayed {} from {} to {} members of room {}",
            kind, sender.user_id, delivered, room_id
        );
        Ok(())
    }

    async fn handle_service_request(
        &self,
        sender: &Principal,
        envelope: InboundEnvelope,
    ) -> Result<()> {
        let draft: NewServiceRequest = envelope.payload()?;
        let now = Utc::now();
        let request = self.lifecycle.create_request(sender, draft, now).await?;

        if request.status != RequestStatus::Broadcast {
            return Ok(());
        }

        // The customer already has request_created; an unreached request
        // stays open until the sweeper expires it
        match self.fan_out.fan_out(&request, now).await {
            Ok(report) if report.recipients() == 0 => info!(
                "No eligible workers for request {} yet; it stays open until {:?}",
                request.id, request.expires_at
            ),
            Ok(_) => {}
            Err(e) => warn!(
                "Fan-out for request {} failed, it stays open until {:?}: {}",
                request.id, request.expires_at, e
            ),
        }
        Ok(())
    }

    /// Tell the sender why their message failed
    fn reply_error(&self, sender: &Principal, err: &anyhow::Error) {
        let event = match DispatchError::classify(err) {
            Some(DispatchError::StateConflict { request_id, reason }) => {
                debug!("State conflict for {}: {}", sender.user_id, err);
                ServerEvent::RequestUnavailable {
                    request_id: request_id.parse().ok(),
                    reason: reason.clone(),
                }
            }
            Some(domain) => {
                debug!("Rejected message from {}: {}", sender.user_id, domain);
                ServerEvent::Error {
                    code: domain.code().to_string(),
                    message: domain.to_string(),
                }
            }
            None => {
                error!("Unexpected error handling message from {}: {:#}", sender.user_id, err);
                ServerEvent::Error {
                    code: "internal_error".to_string(),
                    message: "internal error".to_string(),
                }
            }
        };
        self.notifier.send_live(&sender.user_id, &event);
    }
}
