//! Outbound server events
//!
//! Every event goes out as a JSON object whose `type` field names the event,
//! stamped with the server time at encoding.

use crate::error::Result;
use crate::hub::connection::{encode_frame, Frame};
use crate::lifecycle::RequestStatus;
use crate::types::{GeoPoint, RequestId, ServiceRequest, Urgency, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client-facing view of a service request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub id: RequestId,
    pub customer_id: UserId,
    pub category: String,
    pub location: GeoPoint,
    pub urgency: Urgency,
    pub radius_km: f64,
    pub status: RequestStatus,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl From<&ServiceRequest> for RequestSummary {
    fn from(request: &ServiceRequest) -> Self {
        Self {
            id: request.id,
            customer_id: request.customer_id.clone(),
            category: request.category.clone(),
            location: request.location,
            urgency: request.urgency,
            radius_km: request.radius_km,
            status: request.status,
            description: request.description.clone(),
            expires_at: request.expires_at,
            scheduled_for: request.scheduled_for,
        }
    }
}

/// Events pushed from the server to connected clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Acknowledges a customer's new request
    RequestCreated { request: RequestSummary },
    /// Fan-out to an eligible worker
    NewServiceRequest {
        request: RequestSummary,
        distance_km: f64,
        eta_minutes: f64,
    },
    /// Tells the customer a worker accepted
    RequestAccepted {
        request_id: RequestId,
        worker_id: UserId,
        eta_minutes: Option<f64>,
    },
    /// Tells the winning worker the accept went through
    RequestConfirmed { request_id: RequestId },
    /// Tells a worker the request can no longer be taken
    RequestUnavailable {
        request_id: Option<RequestId>,
        reason: String,
    },
    /// Acknowledges a worker's decline
    RequestDeclined { request_id: RequestId },
    RequestStarted {
        request_id: RequestId,
        worker_id: UserId,
    },
    RequestCompleted {
        request_id: RequestId,
        worker_id: UserId,
    },
    RequestCancelled {
        request_id: RequestId,
        cancelled_by: UserId,
    },
    RequestExpired { request_id: RequestId },
    Pong,
    Error { code: String, message: String },
}

#[derive(Serialize)]
struct Stamped<'a> {
    #[serde(flatten)]
    event: &'a ServerEvent,
    timestamp: DateTime<Utc>,
}

impl ServerEvent {
    /// Wire name carried in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::RequestCreated { .. } => "request_created",
            ServerEvent::NewServiceRequest { .. } => "new_service_request",
            ServerEvent::RequestAccepted { .. } => "request_accepted",
            ServerEvent::RequestConfirmed { .. } => "request_confirmed",
            ServerEvent::RequestUnavailable { .. } => "request_unavailable",
            ServerEvent::RequestDeclined { .. } => "request_declined",
            ServerEvent::RequestStarted { .. } => "request_started",
            ServerEvent::RequestCompleted { .. } => "request_completed",
            ServerEvent::RequestCancelled { .. } => "request_cancelled",
            ServerEvent::RequestExpired { .. } => "request_expired",
            ServerEvent::Pong => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Serialize once with a server timestamp
    pub fn encode(&self) -> Result<Frame> {
        encode_frame(&Stamped {
            event: self,
            timestamp: Utc::now(),
        })
    }

    /// Title and body for the push fallback, if the event is worth a push
    pub fn push_text(&self) -> Option<(String, String)> {
        match self {
            ServerEvent::NewServiceRequest {
                request,
                distance_km,
                ..
            } => Some((
                "New service request".to_string(),
                format!("{} request {:.1} km away", request.category, distance_km),
            )),
            ServerEvent::RequestAccepted { .. } => Some((
                "Request accepted".to_string(),
                "A worker accepted your request".to_string(),
            )),
            ServerEvent::RequestStarted { .. } => Some((
                "Work started".to_string(),
                "Your worker has started the job".to_string(),
            )),
            ServerEvent::RequestCompleted { .. } => Some((
                "Job completed".to_string(),
                "Your request is complete, you can now rate the service".to_string(),
            )),
            ServerEvent::RequestCancelled { .. } => Some((
                "Request cancelled".to_string(),
                "The customer cancelled the request".to_string(),
            )),
            ServerEvent::RequestExpired { .. } => Some((
                "Request expired".to_string(),
                "No worker accepted the request in time".to_string(),
            )),
            _ => None,
        }
    }

    /// Request the event refers to, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerEvent::RequestCreated { request }
            | ServerEvent::NewServiceRequest { request, .. } => Some(request.id),
            ServerEvent::RequestAccepted { request_id, .. }
            | ServerEvent::RequestConfirmed { request_id }
            | ServerEvent::RequestDeclined { request_id }
            | ServerEvent::RequestStarted { request_id, .. }
            | ServerEvent::RequestCompleted { request_id, .. }
            | ServerEvent::RequestCancelled { request_id, .. }
            | ServerEvent::RequestExpired { request_id } => Some(*request_id),
            ServerEvent::RequestUnavailable { request_id, .. } => *request_id,
            ServerEvent::Pong | ServerEvent::Error { .. } => None,
        }
    }
}
