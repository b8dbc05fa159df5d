//! Inbound wire envelopes and the closed set of message kinds

use crate::error::{DispatchError, Result};
use crate::types::{Principal, PrincipalKind, RequestId, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Every message type the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Chat,
    Typing,
    ReadReceipt,
    Ping,
    ServiceRequest,
    WorkerAvailability,
    RequestAccepted,
    RequestDeclined,
    JoinRoom,
    LeaveRoom,
    RequestStarted,
    RequestCompleted,
    RequestCancelled,
}

impl MessageKind {
    /// Resolve a wire `type` string; `None` for unknown types
    pub fn from_wire(kind: &str) -> Option<Self> {
        let kind = match kind {
            "chat" => MessageKind::Chat,
            "typing" => MessageKind::Typing,
            "read" | "read_receipt" => MessageKind::ReadReceipt,
            "ping" => MessageKind::Ping,
            "service_request" => MessageKind::ServiceRequest,
            "worker_availability" => MessageKind::WorkerAvailability,
            "request_accepted" => MessageKind::RequestAccepted,
            "request_declined" => MessageKind::RequestDeclined,
            "join_room" => MessageKind::JoinRoom,
            "leave_room" => MessageKind::LeaveRoom,
            "request_started" => MessageKind::RequestStarted,
            "request_completed" => MessageKind::RequestCompleted,
            "request_cancelled" => MessageKind::RequestCancelled,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::Typing => "typing",
            MessageKind::ReadReceipt => "read_receipt",
            MessageKind::Ping => "ping",
            MessageKind::ServiceRequest => "service_request",
            MessageKind::WorkerAvailability => "worker_availability",
            MessageKind::RequestAccepted => "request_accepted",
            MessageKind::RequestDeclined => "request_declined",
            MessageKind::JoinRoom => "join_room",
            MessageKind::LeaveRoom => "leave_room",
            MessageKind::RequestStarted => "request_started",
            MessageKind::RequestCompleted => "request_completed",
            MessageKind::RequestCancelled => "request_cancelled",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room ids arrive as strings from some clients and numbers from others
fn deserialize_room_id<'de, D>(deserializer: D) -> std::result::Result<Option<RoomId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A decoded inbound message
///
/// Client-supplied `sender_id`, `sender_type` and `timestamp` are not read;
/// the server stamps those from the authenticated principal.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "deserialize_room_id")]
    pub chat_room_id: Option<RoomId>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl InboundEnvelope {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            DispatchError::validation(format!("malformed envelope: {}", e)).into()
        })
    }

    pub fn room_id(&self) -> Result<&str> {
        self.chat_room_id
            .as_deref()
            .ok_or_else(|| DispatchError::validation(format!("{} needs chat_room_id", self.kind)).into())
    }

    /// Decode the `data` payload into a typed body
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| DispatchError::validation(format!("{} needs a data payload", self.kind)))?;
        serde_json::from_value(data).map_err(|e| {
            DispatchError::validation(format!("invalid {} payload: {}", self.kind, e)).into()
        })
    }
}

/// Payload naming the request a lifecycle message acts on
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RequestRef {
    pub request_id: RequestId,
}

/// A room message as relayed to the other members, stamped by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub chat_room_id: RoomId,
    pub sender_id: UserId,
    pub sender_type: PrincipalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl RelayEnvelope {
    pub fn stamp(
        kind: MessageKind,
        room_id: &str,
        sender: &Principal,
        envelope: InboundEnvelope,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            chat_room_id: room_id.to_string(),
            sender_id: sender.user_id.clone(),
            sender_type: sender.kind,
            content: envelope.content,
            data: envelope.data,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_wire_names() {
        assert_eq!(MessageKind::from_wire("read"), Some(MessageKind::ReadReceipt));
        assert_eq!(
            MessageKind::from_wire("read_receipt"),
            Some(MessageKind::ReadReceipt)
        );
        assert_eq!(MessageKind::from_wire("video_call"), None);
        assert_eq!(MessageKind::ReadReceipt.as_str(), "read_receipt");
    }

    #[test]
    fn test_envelope_ignores_client_sender_fields() {
        let raw = r#"{"type":"chat","chat_room_id":42,"sender_id":"spoofed",
            "sender_type":"worker","content":"hi","timestamp":"2001-01-01T00:00:00Z"}"#;
        let envelope = InboundEnvelope::parse(raw).unwrap();
        assert_eq!(envelope.chat_room_id.as_deref(), Some("42"));

        let sender = Principal::customer("c1");
        let relay = RelayEnvelope::stamp(MessageKind::Chat, "42", &sender, envelope, Utc::now());
        assert_eq!(relay.sender_id, "c1");
        assert_eq!(relay.sender_type, PrincipalKind::Customer);
        assert_eq!(relay.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_payload_errors_are_validation() {
        let envelope = InboundEnvelope::parse(r#"{"type":"request_accepted"}"#).unwrap();
        let err = envelope.payload::<RequestRef>().unwrap_err();
        assert!(matches!(
            DispatchError::classify(&err),
            Some(DispatchError::Validation { .. })
        ));

        assert!(InboundEnvelope::parse("not json").is_err());
        assert!(envelope.room_id().is_err());
    }
}
