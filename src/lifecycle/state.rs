//! Service request states and the transition table
//!
//! Status only ever moves forward along the table below; the lifecycle
//! manager checks every write against it before issuing the store CAS.
//!
//! | From          | To                                  |
//! |---------------|-------------------------------------|
//! | `scheduled`   | `broadcast`, `cancelled`            |
//! | `broadcast`   | `accepted`, `cancelled`, `expired`  |
//! | `accepted`    | `in_progress`, `cancelled`          |
//! | `in_progress` | `completed`, `cancelled`            |
//! | terminal      | nothing                             |

use serde::{Deserialize, Serialize};

/// Possible states of a service request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting for its scheduled time before being broadcast
    Scheduled,
    /// Open for acceptance by notified workers
    #[serde(alias = "pending")]
    Broadcast,
    /// Claimed by exactly one worker
    Accepted,
    /// Worker has started the job
    InProgress,
    /// Job finished (terminal state)
    Completed,
    /// Cancelled by the customer (terminal state)
    Cancelled,
    /// Deadline passed without acceptance (terminal state)
    Expired,
}

impl RequestStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Scheduled => "scheduled",
            RequestStatus::Broadcast => "broadcast",
            RequestStatus::Accepted => "accepted",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }

    /// Whether a request in this status holds its assigned worker
    pub fn holds_worker(&self) -> bool {
        matches!(self, RequestStatus::Accepted | RequestStatus::InProgress)
    }

    /// Check a single step against the transition table
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Scheduled, Broadcast)
                | (Scheduled, Cancelled)
                | (Broadcast, Accepted)
                | (Broadcast, Cancelled)
                | (Broadcast, Expired)
                | (Accepted, InProgress)
                | (Accepted, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
