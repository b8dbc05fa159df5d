//! Live connection state owned by the hub

use crate::types::{Principal, PrincipalKind, UserId};
use crate::utils::{current_timestamp, generate_connection_id};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A serialized outbound frame, shared between every recipient
pub type Frame = Arc<String>;

/// Serialize an event once so it can be fanned out without re-encoding
pub fn encode_frame<T: Serialize>(event: &T) -> crate::error::Result<Frame> {
    Ok(Arc::new(serde_json::to_string(event)?))
}

/// Outcome of offering a frame to a connection's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame accepted by the queue
    Queued,
    /// Queue at capacity; frame dropped for this recipient
    QueueFull,
    /// Connection already closed
    Closed,
}

impl SendOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued)
    }
}

/// One live transport for an authenticated principal
///
/// The outbound queue sender is held behind a mutex so that [`Connection::close`]
/// can drop it exactly once; the writer task then drains what is left and
/// stops, and the cancellation token stops the reader.
#[derive(Debug)]
pub struct Connection {
    pub conn_id: Uuid,
    pub principal: Principal,
    pub connected_at: DateTime<Utc>,
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    cancel: CancellationToken,
    dropped_frames: AtomicU64,
}

impl Connection {
    /// Create a connection with a bounded outbound queue
    pub fn new(principal: Principal, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let connection = Arc::new(Self {
            conn_id: generate_connection_id(),
            principal,
            connected_at: current_timestamp(),
            sender: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
            dropped_frames: AtomicU64::new(0),
        });
        (connection, rx)
    }

    pub fn user_id(&self) -> &UserId {
        &self.principal.user_id
    }

    pub fn kind(&self) -> PrincipalKind {
        self.principal.kind
    }

    /// Offer a frame without waiting; never applies backpressure
    pub fn send(&self, frame: Frame) -> SendOutcome {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(_) => return SendOutcome::Closed,
        };
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };

        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                SendOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Close the outbound queue and cancel the task pair
    ///
    /// Returns `true` only for the call that actually closed the connection.
    pub fn close(&self) -> bool {
        let taken = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if taken.is_some() {
            self.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token raised when the connection is closed
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Frames dropped because the queue was full
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}
