//! Connection registry with room membership
//!
//! The registry and both membership indexes (room -> members, user -> rooms)
//! live behind one mutex so every update to them is a single critical
//! section. The mutex is never held across an await; sends use `try_send`.

use crate::error::{DispatchError, Result};
use crate::hub::connection::{Connection, Frame, SendOutcome};
use crate::metrics::MetricsCollector;
use crate::types::{RoomId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct HubState {
    connections: HashMap<UserId, Arc<Connection>>,
    rooms: HashMap<RoomId, HashSet<UserId>>,
    memberships: HashMap<UserId, HashSet<RoomId>>,
}

impl HubState {
    /// Remove a user from every room, dropping rooms that become empty
    fn purge_memberships(&mut self, user_id: &str) {
        if let Some(rooms) = self.memberships.remove(user_id) {
            for room_id in rooms {
                if let Some(members) = self.rooms.get_mut(&room_id) {
                    members.remove(user_id);
                    if members.is_empty() {
                        self.rooms.remove(&room_id);
                    }
                }
            }
        }
    }
}

/// Snapshot of hub occupancy for stats endpoints
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub customers: usize,
    pub workers: usize,
    pub rooms: usize,
}

/// Live registry of connected principals
pub struct ConnectionHub {
    state: Mutex<HubState>,
    queue_capacity: usize,
    metrics: Arc<MetricsCollector>,
}

impl ConnectionHub {
    /// Create a hub whose connections get outbound queues of `queue_capacity`
    pub fn new(queue_capacity: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            queue_capacity,
            metrics,
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>> {
        Ok(self
            .state
            .lock()
            .map_err(|_| DispatchError::lock_poisoned("hub registry"))?)
    }

    /// Insert a connection, replacing and closing any older one for the same user
    ///
    /// The replacing connection starts with no room memberships.
    pub fn register(&self, connection: Arc<Connection>) -> Result<()> {
        let user_id = connection.user_id().clone();
        let replaced = {
            let mut state = self.lock()?;
            let previous = state.connections.insert(user_id.clone(), connection.clone());
            if previous.is_some() {
                state.purge_memberships(&user_id);
            }
            previous
        };

        if let Some(old) = &replaced {
            old.close();
            info!(
                "Replaced connection {} for user {} with {}",
                old.conn_id, user_id, connection.conn_id
            );
        } else {
            info!(
                "Registered {} connection {} for user {}",
                connection.kind(),
                connection.conn_id,
                user_id
            );
        }

        self.metrics.record_connection_opened(replaced.is_some());
        Ok(())
    }

    /// Remove a connection if it is still the current one for its user
    ///
    /// Idempotent: unregistering a replaced or already removed connection only
    /// makes sure its queue is closed.
    pub fn unregister(&self, connection: &Connection) -> Result<bool> {
        let user_id = connection.user_id();
        let removed = {
            let mut state = self.lock()?;
            let is_current = state
                .connections
                .get(user_id)
                .is_some_and(|current| current.conn_id == connection.conn_id);
            if is_current {
                state.connections.remove(user_id);
                state.purge_memberships(user_id);
            }
            is_current
        };

        connection.close();
        if removed {
            info!(
                "Unregistered connection {} for user {}",
                connection.conn_id, user_id
            );
            self.metrics.record_connection_closed();
        }
        Ok(removed)
    }

    /// Add a user to a room; the user must have a live connection
    pub fn join_room(&self, room_id: &str, user_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        if !state.connections.contains_key(user_id) {
            return Err(DispatchError::validation(format!(
                "user {} has no live connection",
                user_id
            ))
            .into());
        }

        state
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        state
            .memberships
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());

        debug!("User {} joined room {}", user_id, room_id);
        Ok(())
    }

    /// Remove a user from a room; returns whether they were a member
    pub fn leave_room(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let mut state = self.lock()?;

        let was_member = match state.rooms.get_mut(room_id) {
            Some(members) => {
                let removed = members.remove(user_id);
                if members.is_empty() {
                    state.rooms.remove(room_id);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = state.memberships.get_mut(user_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                state.memberships.remove(user_id);
            }
        }

        if was_member {
            debug!("User {} left room {}", user_id, room_id);
        }
        Ok(was_member)
    }

    fn offer(&self, connection: &Connection, frame: Frame, scope: &str) -> bool {
        match connection.send(frame) {
            SendOutcome::Queued => {
                self.metrics.record_frame_delivered(scope);
                true
            }
            SendOutcome::QueueFull => {
                self.metrics.record_frame_dropped("queue_full");
                warn!(
                    "Outbound queue full for user {}, dropped frame ({} dropped so far)",
                    connection.user_id(),
                    connection.drop_count()
                );
                false
            }
            SendOutcome::Closed => {
                self.metrics.record_frame_dropped("closed");
                debug!(
                    "Connection {} for user {} already closed, frame discarded",
                    connection.conn_id,
                    connection.user_id()
                );
                false
            }
        }
    }

    /// Best-effort unicast; `false` means the caller should fall back to push
    pub fn send_to_user(&self, user_id: &str, frame: Frame) -> Result<bool> {
        let state = self.lock()?;
        match state.connections.get(user_id) {
            Some(connection) => Ok(self.offer(connection, frame, "user")),
            None => Ok(false),
        }
    }

    /// Deliver to every current room member except `exclude`
    ///
    /// Returns the number of members whose queue accepted the frame.
    pub fn send_to_room(&self, room_id: &str, frame: Frame, exclude: Option<&str>) -> Result<usize> {
        let state = self.lock()?;
        let Some(members) = state.rooms.get(room_id) else {
            return Ok(0);
        };

        let mut delivered = 0;
        for member in members {
            if exclude == Some(member.as_str()) {
                continue;
            }
            if let Some(connection) = state.connections.get(member) {
                if self.offer(connection, frame.clone(), "room") {
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// Deliver to every registered connection
    pub fn broadcast(&self, frame: Frame) -> Result<usize> {
        let state = self.lock()?;
        Ok(state
            .connections
            .values()
            .filter(|connection| self.offer(connection, frame.clone(), "broadcast"))
            .count())
    }

    pub fn is_online(&self, user_id: &str) -> Result<bool> {
        Ok(self.lock()?.connections.contains_key(user_id))
    }

    /// Current connection for a user, if any
    pub fn connection(&self, user_id: &str) -> Result<Option<Arc<Connection>>> {
        Ok(self.lock()?.connections.get(user_id).cloned())
    }

    pub fn connection_count(&self) -> Result<usize> {
        Ok(self.lock()?.connections.len())
    }

    /// Members of a room, sorted for stable output
    pub fn room_members(&self, room_id: &str) -> Result<Vec<UserId>> {
        let state = self.lock()?;
        let mut members: Vec<UserId> = state
            .rooms
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    /// Rooms a user currently belongs to, sorted
    pub fn rooms_of(&self, user_id: &str) -> Result<Vec<RoomId>> {
        let state = self.lock()?;
        let mut rooms: Vec<RoomId> = state
            .memberships
            .get(user_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        Ok(rooms)
    }

    pub fn stats(&self) -> Result<HubStats> {
        use crate::types::PrincipalKind;

        let state = self.lock()?;
        let workers = state
            .connections
            .values()
            .filter(|c| c.kind() == PrincipalKind::Worker)
            .count();
        Ok(HubStats {
            connections: state.connections.len(),
            customers: state.connections.len() - workers,
            workers,
            rooms: state.rooms.len(),
        })
    }

    /// Close every connection and clear the registry
    pub fn shutdown(&self) -> Result<usize> {
        let drained: Vec<Arc<Connection>> = {
            let mut state = self.lock()?;
            state.rooms.clear();
            state.memberships.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };

        for connection in &drained {
            connection.close();
            self.metrics.record_connection_closed();
        }
        info!("Hub shut down, closed {} connections", drained.len());
        Ok(drained.len())
    }
}
