use std::collections::HashSet;
use std::sync::Arc;

use agora_models::events::OutboundEvent;
use agora_models::room::RoomName;
use agora_models::{ConnectionId, UserId};
use dashmap::DashMap;
use serde_json::Value;

use crate::registry::ConnectionRegistry;

/// Tracks which rooms each connection has joined and fans events out to
/// room members. Rooms exist implicitly: created on first join, dropped
/// when the last member leaves.
pub struct RoomManager {
    registry: Arc<ConnectionRegistry>,
    rooms: DashMap<RoomName, HashSet<ConnectionId>>,
    memberships: DashMap<ConnectionId, HashSet<RoomName>>,
}

impl RoomManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    /// Idempotent: joining a room the connection is already in changes
    /// nothing (and causes no duplicate delivery).
    pub fn join(&self, conn_id: ConnectionId, room: RoomName) {
        self.rooms.entry(room.clone()).or_default().insert(conn_id);
        self.memberships.entry(conn_id).or_default().insert(room);
    }

    /// Leaving a room that was never joined is a no-op, not an error.
    pub fn leave(&self, conn_id: ConnectionId, room: &RoomName) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove_if(room, |_, m| m.is_empty());
            }
        }
        if let Some(mut joined) = self.memberships.get_mut(&conn_id) {
            joined.remove(room);
        }
    }

    /// Teardown cleanup: removes the connection from every room it had
    /// joined. No membership entry survives the connection.
    pub fn remove_connection(&self, conn_id: ConnectionId) {
        let joined = match self.memberships.remove(&conn_id) {
            Some((_, rooms)) => rooms,
            None => return,
        };
        for room in joined {
            if let Some(mut members) = self.rooms.get_mut(&room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    drop(members);
                    self.rooms.remove_if(&room, |_, m| m.is_empty());
                }
            }
        }
    }

    /// Drops a whole room, detaching every remaining member. Used when an
    /// ephemeral room (e.g. a call channel) reaches the end of its life
    /// before its members disconnect.
    pub fn remove_room(&self, room: &RoomName) {
        let Some((_, members)) = self.rooms.remove(room) else {
            return;
        };
        for conn_id in members {
            if let Some(mut joined) = self.memberships.get_mut(&conn_id) {
                joined.remove(room);
            }
        }
    }

    pub fn members(&self, room: &RoomName) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, conn_id: ConnectionId, room: &RoomName) -> bool {
        self.rooms
            .get(room)
            .map(|set| set.contains(&conn_id))
            .unwrap_or(false)
    }

    /// Fans an event out to every member of the room. Membership is
    /// snapshotted before sending, so mutation never waits on delivery.
    /// Returns the number of connections the event was handed to.
    pub fn broadcast(
        &self,
        room: &RoomName,
        event: &str,
        payload: Value,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let members = self.members(room);
        let mut delivered = 0;
        for conn_id in members {
            if Some(conn_id) == exclude {
                continue;
            }
            if self.registry.send(conn_id, OutboundEvent::new(event, payload.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Multi-device delivery: every connection currently owned by the
    /// user receives the event, whether or not it joined any room.
    pub fn broadcast_to_user(&self, user_id: UserId, event: &str, payload: Value) -> usize {
        let mut delivered = 0;
        for conn_id in self.registry.connections_for(user_id) {
            if self.registry.send(conn_id, OutboundEvent::new(event, payload.clone())) {
                delivered += 1;
            }
        }
        delivered
    }
}
