use std::sync::Arc;

use agora_models::room::RoomName;
use agora_models::UserId;
use serde_json::Value;

use crate::rooms::RoomManager;

/// The boundary external collaborators publish through: CRUD routes push
/// `post-updated`/`follow_update` style events after a write, the
/// periodic trending job pushes `trending:update`. A cloneable handle is
/// injected wherever needed instead of exposing ambient broadcast
/// globals, so the dependency is explicit and mockable.
#[derive(Clone)]
pub struct BroadcastGateway {
    rooms: Arc<RoomManager>,
}

impl BroadcastGateway {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self { rooms }
    }

    /// Fans an event out to every connection in the room. Returns the
    /// number of connections reached.
    pub fn publish(&self, room: &RoomName, event: &str, payload: Value) -> usize {
        let delivered = self.rooms.broadcast(room, event, payload, None);
        tracing::debug!(room = %room, event, delivered, "gateway publish");
        delivered
    }

    /// Multi-device delivery to one user, independent of room membership.
    pub fn publish_to_user(&self, user_id: UserId, event: &str, payload: Value) -> usize {
        let delivered = self.rooms.broadcast_to_user(user_id, event, payload);
        tracing::debug!(user_id, event, delivered, "gateway publish to user");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use agora_models::{ConnectionId, Identity};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn external_collaborators_reach_room_members() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let gateway = BroadcastGateway::new(rooms.clone());

        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(conn, Identity::Anonymous, tx);
        rooms.join(conn, RoomName::Post(42));

        // A CRUD route announcing an edit.
        let delivered = gateway.publish(&RoomName::Post(42), "post-updated", json!({"id": "42"}));
        assert_eq!(delivered, 1);
        assert_eq!(rx.try_recv().unwrap().event, "post-updated");

        // The trending job reaches only trending subscribers.
        assert_eq!(gateway.publish(&RoomName::Trending, "trending:update", json!([])), 0);
    }
}
