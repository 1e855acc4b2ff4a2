use std::collections::HashSet;

use agora_models::events::OutboundEvent;
use agora_models::{ConnectionId, Identity, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Outbound channel handle for one connection. Sends never block: the
/// transport loop drains the channel, so state mutation is decoupled from
/// socket I/O.
pub type EventSender = mpsc::UnboundedSender<OutboundEvent>;

struct ConnectionEntry {
    identity: Identity,
    sender: EventSender,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Single source of truth for which connections exist and which user owns
/// each. A connection belongs to at most one identity; a user may own any
/// number of simultaneous connections (multi-device).
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: ConnectionId, identity: Identity, sender: EventSender) {
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                identity,
                sender,
                created_at: Utc::now(),
            },
        );
        if let Identity::User(user_id) = identity {
            self.by_user.entry(user_id).or_default().insert(conn_id);
        }
    }

    /// Removes the connection and returns the identity it belonged to.
    /// The forward entry is removed first so no fan-out path can observe
    /// a user-index hit without a live sender.
    pub fn unregister(&self, conn_id: ConnectionId) -> Option<Identity> {
        let (_, entry) = self.connections.remove(&conn_id)?;
        if let Identity::User(user_id) = entry.identity {
            if let Some(mut conns) = self.by_user.get_mut(&user_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    drop(conns);
                    self.by_user.remove_if(&user_id, |_, set| set.is_empty());
                }
            }
        }
        Some(entry.identity)
    }

    pub fn lookup_user(&self, conn_id: ConnectionId) -> Option<Identity> {
        self.connections.get(&conn_id).map(|e| e.identity)
    }

    pub fn connections_for(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).map(|set| set.len()).unwrap_or(0)
    }

    /// Delivers an event to one connection. Returns false if the
    /// connection is gone or its transport loop has shut down.
    pub fn send(&self, conn_id: ConnectionId, event: OutboundEvent) -> bool {
        match self.connections.get(&conn_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel() -> (EventSender, mpsc::UnboundedReceiver<OutboundEvent>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let conn = ConnectionId::new();
        let (tx, _rx) = channel();
        registry.register(conn, Identity::User(1), tx);

        assert_eq!(registry.lookup_user(conn), Some(Identity::User(1)));
        assert_eq!(registry.connections_for(1), vec![conn]);
    }

    #[test]
    fn unregister_clears_both_indices() {
        let registry = ConnectionRegistry::new();
        let conn = ConnectionId::new();
        let (tx, _rx) = channel();
        registry.register(conn, Identity::User(1), tx);

        assert_eq!(registry.unregister(conn), Some(Identity::User(1)));
        assert_eq!(registry.lookup_user(conn), None);
        assert!(registry.connections_for(1).is_empty());
        assert_eq!(registry.connection_count(1), 0);
    }

    #[test]
    fn multi_device_connections() {
        let registry = ConnectionRegistry::new();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        registry.register(c1, Identity::User(9), tx1);
        registry.register(c2, Identity::User(9), tx2);

        assert_eq!(registry.connection_count(9), 2);
        registry.unregister(c1);
        assert_eq!(registry.connections_for(9), vec![c2]);
    }

    #[test]
    fn anonymous_connections_have_no_user_index() {
        let registry = ConnectionRegistry::new();
        let conn = ConnectionId::new();
        let (tx, _rx) = channel();
        registry.register(conn, Identity::Anonymous, tx);

        assert_eq!(registry.lookup_user(conn), Some(Identity::Anonymous));
        registry.unregister(conn);
        assert_eq!(registry.lookup_user(conn), None);
    }

    #[test]
    fn send_reaches_the_connection_channel() {
        let registry = ConnectionRegistry::new();
        let conn = ConnectionId::new();
        let (tx, mut rx) = channel();
        registry.register(conn, Identity::User(1), tx);

        assert!(registry.send(conn, OutboundEvent::new("ping", json!({}))));
        assert_eq!(rx.try_recv().unwrap().event, "ping");

        registry.unregister(conn);
        assert!(!registry.send(conn, OutboundEvent::new("ping", json!({}))));
    }
}
