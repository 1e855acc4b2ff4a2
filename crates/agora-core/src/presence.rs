use std::sync::Arc;
use std::time::Duration;

use agora_models::events::EVENT_PRESENCE_UPDATE;
use agora_models::presence::{PresenceRecord, PresenceUpdate};
use agora_models::room::RoomName;
use agora_models::{ConnectionId, UserId};
use dashmap::DashMap;
use tokio::task::AbortHandle;

use crate::rooms::RoomManager;
use crate::users::UserStore;

/// Connection-counted presence per user. Only the 0→1 transition
/// broadcasts online and only 1→0 broadcasts offline; the offline edge is
/// additionally deferred by a grace period so a quick reconnect (page
/// reload, network blip) never flickers through other users' UIs.
pub struct PresenceTracker {
    records: DashMap<UserId, PresenceRecord>,
    pending_offline: DashMap<UserId, AbortHandle>,
    rooms: Arc<RoomManager>,
    users: Arc<dyn UserStore>,
    offline_grace: Duration,
}

impl PresenceTracker {
    pub fn new(rooms: Arc<RoomManager>, users: Arc<dyn UserStore>, offline_grace: Duration) -> Self {
        Self {
            records: DashMap::new(),
            pending_offline: DashMap::new(),
            rooms,
            users,
            offline_grace,
        }
    }

    pub fn set_online(&self, user_id: UserId, conn_id: ConnectionId) {
        if let Some((_, pending)) = self.pending_offline.remove(&user_id) {
            pending.abort();
        }

        let announce = {
            let mut record = self
                .records
                .entry(user_id)
                .or_insert_with(|| PresenceRecord::new(user_id));
            record.connections += 1;
            // A cancelled pending-offline leaves the record online; no
            // re-announce in that case.
            let came_online = record.connections == 1 && !record.online;
            record.online = true;
            came_online && record.show_online_status
        };

        tracing::debug!(user_id, %conn_id, "presence connection opened");
        if announce {
            let update = PresenceUpdate {
                user_id,
                online: true,
                last_seen: None,
            };
            self.rooms.broadcast(
                &RoomName::User(user_id),
                EVENT_PRESENCE_UPDATE,
                serde_json::to_value(&update).unwrap_or_default(),
                None,
            );
        }
    }

    pub fn set_offline(self: &Arc<Self>, user_id: UserId, conn_id: ConnectionId) {
        let last_connection = {
            let Some(mut record) = self.records.get_mut(&user_id) else {
                return;
            };
            record.connections = record.connections.saturating_sub(1);
            record.connections == 0
        };
        tracing::debug!(user_id, %conn_id, "presence connection closed");
        if !last_connection {
            return;
        }

        let tracker = self.clone();
        let grace = self.offline_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            tracker.commit_offline(user_id).await;
        })
        .abort_handle();
        if let Some(previous) = self.pending_offline.insert(user_id, handle) {
            previous.abort();
        }
    }

    /// Runs after the grace period; the user may have reconnected in the
    /// meantime, in which case this is a no-op.
    async fn commit_offline(&self, user_id: UserId) {
        self.pending_offline.remove(&user_id);
        let now = chrono::Utc::now();

        let announce = {
            let Some(mut record) = self.records.get_mut(&user_id) else {
                return;
            };
            if record.connections > 0 || !record.online {
                return;
            }
            record.online = false;
            record.last_seen = Some(now);
            record.show_online_status.then(|| PresenceUpdate {
                user_id,
                online: false,
                last_seen: record.show_last_seen.then_some(now),
            })
        };

        // Last-seen persistence belongs to the user store; presence only
        // triggers it.
        self.users.record_last_seen(user_id, now).await;

        if let Some(update) = announce {
            self.rooms.broadcast(
                &RoomName::User(user_id),
                EVENT_PRESENCE_UPDATE,
                serde_json::to_value(&update).unwrap_or_default(),
                None,
            );
        }
    }

    /// Preference changes gate future broadcasts; the internal record
    /// always keeps the true state regardless.
    pub fn update_preferences(&self, user_id: UserId, show_online_status: bool, show_last_seen: bool) {
        let mut record = self
            .records
            .entry(user_id)
            .or_insert_with(|| PresenceRecord::new(user_id));
        record.show_online_status = show_online_status;
        record.show_last_seen = show_last_seen;
    }

    pub fn get(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.records.get(&user_id).map(|r| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::users::{InMemoryUserStore, UserProfile};
    use agora_models::events::OutboundEvent;
    use agora_models::Identity;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const GRACE: Duration = Duration::from_millis(500);

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        store: Arc<InMemoryUserStore>,
        tracker: Arc<PresenceTracker>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let store = Arc::new(InMemoryUserStore::new());
        store.insert(UserProfile::active(1));
        let tracker = Arc::new(PresenceTracker::new(rooms.clone(), store.clone(), GRACE));
        Fixture {
            registry,
            rooms,
            store,
            tracker,
        }
    }

    /// A watcher connection subscribed to user 1's channel.
    fn watch(f: &Fixture, user: UserId) -> UnboundedReceiver<OutboundEvent> {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        f.registry.register(conn, Identity::User(99), tx);
        f.rooms.join(conn, RoomName::User(user));
        rx
    }

    async fn settle() {
        // Paused runtime: sleeping past the grace period auto-advances the
        // clock and runs any pending offline commit.
        tokio::time::sleep(GRACE * 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn online_broadcast_only_on_first_connection() {
        let f = fixture();
        let mut rx = watch(&f, 1);
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());

        f.tracker.set_online(1, c1);
        assert_eq!(rx.try_recv().unwrap().event, EVENT_PRESENCE_UPDATE);
        f.tracker.set_online(1, c2);
        assert!(rx.try_recv().is_err(), "second device must not re-announce");
        assert_eq!(f.tracker.get(1).unwrap().connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_only_when_last_connection_closes() {
        let f = fixture();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        f.tracker.set_online(1, c1);
        f.tracker.set_online(1, c2);
        let mut rx = watch(&f, 1);

        f.tracker.set_offline(1, c1);
        settle().await;
        assert!(f.tracker.get(1).unwrap().online, "one device still open");
        assert!(rx.try_recv().is_err());

        f.tracker.set_offline(1, c2);
        settle().await;
        let record = f.tracker.get(1).unwrap();
        assert!(!record.online);
        assert!(record.last_seen.is_some());
        let update = rx.try_recv().unwrap();
        assert_eq!(update.event, EVENT_PRESENCE_UPDATE);
        assert_eq!(update.data["online"], serde_json::json!(false));
        // Persisted through the user store.
        assert!(f.store.find_by_id(1).await.unwrap().last_seen.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_cancels_offline() {
        let f = fixture();
        let c1 = ConnectionId::new();
        f.tracker.set_online(1, c1);
        let mut rx = watch(&f, 1);

        f.tracker.set_offline(1, c1);
        // Reconnect before the grace period elapses.
        tokio::time::sleep(GRACE / 2).await;
        let c2 = ConnectionId::new();
        f.tracker.set_online(1, c2);

        settle().await;
        assert!(f.tracker.get(1).unwrap().online);
        assert!(
            rx.try_recv().is_err(),
            "neither offline nor re-online may be broadcast on flicker"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_online_status_suppresses_broadcasts() {
        let f = fixture();
        f.tracker.update_preferences(1, false, false);
        let mut rx = watch(&f, 1);
        let c1 = ConnectionId::new();

        f.tracker.set_online(1, c1);
        assert!(rx.try_recv().is_err());
        // True state is still recorded internally.
        assert!(f.tracker.get(1).unwrap().online);

        f.tracker.set_offline(1, c1);
        settle().await;
        assert!(rx.try_recv().is_err());
        assert!(!f.tracker.get(1).unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_last_seen_is_withheld_from_offline_broadcast() {
        let f = fixture();
        f.tracker.update_preferences(1, true, false);
        let c1 = ConnectionId::new();
        f.tracker.set_online(1, c1);
        let mut rx = watch(&f, 1);

        f.tracker.set_offline(1, c1);
        settle().await;
        let update = rx.try_recv().unwrap();
        assert_eq!(update.data["online"], serde_json::json!(false));
        assert!(update.data.get("last_seen").is_none());
        // The record itself still knows.
        assert!(f.tracker.get(1).unwrap().last_seen.is_some());
    }
}
