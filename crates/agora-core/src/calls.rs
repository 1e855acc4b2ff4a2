use std::sync::Arc;
use std::time::Duration;

use agora_models::call::{CallId, CallInfo, CallState, EndReason, MediaKind};
use agora_models::events::{
    CallAccepted, CallDeclined, CallEnded, CallMissed, CallRinging, EVENT_CALL_ACCEPTED,
    EVENT_CALL_DECLINED, EVENT_CALL_ENDED, EVENT_CALL_MISSED, EVENT_CALL_RINGING,
};
use agora_models::room::RoomName;
use agora_models::{ConnectionId, Identity, UserId};
use dashmap::DashMap;
use tokio::task::AbortHandle;

use crate::error::CoreError;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;

struct CallRecord {
    info: CallInfo,
    /// Pending ring-timeout task. Aborted on any transition out of
    /// `Ringing`, so a stale timeout can never fire after the call has
    /// already been resolved.
    ring_timer: Option<AbortHandle>,
}

/// State machine per call id. All transitions go through the DashMap
/// entry lock, which makes each check-and-set atomic per call: exactly
/// one accept wins the race out of `Ringing`, everyone else observes the
/// already-transitioned state.
pub struct CallManager {
    calls: DashMap<CallId, CallRecord>,
    rooms: Arc<RoomManager>,
    registry: Arc<ConnectionRegistry>,
    ring_timeout: Duration,
    /// How long a terminal call is kept around so late signaling gets a
    /// proper rejection instead of an unknown-call miss.
    retention: Duration,
}

impl CallManager {
    pub fn new(
        rooms: Arc<RoomManager>,
        registry: Arc<ConnectionRegistry>,
        ring_timeout: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            calls: DashMap::new(),
            rooms,
            registry,
            ring_timeout,
            retention,
        }
    }

    pub fn get(&self, call_id: CallId) -> Option<CallInfo> {
        self.calls.get(&call_id).map(|r| r.info.clone())
    }

    /// Creates a call in `Ringing`, rings every connection of the target
    /// (and the caller's own devices, for outgoing-call UI), and arms the
    /// ring timeout.
    pub fn initiate(
        self: &Arc<Self>,
        caller: UserId,
        target: UserId,
        media: MediaKind,
    ) -> CallInfo {
        let call_id = CallId::new();
        let info = CallInfo {
            call_id,
            caller,
            targets: vec![target],
            media,
            state: CallState::Ringing,
            created_at: chrono::Utc::now(),
            accepted_at: None,
            ended_at: None,
            end_reason: None,
        };

        // Every currently-open participant connection follows the call
        // through its per-call room.
        let call_room = RoomName::Call(call_id);
        for user in info.participants() {
            for conn in self.registry.connections_for(user) {
                self.rooms.join(conn, call_room.clone());
            }
        }

        let manager = self.clone();
        let timeout = self.ring_timeout;
        let ring_timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.ring_timeout_fired(call_id);
        })
        .abort_handle();

        self.calls.insert(
            call_id,
            CallRecord {
                info: info.clone(),
                ring_timer: Some(ring_timer),
            },
        );

        let ringing = CallRinging {
            call_id,
            from: caller,
            media,
        };
        let delivered = self.rooms.broadcast(
            &call_room,
            EVENT_CALL_RINGING,
            serde_json::to_value(&ringing).unwrap_or_default(),
            None,
        );
        tracing::info!(%call_id, caller, target, ?media, delivered, "call initiated");
        info
    }

    /// First accepter wins. Any accept arriving after the call left
    /// `Ringing` (raced by another device, declined, or timed out) fails
    /// with `StaleCall` and changes nothing.
    pub fn accept(
        self: &Arc<Self>,
        call_id: CallId,
        accepter_conn: ConnectionId,
    ) -> Result<CallInfo, CoreError> {
        let user = self.participant_for(call_id, accepter_conn)?;
        let (info, timer) = {
            let mut record = self
                .calls
                .get_mut(&call_id)
                .ok_or(CoreError::StaleCall(call_id))?;
            if !record.info.targets.contains(&user) {
                return Err(CoreError::InvalidRelayTarget(call_id));
            }
            if record.info.state != CallState::Ringing {
                return Err(CoreError::StaleCall(call_id));
            }
            record.info.state = CallState::Accepted;
            record.info.accepted_at = Some(chrono::Utc::now());
            (record.info.clone(), record.ring_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        // Both sides' devices see the accept; a target's other devices
        // read it as "call taken elsewhere" and stop ringing.
        let payload = CallAccepted { call_id, by: user };
        self.notify(&info, EVENT_CALL_ACCEPTED, serde_json::to_value(&payload).unwrap_or_default());
        tracing::info!(%call_id, by = user, "call accepted");
        Ok(info)
    }

    pub fn decline(
        self: &Arc<Self>,
        call_id: CallId,
        decliner_conn: ConnectionId,
    ) -> Result<CallInfo, CoreError> {
        let user = self.participant_for(call_id, decliner_conn)?;
        let (info, timer) = {
            let mut record = self
                .calls
                .get_mut(&call_id)
                .ok_or(CoreError::StaleCall(call_id))?;
            if !record.info.targets.contains(&user) {
                return Err(CoreError::InvalidRelayTarget(call_id));
            }
            if record.info.state != CallState::Ringing {
                return Err(CoreError::StaleCall(call_id));
            }
            record.info.state = CallState::Declined;
            record.info.ended_at = Some(chrono::Utc::now());
            record.info.end_reason = Some(EndReason::Declined);
            (record.info.clone(), record.ring_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        let payload = CallDeclined { call_id, by: user };
        self.notify(&info, EVENT_CALL_DECLINED, serde_json::to_value(&payload).unwrap_or_default());
        tracing::info!(%call_id, by = user, "call declined");
        self.schedule_reap(call_id);
        Ok(info)
    }

    /// Ends a ringing or active call. Idempotent: a second end (or an end
    /// racing a decline/timeout) is a silent no-op returning `Ok(None)`,
    /// with no duplicate notification.
    pub fn end(
        self: &Arc<Self>,
        call_id: CallId,
        by_user: UserId,
        reason: EndReason,
    ) -> Result<Option<CallInfo>, CoreError> {
        let outcome = {
            let Some(mut record) = self.calls.get_mut(&call_id) else {
                // Already reaped; ending it again is a no-op.
                return Ok(None);
            };
            if !record.info.is_participant(by_user) {
                return Err(CoreError::InvalidRelayTarget(call_id));
            }
            if record.info.state.is_terminal() {
                None
            } else {
                record.info.state = CallState::Ended;
                record.info.ended_at = Some(chrono::Utc::now());
                record.info.end_reason = Some(reason);
                Some((record.info.clone(), record.ring_timer.take()))
            }
        };
        let Some((info, timer)) = outcome else {
            return Ok(None);
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        let payload = CallEnded {
            call_id,
            by: Some(by_user),
            reason,
        };
        self.notify(&info, EVENT_CALL_ENDED, serde_json::to_value(&payload).unwrap_or_default());
        tracing::info!(%call_id, by = by_user, ?reason, "call ended");
        self.schedule_reap(call_id);
        Ok(Some(info))
    }

    /// Called when a user's last connection has closed: every call they
    /// participate in that is still live is force-ended so the remaining
    /// peer sees a definitive end instead of an indefinite hang.
    pub fn handle_user_disconnect(self: &Arc<Self>, user_id: UserId) {
        let live: Vec<CallId> = self
            .calls
            .iter()
            .filter(|r| !r.info.state.is_terminal() && r.info.is_participant(user_id))
            .map(|r| r.info.call_id)
            .collect();
        for call_id in live {
            tracing::info!(%call_id, user_id, "participant disconnected, force-ending call");
            let _ = self.end(call_id, user_id, EndReason::PeerDisconnected);
        }
    }

    fn ring_timeout_fired(self: &Arc<Self>, call_id: CallId) {
        let info = {
            let Some(mut record) = self.calls.get_mut(&call_id) else {
                return;
            };
            if record.info.state != CallState::Ringing {
                return;
            }
            record.info.state = CallState::TimedOut;
            record.info.ended_at = Some(chrono::Utc::now());
            record.info.end_reason = Some(EndReason::Timeout);
            record.ring_timer = None;
            record.info.clone()
        };

        let payload = CallMissed {
            call_id,
            from: info.caller,
        };
        self.notify(&info, EVENT_CALL_MISSED, serde_json::to_value(&payload).unwrap_or_default());
        tracing::info!(%call_id, caller = info.caller, "call timed out unanswered");
        self.schedule_reap(call_id);
    }

    /// Lifecycle notifications go to every device of every participant:
    /// the per-call room covers connections that were open at initiate
    /// time, the per-user fan-out covers ones that joined later.
    fn notify(&self, info: &CallInfo, event: &str, payload: serde_json::Value) {
        let room = RoomName::Call(info.call_id);
        let reached: std::collections::HashSet<ConnectionId> =
            self.rooms.members(&room).into_iter().collect();
        self.rooms.broadcast(&room, event, payload.clone(), None);
        for user in info.participants() {
            for conn in self.registry.connections_for(user) {
                if !reached.contains(&conn) {
                    self.registry.send(
                        conn,
                        agora_models::events::OutboundEvent::new(event, payload.clone()),
                    );
                }
            }
        }
    }

    fn participant_for(
        &self,
        call_id: CallId,
        conn_id: ConnectionId,
    ) -> Result<UserId, CoreError> {
        match self.registry.lookup_user(conn_id) {
            Some(Identity::User(user)) => Ok(user),
            _ => Err(CoreError::InvalidRelayTarget(call_id)),
        }
    }

    fn schedule_reap(self: &Arc<Self>, call_id: CallId) {
        let manager = self.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let removed = manager
                .calls
                .remove_if(&call_id, |_, r| r.info.state.is_terminal());
            if removed.is_some() {
                manager.rooms.remove_room(&RoomName::Call(call_id));
                tracing::debug!(%call_id, "terminal call reaped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_models::events::OutboundEvent;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const RING_TIMEOUT: Duration = Duration::from_secs(30);
    const RETENTION: Duration = Duration::from_secs(60);

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        calls: Arc<CallManager>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let calls = Arc::new(CallManager::new(
            rooms,
            registry.clone(),
            RING_TIMEOUT,
            RETENTION,
        ));
        Fixture { registry, calls }
    }

    fn connect(f: &Fixture, user: UserId) -> (ConnectionId, UnboundedReceiver<OutboundEvent>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        f.registry.register(conn, Identity::User(user), tx);
        (conn, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<String> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev.event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn ring_and_accept_multi_device() {
        let f = fixture();
        let (_a, mut rx_a) = connect(&f, 1);
        let (b1, mut rx_b1) = connect(&f, 2);
        let (_b2, mut rx_b2) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Video);
        assert_eq!(info.state, CallState::Ringing);
        // Both of B's devices (and A's own) ring.
        assert_eq!(drain(&mut rx_b1), vec![EVENT_CALL_RINGING]);
        assert_eq!(drain(&mut rx_b2), vec![EVENT_CALL_RINGING]);
        assert_eq!(drain(&mut rx_a), vec![EVENT_CALL_RINGING]);

        let accepted = f.calls.accept(info.call_id, b1).unwrap();
        assert_eq!(accepted.state, CallState::Accepted);
        assert!(accepted.accepted_at.is_some());
        // Everyone is told, including B's second device (call taken
        // elsewhere).
        assert_eq!(drain(&mut rx_a), vec![EVENT_CALL_ACCEPTED]);
        assert_eq!(drain(&mut rx_b1), vec![EVENT_CALL_ACCEPTED]);
        assert_eq!(drain(&mut rx_b2), vec![EVENT_CALL_ACCEPTED]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_accepter_wins() {
        let f = fixture();
        let (_a, _rx_a) = connect(&f, 1);
        let (b1, _rx_b1) = connect(&f, 2);
        let (b2, _rx_b2) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Audio);
        assert!(f.calls.accept(info.call_id, b1).is_ok());
        assert!(matches!(
            f.calls.accept(info.call_id, b2),
            Err(CoreError::StaleCall(_))
        ));
        // The winning transition stands.
        assert_eq!(f.calls.get(info.call_id).unwrap().state, CallState::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cannot_accept_own_call() {
        let f = fixture();
        let (a, _rx_a) = connect(&f, 1);
        let (_b, _rx_b) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Audio);
        assert!(matches!(
            f.calls.accept(info.call_id, a),
            Err(CoreError::InvalidRelayTarget(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn decline_notifies_caller() {
        let f = fixture();
        let (_a, mut rx_a) = connect(&f, 1);
        let (b, _rx_b) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Audio);
        drain(&mut rx_a);
        let declined = f.calls.decline(info.call_id, b).unwrap();
        assert_eq!(declined.state, CallState::Declined);
        assert_eq!(declined.end_reason, Some(EndReason::Declined));
        assert_eq!(drain(&mut rx_a), vec![EVENT_CALL_DECLINED]);
        // Declined is terminal.
        assert!(matches!(
            f.calls.accept(info.call_id, b),
            Err(CoreError::StaleCall(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn end_is_idempotent() {
        let f = fixture();
        let (_a, _rx_a) = connect(&f, 1);
        let (b, mut rx_b) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Audio);
        f.calls.accept(info.call_id, b).unwrap();
        drain(&mut rx_b);

        assert!(f.calls.end(info.call_id, 1, EndReason::Hangup).unwrap().is_some());
        assert!(f.calls.end(info.call_id, 1, EndReason::Hangup).unwrap().is_none());
        // Exactly one call-ended notification.
        assert_eq!(drain(&mut rx_b), vec![EVENT_CALL_ENDED]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_as_missed() {
        let f = fixture();
        let (_a, mut rx_a) = connect(&f, 1);
        let (b, mut rx_b) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Video);
        drain(&mut rx_a);
        drain(&mut rx_b);

        tokio::time::sleep(RING_TIMEOUT + Duration::from_secs(1)).await;
        let call = f.calls.get(info.call_id).unwrap();
        assert_eq!(call.state, CallState::TimedOut);
        assert_eq!(call.end_reason, Some(EndReason::Timeout));
        assert_eq!(drain(&mut rx_a), vec![EVENT_CALL_MISSED]);
        assert_eq!(drain(&mut rx_b), vec![EVENT_CALL_MISSED]);
        assert!(matches!(
            f.calls.accept(info.call_id, b),
            Err(CoreError::StaleCall(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_cancels_ring_timeout() {
        let f = fixture();
        let (_a, mut rx_a) = connect(&f, 1);
        let (b, _rx_b) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Audio);
        f.calls.accept(info.call_id, b).unwrap();
        drain(&mut rx_a);

        tokio::time::sleep(RING_TIMEOUT * 2).await;
        assert_eq!(f.calls.get(info.call_id).unwrap().state, CallState::Accepted);
        assert!(
            !drain(&mut rx_a).contains(&EVENT_CALL_MISSED.to_string()),
            "stale ring timeout must not fire after accept"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn participant_disconnect_force_ends() {
        let f = fixture();
        let (_a, mut rx_a) = connect(&f, 1);
        let (b, _rx_b) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Audio);
        f.calls.accept(info.call_id, b).unwrap();
        drain(&mut rx_a);

        f.calls.handle_user_disconnect(2);
        let call = f.calls.get(info.call_id).unwrap();
        assert_eq!(call.state, CallState::Ended);
        assert_eq!(call.end_reason, Some(EndReason::PeerDisconnected));
        assert_eq!(drain(&mut rx_a), vec![EVENT_CALL_ENDED]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_calls_are_reaped_after_retention() {
        let f = fixture();
        let (_a, _rx_a) = connect(&f, 1);
        let (b, _rx_b) = connect(&f, 2);

        let info = f.calls.initiate(1, 2, MediaKind::Audio);
        f.calls.decline(info.call_id, b).unwrap();
        assert!(f.calls.get(info.call_id).is_some());

        tokio::time::sleep(RETENTION + Duration::from_secs(1)).await;
        assert!(f.calls.get(info.call_id).is_none());
    }
}
