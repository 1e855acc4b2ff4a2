use std::sync::Arc;

use agora_models::call::CallId;
use agora_models::events::{SignalFrame, SignalKind};
use agora_models::{ConnectionId, Identity};
use serde_json::Value;

use crate::calls::CallManager;
use crate::error::CoreError;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;

/// Stateless per-message forwarding of media-negotiation payloads between
/// the participants of a live call. The payload is an opaque blob: never
/// inspected, never rewritten, only tagged with the call id and a forward
/// timestamp. Validation and forwarding happen synchronously per message,
/// so accepted messages are forwarded in acceptance order.
pub struct SignalingRelay {
    calls: Arc<CallManager>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
}

impl SignalingRelay {
    pub fn new(
        calls: Arc<CallManager>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
    ) -> Self {
        Self {
            calls,
            registry,
            rooms,
        }
    }

    /// Forwards one signaling message to the other participants' per-user
    /// rooms. Returns the number of connections it was handed to.
    ///
    /// Rejected relays (unknown call, call past its signaling window,
    /// sender not a participant) are dropped, not forwarded, and logged
    /// for diagnosis.
    pub fn relay(
        &self,
        call_id: CallId,
        from_conn: ConnectionId,
        kind: SignalKind,
        payload: Value,
    ) -> Result<usize, CoreError> {
        let result = self.check_and_forward(call_id, from_conn, kind, payload);
        if let Err(ref err) = result {
            tracing::warn!(%call_id, %from_conn, ?kind, error = %err, "rejected signaling relay");
        }
        result
    }

    fn check_and_forward(
        &self,
        call_id: CallId,
        from_conn: ConnectionId,
        kind: SignalKind,
        payload: Value,
    ) -> Result<usize, CoreError> {
        let sender = match self.registry.lookup_user(from_conn) {
            Some(Identity::User(user)) => user,
            _ => return Err(CoreError::InvalidRelayTarget(call_id)),
        };
        let call = self
            .calls
            .get(call_id)
            .ok_or(CoreError::InvalidRelayTarget(call_id))?;
        if !call.state.accepts_signaling() {
            return Err(CoreError::InvalidRelayTarget(call_id));
        }
        if !call.is_participant(sender) {
            return Err(CoreError::InvalidRelayTarget(call_id));
        }

        let frame = SignalFrame {
            call_id,
            payload,
            sent_at: chrono::Utc::now(),
        };
        let frame = serde_json::to_value(&frame).unwrap_or_default();
        let mut delivered = 0;
        for peer in call.counterparts(sender) {
            delivered += self
                .rooms
                .broadcast_to_user(peer, kind.event_name(), frame.clone());
        }
        Ok(delivered)
    }
}
