use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call::{CallId, EndReason, MediaKind};
use crate::UserId;

// Server -> client event names
pub const EVENT_AUTHENTICATED: &str = "authenticated";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_PRESENCE_UPDATE: &str = "presence-update";
pub const EVENT_CALL_RINGING: &str = "call-ringing";
pub const EVENT_CALL_ACCEPTED: &str = "call-accepted";
pub const EVENT_CALL_DECLINED: &str = "call-declined";
pub const EVENT_CALL_ENDED: &str = "call-ended";
pub const EVENT_CALL_MISSED: &str = "call-missed";
pub const EVENT_WEBRTC_OFFER: &str = "webrtc-offer";
pub const EVENT_WEBRTC_ANSWER: &str = "webrtc-answer";
pub const EVENT_WEBRTC_ICE_CANDIDATE: &str = "webrtc-ice-candidate";

/// Every event a client may send over the gateway. Unknown event names
/// fail deserialization and are answered with an `error` event on the
/// offending connection only.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Idempotent re-confirmation of an already-resolved identity.
    Authenticate {
        #[serde(default)]
        token: Option<String>,
    },
    JoinUser {
        user_id: UserId,
    },
    JoinFeed {
        feed: String,
    },
    LeaveFeed {
        feed: String,
    },
    JoinPost {
        post_id: i64,
    },
    LeavePost {
        post_id: i64,
    },
    JoinTrending,
    PresenceUpdate {
        is_online: bool,
        #[serde(default)]
        show_online_status: Option<bool>,
        #[serde(default)]
        show_last_seen: Option<bool>,
    },
    CallInitiate {
        target_user_id: UserId,
        media: MediaKind,
    },
    CallAccept {
        call_id: CallId,
    },
    CallDecline {
        call_id: CallId,
    },
    CallEnd {
        call_id: CallId,
    },
    WebrtcOffer {
        call_id: CallId,
        payload: Value,
    },
    WebrtcAnswer {
        call_id: CallId,
        payload: Value,
    },
    WebrtcIceCandidate {
        call_id: CallId,
        payload: Value,
    },
}

/// Envelope for every event the server emits. The payload is built from
/// the typed structs below; gateway-injected events (CRUD routes, the
/// trending job) carry whatever payload the collaborator provides.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    pub event: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Media-negotiation message kinds accepted by the signaling relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// The outbound event name a relayed message of this kind is
    /// forwarded under.
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalKind::Offer => EVENT_WEBRTC_OFFER,
            SignalKind::Answer => EVENT_WEBRTC_ANSWER,
            SignalKind::IceCandidate => EVENT_WEBRTC_ICE_CANDIDATE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallRinging {
    pub call_id: CallId,
    pub from: UserId,
    pub media: MediaKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallAccepted {
    pub call_id: CallId,
    pub by: UserId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallDeclined {
    pub call_id: CallId,
    pub by: UserId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub call_id: CallId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by: Option<UserId>,
    pub reason: EndReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallMissed {
    pub call_id: CallId,
    pub from: UserId,
}

/// A relayed signaling message. The `payload` is an opaque blob; the
/// relay tags it with the call id and a forward timestamp, nothing more.
#[derive(Debug, Clone, Serialize)]
pub struct SignalFrame {
    pub call_id: CallId,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_join_post() {
        let ev: ClientEvent =
            serde_json::from_value(json!({"event": "join-post", "data": {"post_id": 42}})).unwrap();
        assert!(matches!(ev, ClientEvent::JoinPost { post_id: 42 }));
    }

    #[test]
    fn deserialize_unit_event_without_data() {
        let ev: ClientEvent = serde_json::from_value(json!({"event": "join-trending"})).unwrap();
        assert!(matches!(ev, ClientEvent::JoinTrending));
    }

    #[test]
    fn deserialize_signaling_with_opaque_payload() {
        let call_id = CallId::new();
        let ev: ClientEvent = serde_json::from_value(json!({
            "event": "webrtc-offer",
            "data": {"call_id": call_id, "payload": {"sdp": "v=0...", "type": "offer"}}
        }))
        .unwrap();
        match ev {
            ClientEvent::WebrtcOffer { call_id: id, payload } => {
                assert_eq!(id, call_id);
                assert_eq!(payload["type"], "offer");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let res: Result<ClientEvent, _> =
            serde_json::from_value(json!({"event": "drop-tables", "data": {}}));
        assert!(res.is_err());
    }

    #[test]
    fn signal_kinds_map_to_forward_event_names() {
        assert_eq!(SignalKind::Offer.event_name(), EVENT_WEBRTC_OFFER);
        assert_eq!(SignalKind::IceCandidate.event_name(), EVENT_WEBRTC_ICE_CANDIDATE);
    }
}
