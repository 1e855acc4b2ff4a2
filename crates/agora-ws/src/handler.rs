use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Duration;

use agora_core::auth::extract_token;
use agora_core::error::CoreError;
use agora_core::AppState;
use agora_models::call::EndReason;
use agora_models::events::{
    ClientEvent, OutboundEvent, EVENT_AUTHENTICATED, EVENT_ERROR,
};
use agora_models::room::RoomName;
use agora_models::{ConnectionId, Identity};

const WS_PING_INTERVAL: Duration = Duration::from_secs(20);

pub async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    query_token: Option<String>,
    header_token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Identity resolves before any other handler runs. The explicit auth
    // payload arrives only via a later `authenticate` event, so at
    // connection time the precedence order reduces to query then header.
    let token = extract_token(None, query_token.as_deref(), header_token.as_deref());
    let identity = match state.auth.admit(token).await {
        Ok(identity) => identity,
        Err(err) => {
            let refusal = OutboundEvent::new(EVENT_ERROR, json!({"message": err.to_string()}));
            if let Ok(text) = serde_json::to_string(&refusal) {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            tracing::info!(error = %err, "gateway connection rejected");
            return;
        }
    };

    let conn_id = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();
    state.registry.register(conn_id, identity, tx);

    if let Identity::User(user_id) = identity {
        // Personal room first, so call/relay fan-out can reach this
        // connection from the moment it exists.
        state.rooms.join(conn_id, RoomName::User(user_id));
        state.presence.set_online(user_id, conn_id);
    }
    state.registry.send(
        conn_id,
        OutboundEvent::new(EVENT_AUTHENTICATED, json!({"user_id": identity.user_id()})),
    );
    tracing::info!(%conn_id, user_id = ?identity.user_id(), "gateway connection open");

    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await; // immediate first tick

    let disconnect_reason = loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&state, conn_id, identity, event),
                            Err(err) => {
                                tracing::debug!(%conn_id, error = %err, "unparseable client event");
                                state.registry.send(
                                    conn_id,
                                    OutboundEvent::new(
                                        EVENT_ERROR,
                                        json!({"message": "unrecognized event"}),
                                    ),
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!(
                                "client close frame (code={}, reason={})",
                                frame.code, frame.reason
                            ),
                            None => "client close frame".to_string(),
                        };
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: ignored
                    Some(Err(err)) => break format!("websocket receive error: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break "websocket send error".to_string();
                        }
                    }
                    None => break "outbound channel closed".to_string(),
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "websocket ping send error".to_string();
                }
            }
        }
    };

    teardown(&state, conn_id, identity);
    tracing::info!(%conn_id, user_id = ?identity.user_id(), "gateway connection closed: {disconnect_reason}");
}

/// Cleanup runs in a fixed order: membership first so no broadcast can
/// still target the connection, then the registry entry, then presence
/// and call bookkeeping once the user's reachability is settled.
fn teardown(state: &AppState, conn_id: ConnectionId, identity: Identity) {
    state.rooms.remove_connection(conn_id);
    state.registry.unregister(conn_id);
    if let Identity::User(user_id) = identity {
        state.presence.set_offline(user_id, conn_id);
        if state.registry.connection_count(user_id) == 0 {
            state.calls.handle_user_disconnect(user_id);
        }
    }
}

/// Handles one inbound event. Failures are answered on this connection's
/// response path only; no error here may affect another connection.
fn dispatch(state: &AppState, conn_id: ConnectionId, identity: Identity, event: ClientEvent) {
    match event {
        ClientEvent::Authenticate { .. } => {
            // Identity was resolved at connection time; this is an
            // idempotent re-confirmation.
            state.registry.send(
                conn_id,
                OutboundEvent::new(EVENT_AUTHENTICATED, json!({"user_id": identity.user_id()})),
            );
        }
        ClientEvent::JoinUser { user_id } => {
            state.rooms.join(conn_id, RoomName::User(user_id));
        }
        ClientEvent::JoinFeed { feed } => {
            state.rooms.join(conn_id, RoomName::Feed(feed));
        }
        ClientEvent::LeaveFeed { feed } => {
            state.rooms.leave(conn_id, &RoomName::Feed(feed));
        }
        ClientEvent::JoinPost { post_id } => {
            state.rooms.join(conn_id, RoomName::Post(post_id));
        }
        ClientEvent::LeavePost { post_id } => {
            state.rooms.leave(conn_id, &RoomName::Post(post_id));
        }
        ClientEvent::JoinTrending => {
            state.rooms.join(conn_id, RoomName::Trending);
        }
        ClientEvent::PresenceUpdate {
            is_online,
            show_online_status,
            show_last_seen,
        } => {
            let Identity::User(user_id) = identity else {
                return reject(state, conn_id, "authentication required");
            };
            let current = state.presence.get(user_id);
            let show_online = show_online_status
                .or(current.as_ref().map(|r| r.show_online_status))
                .unwrap_or(true);
            let show_seen = show_last_seen
                .or(current.as_ref().map(|r| r.show_last_seen))
                .unwrap_or(true);
            state.presence.update_preferences(user_id, show_online, show_seen);
            // Connection lifecycle is the source of truth for online
            // state; the client's flag is advisory.
            if let Some(record) = state.presence.get(user_id) {
                if record.online != is_online {
                    tracing::debug!(
                        user_id,
                        claimed = is_online,
                        actual = record.online,
                        "presence claim disagrees with connection count"
                    );
                }
            }
        }
        ClientEvent::CallInitiate { target_user_id, media } => {
            let Identity::User(user_id) = identity else {
                return reject(state, conn_id, "authentication required");
            };
            state.calls.initiate(user_id, target_user_id, media);
        }
        ClientEvent::CallAccept { call_id } => {
            if let Err(err) = state.calls.accept(call_id, conn_id) {
                reject_call(state, conn_id, err);
            }
        }
        ClientEvent::CallDecline { call_id } => {
            if let Err(err) = state.calls.decline(call_id, conn_id) {
                reject_call(state, conn_id, err);
            }
        }
        ClientEvent::CallEnd { call_id } => {
            let Identity::User(user_id) = identity else {
                return reject(state, conn_id, "authentication required");
            };
            if let Err(err) = state.calls.end(call_id, user_id, EndReason::Hangup) {
                reject_call(state, conn_id, err);
            }
        }
        ClientEvent::WebrtcOffer { call_id, payload } => {
            // Rejections are dropped, not forwarded; the relay logs them.
            let _ = state
                .relay
                .relay(call_id, conn_id, agora_models::events::SignalKind::Offer, payload);
        }
        ClientEvent::WebrtcAnswer { call_id, payload } => {
            let _ = state
                .relay
                .relay(call_id, conn_id, agora_models::events::SignalKind::Answer, payload);
        }
        ClientEvent::WebrtcIceCandidate { call_id, payload } => {
            let _ = state.relay.relay(
                call_id,
                conn_id,
                agora_models::events::SignalKind::IceCandidate,
                payload,
            );
        }
    }
}

fn reject(state: &AppState, conn_id: ConnectionId, message: &str) {
    state.registry.send(
        conn_id,
        OutboundEvent::new(EVENT_ERROR, json!({"message": message})),
    );
}

/// A lost call-state race is reported only to the requester that lost it.
fn reject_call(state: &AppState, conn_id: ConnectionId, err: CoreError) {
    tracing::debug!(%conn_id, error = %err, "call action rejected");
    reject(state, conn_id, &err.to_string());
}
