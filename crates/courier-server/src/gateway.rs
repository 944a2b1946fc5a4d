//! WebSocket gateway.
//!
//! A connection is authenticated from the identity header before the
//! upgrade, registered with the [`PresenceRegistry`] once the socket is
//! open, and removed when either side closes it. Losing the last
//! connection takes the user offline.
//!
//! [`PresenceRegistry`]: crate::presence::PresenceRegistry

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use courier_shared::protocol::{ClientEvent, ServerEvent, SessionReady};
use courier_shared::types::{ConnectionId, Presence, RoomId, UserId};
use courier_store::User;

use crate::api::AppState;
use crate::error::ServerError;
use crate::fanout::DomainEvent;
use crate::identity::AuthUser;
use crate::presence::{LiveConnection, Outbound};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let profile = state.store.run(move |db| db.active_user(user)).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, profile)))
}

async fn handle_socket(socket: WebSocket, state: AppState, profile: User) {
    let seen = profile.last_seen_at.unwrap_or_else(Utc::now);
    let LiveConnection {
        id: conn_id,
        user,
        mut receiver,
    } = state
        .registry
        .connect_as(profile.id, profile.presence, seen)
        .await;
    let (presence, _) = state.registry.presence_of(user).await;
    let devices = state.registry.connection_count(user).await;
    info!(
        user = %user,
        connection = %conn_id,
        presence = presence.as_str(),
        devices,
        "WebSocket connected"
    );

    let ready = ServerEvent::SessionReady(SessionReady {
        connection_id: conn_id,
    });
    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        match ready.to_json() {
            Ok(json) => {
                if sink.send(Message::Text(json)).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode session frame"),
        }
        while let Some(frame) = receiver.recv().await {
            let msg = match frame {
                Outbound::Event(text) => Message::Text(text.to_string()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                debug!(connection = %conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => handle_client_frame(&state, user, conn_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    send_task.abort();
    on_disconnect(&state, user, conn_id).await;
}

/// Tear down one connection. If it was the user's last one and the user
/// was not already offline, the offline presence is persisted and
/// announced to conversation peers.
pub(crate) async fn on_disconnect(state: &AppState, user: UserId, conn: ConnectionId) {
    let at = Utc::now();
    let left = state.registry.disconnect(user, conn, at).await;

    if left.went_offline {
        if let Err(e) = announce_presence(state, user, Presence::Offline, at, None).await {
            warn!(user = %user, error = %e, "Failed to record offline presence");
        }
    }
    info!(
        user = %user,
        connection = %conn,
        remaining = left.remaining,
        "WebSocket disconnected"
    );
}

/// Apply one client frame. Nothing is sent back on failure; the frame is
/// logged and dropped.
pub(crate) async fn handle_client_frame(
    state: &AppState,
    user: UserId,
    conn: ConnectionId,
    text: &str,
) {
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(user = %user, error = %e, "Ignoring malformed client frame");
            return;
        }
    };

    let result = match event {
        ClientEvent::Presence {
            presence,
            last_seen_at,
        } => {
            let at = last_seen_at.unwrap_or_else(Utc::now);
            change_presence(state, user, presence, at, Some(conn))
                .await
                .map(|_| ())
        }
        ClientEvent::JoinConversation { recipient_id } => {
            let room = RoomId::for_pair(user, recipient_id);
            state.registry.join_room(room, user, conn).await;
            Ok(())
        }
        ClientEvent::LeaveConversation { recipient_id } => {
            let room = RoomId::for_pair(user, recipient_id);
            state.registry.leave_room(&room, user, conn).await;
            Ok(())
        }
        ClientEvent::JoinGroup { group_id } => {
            match state
                .store
                .run(move |db| db.is_group_member(group_id, user))
                .await
            {
                Ok(true) => {
                    let room = RoomId::for_group(group_id);
                    state.registry.join_room(room, user, conn).await;
                    Ok(())
                }
                Ok(false) => {
                    debug!(user = %user, group = %group_id, "Join refused, not a member");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        ClientEvent::LeaveGroup { group_id } => {
            let room = RoomId::for_group(group_id);
            state.registry.leave_room(&room, user, conn).await;
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(user = %user, error = %e, "Client frame failed");
    }
}

/// Move `user` to `presence`. A no-op when the presence is unchanged;
/// otherwise the change is persisted and every conversation peer is
/// notified. Returns whether anything changed.
pub async fn change_presence(
    state: &AppState,
    user: UserId,
    presence: Presence,
    at: DateTime<Utc>,
    origin: Option<ConnectionId>,
) -> Result<bool, ServerError> {
    if !state.registry.set_presence(user, presence, at).await {
        return Ok(false);
    }
    announce_presence(state, user, presence, at, origin).await?;
    Ok(true)
}

/// Persist a presence the registry already holds and notify every
/// conversation peer.
async fn announce_presence(
    state: &AppState,
    user: UserId,
    presence: Presence,
    at: DateTime<Utc>,
    origin: Option<ConnectionId>,
) -> Result<(), ServerError> {
    let peers = state
        .store
        .run(move |db| db.persist_presence(user, presence, at))
        .await?;

    state.fanout.publish(DomainEvent::PresenceChanged {
        user,
        presence,
        last_seen_at: at,
        peers,
        origin,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{seed_users, test_state};
    use std::time::Duration;

    async fn next_type(conn: &mut LiveConnection) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(1), conn.receiver.recv())
            .await
            .unwrap();
        match frame {
            Some(Outbound::Event(text)) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                value["type"].as_str().unwrap().to_string()
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    async fn assert_silent(conn: &mut LiveConnection) {
        let waited = tokio::time::timeout(Duration::from_millis(100), conn.receiver.recv()).await;
        assert!(waited.is_err(), "unexpected frame: {waited:?}");
    }

    /// Alice and Bob share a conversation and Alice is stored as online.
    async fn online_pair(state: &AppState) -> [UserId; 2] {
        let [a, b] = seed_users(state).await;
        state
            .store
            .run(move |db| {
                db.send_message(a, b, "hi")?;
                db.persist_presence(a, Presence::Online, Utc::now())
            })
            .await
            .unwrap();
        [a, b]
    }

    #[tokio::test]
    async fn test_last_disconnect_announces_offline_once_per_connection() {
        let (state, _dir) = test_state();
        let [a, b] = online_pair(&state).await;

        let mut b_phone = state.registry.connect(b).await;
        let mut b_laptop = state.registry.connect(b).await;
        let a_conn = state
            .registry
            .connect_as(a, Presence::Online, Utc::now())
            .await;

        on_disconnect(&state, a, a_conn.id).await;

        assert_eq!(state.registry.presence_of(a).await.0, Presence::Offline);
        let stored = state.store.run(move |db| db.active_user(a)).await.unwrap();
        assert_eq!(stored.presence, Presence::Offline);
        assert!(stored.last_seen_at.is_some());

        for conn in [&mut b_phone, &mut b_laptop] {
            assert_eq!(next_type(conn).await, "feed.user_presence");
            assert_silent(conn).await;
        }
    }

    #[tokio::test]
    async fn test_disconnect_with_other_devices_keeps_presence() {
        let (state, _dir) = test_state();
        let [a, b] = online_pair(&state).await;

        let mut b_conn = state.registry.connect(b).await;
        let phone = state
            .registry
            .connect_as(a, Presence::Online, Utc::now())
            .await;
        let _laptop = state
            .registry
            .connect_as(a, Presence::Offline, Utc::now())
            .await;

        on_disconnect(&state, a, phone.id).await;

        assert_eq!(state.registry.presence_of(a).await.0, Presence::Online);
        assert_eq!(state.registry.connection_count(a).await, 1);
        let stored = state.store.run(move |db| db.active_user(a)).await.unwrap();
        assert_eq!(stored.presence, Presence::Online);
        assert_silent(&mut b_conn).await;
    }

    #[tokio::test]
    async fn test_reconnect_before_teardown_is_not_forced_offline() {
        let (state, _dir) = test_state();
        let [a, b] = online_pair(&state).await;
        let mut b_conn = state.registry.connect(b).await;

        // A new socket opens before the old one finishes closing.
        let old = state
            .registry
            .connect_as(a, Presence::Online, Utc::now())
            .await;
        let _fresh = state
            .registry
            .connect_as(a, Presence::Online, Utc::now())
            .await;
        on_disconnect(&state, a, old.id).await;

        assert_eq!(state.registry.presence_of(a).await.0, Presence::Online);
        assert_silent(&mut b_conn).await;
    }

    #[tokio::test]
    async fn test_unchanged_presence_is_noop() {
        let (state, _dir) = test_state();
        let [a, _] = seed_users(&state).await;

        assert!(!change_presence(&state, a, Presence::Offline, Utc::now(), None)
            .await
            .unwrap());
        assert!(change_presence(&state, a, Presence::Online, Utc::now(), None)
            .await
            .unwrap());
        assert!(!change_presence(&state, a, Presence::Online, Utc::now(), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_presence_change_is_persisted_and_fanned_out() {
        let (state, _dir) = test_state();
        let [a, b] = seed_users(&state).await;
        state
            .store
            .run(move |db| db.send_message(a, b, "hi"))
            .await
            .unwrap();

        let mut b_conn = state.registry.connect(b).await;
        assert!(change_presence(&state, a, Presence::Away, Utc::now(), None)
            .await
            .unwrap());

        assert_eq!(next_type(&mut b_conn).await, "feed.user_presence");
        let stored = state.store.run(move |db| db.active_user(a)).await.unwrap();
        assert_eq!(stored.presence, Presence::Away);
    }

    #[tokio::test]
    async fn test_join_group_requires_membership() {
        let (state, _dir) = test_state();
        let [a, b] = seed_users(&state).await;
        let created = state
            .store
            .run(move |db| db.create_group(a, "Rustaceans", "rustaceans"))
            .await
            .unwrap();
        let group_id = created.group.id;
        let room = RoomId::for_group(group_id);

        let a_conn = state.registry.connect(a).await;
        let b_conn = state.registry.connect(b).await;
        let frame = format!(r#"{{"type":"join_group","data":{{"groupId":"{group_id}"}}}}"#);

        handle_client_frame(&state, b, b_conn.id, &frame).await;
        assert_eq!(state.registry.room_size(&room).await, 0);

        handle_client_frame(&state, a, a_conn.id, &frame).await;
        assert_eq!(state.registry.room_size(&room).await, 1);
    }

    #[tokio::test]
    async fn test_conversation_rooms_and_malformed_frames() {
        let (state, _dir) = test_state();
        let [a, b] = seed_users(&state).await;
        let conn = state.registry.connect(a).await;
        let room = RoomId::for_pair(a, b);

        handle_client_frame(&state, a, conn.id, "{not json").await;
        handle_client_frame(&state, a, conn.id, r#"{"type":"dance","data":{}}"#).await;
        assert_eq!(state.registry.room_size(&room).await, 0);

        let join = format!(r#"{{"type":"join_conversation","data":{{"recipientId":"{b}"}}}}"#);
        handle_client_frame(&state, a, conn.id, &join).await;
        assert_eq!(state.registry.room_size(&room).await, 1);

        let leave = format!(r#"{{"type":"leave_conversation","data":{{"recipientId":"{b}"}}}}"#);
        handle_client_frame(&state, a, conn.id, &leave).await;
        assert_eq!(state.registry.room_size(&room).await, 0);
    }

    #[tokio::test]
    async fn test_presence_frame_excludes_origin_from_room() {
        let (state, _dir) = test_state();
        let [a, b] = seed_users(&state).await;
        state
            .store
            .run(move |db| db.send_message(a, b, "hi"))
            .await
            .unwrap();

        let mut a_conn = state.registry.connect(a).await;
        let mut b_conn = state.registry.connect(b).await;
        let room = RoomId::for_pair(a, b);
        state.registry.join_room(room.clone(), a, a_conn.id).await;
        state.registry.join_room(room, b, b_conn.id).await;

        let frame = r#"{"type":"presence","data":{"presence":"ONLINE"}}"#;
        handle_client_frame(&state, a, a_conn.id, frame).await;

        assert_eq!(next_type(&mut b_conn).await, "feed.user_presence");
        assert_eq!(next_type(&mut b_conn).await, "conversation.presence");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), a_conn.receiver.recv())
                .await
                .is_err()
        );
    }
}
