use super::signal::{ServerSignal, event_json};
use super::storage::{SignalStorage, WsSender};
use axum::extract::ws::Message;
use bson::oid::ObjectId;
use futures::SinkExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub async fn send_json(sender: &WsSender, value: &serde_json::Value) {
    let text = serde_json::to_string(value).unwrap_or_default();
    let mut guard = sender.lock().await;
    if let Err(e) = guard.send(Message::text(text)).await {
        warn!(%e, "failed to send WS message");
    }
}

pub async fn send_to_socket(storage: &SignalStorage, socket_id: &Uuid, signal: &ServerSignal) {
    if let Some(sender) = storage.sender_of(socket_id) {
        send_json(&sender, &event_json(signal)).await;
    }
}

/// Room multicast; `except` skips the originating socket.
pub async fn broadcast_room(
    storage: &SignalStorage,
    room_key: &str,
    except: Option<Uuid>,
    signal: &ServerSignal,
) {
    let value = event_json(signal);
    let text = serde_json::to_string(&value).unwrap_or_default();
    let members = storage.room_sockets(room_key);
    debug!(room_key, recipients = members.len(), "room broadcast");

    for socket_id in members {
        if Some(socket_id) == except {
            continue;
        }
        if let Some(sender) = storage.sender_of(&socket_id) {
            let mut guard = sender.lock().await;
            if let Err(e) = guard.send(Message::text(text.clone())).await {
                warn!(%socket_id, %e, "failed to send WS message");
            }
        }
    }
}

/// Every socket the user holds in the room (DM delivery, forced mute).
pub async fn send_to_user_in_room(
    storage: &SignalStorage,
    room_key: &str,
    user_id: &ObjectId,
    signal: &ServerSignal,
) {
    for socket_id in storage.sockets_of_user_in_room(room_key, user_id) {
        send_to_socket(storage, &socket_id, signal).await;
    }
}
