use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use bson::oid::ObjectId;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher;
use super::session::{Outbound, Session};
use super::signal::{ack_err, ack_ok, parse_envelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
}

/// Handshake: the bearer token rides in the query string and is verified
/// before the upgrade completes.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match state.auth.verify_access_token(&params.token) {
        Ok(claims) => claims,
        Err(_) => {
            return Response::builder()
                .status(401)
                .body("Unauthorized".into())
                .unwrap();
        }
    };

    let user_id = match ObjectId::parse_str(&claims.sub) {
        Ok(id) => id,
        Err(_) => {
            return Response::builder()
                .status(400)
                .body("Invalid user ID".into())
                .unwrap();
        }
    };

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, user_id, claims.email, claims.name)
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    user_id: ObjectId,
    email: String,
    name: String,
) {
    let socket_id = Uuid::new_v4();
    info!(%socket_id, user_id = %user_id.to_hex(), "signaling session connected");

    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));
    state.signals.add_socket(socket_id, user_id, sender.clone());

    let mut session = Session::new(socket_id, user_id, email, name);

    {
        let hello = serde_json::json!({
            "type": "connected",
            "data": { "socketId": socket_id, "userId": user_id.to_hex() },
        });
        dispatcher::send_json(&sender, &hello).await;
    }

    // Mailbox: frames from this socket are handled strictly in order; the
    // next frame is not read until this one's ack and emissions are out.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_frame(&state, &mut session, &sender, &text).await;
            }
            Ok(Message::Ping(payload)) => {
                let mut guard = sender.lock().await;
                let _ = futures::SinkExt::send(&mut *guard, Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!(%socket_id, %e, "signaling socket error");
                break;
            }
            _ => {}
        }
    }

    let emits = session.disconnect_cleanup(&state).await;
    state.signals.remove_socket(&socket_id);
    deliver(&state, emits).await;

    info!(%socket_id, "signaling session closed");
}

async fn handle_frame(
    state: &AppState,
    session: &mut Session,
    sender: &super::storage::WsSender,
    text: &str,
) {
    let (id, parsed) = match parse_envelope(text) {
        Ok(parts) => parts,
        Err(e) => {
            debug!(socket_id = %session.socket_id, %e, "dropping unparseable frame");
            return;
        }
    };

    let signal = match parsed {
        Ok(signal) => signal,
        Err(message) => {
            if let Some(id) = id {
                dispatcher::send_json(sender, &ack_err(id, "bad_request", &message)).await;
            }
            return;
        }
    };

    match session.handle(state, signal).await {
        Ok((ack, emits)) => {
            // Ack first: peers must never learn about a producer before its
            // owner has the id.
            if let Some(id) = id {
                dispatcher::send_json(sender, &ack_ok(id, ack)).await;
            }
            deliver(state, emits).await;
        }
        Err(error) => {
            debug!(
                socket_id = %session.socket_id,
                code = error.code(),
                message = %error.message(),
                "signal rejected"
            );
            if let Some(id) = id {
                dispatcher::send_json(sender, &ack_err(id, error.code(), &error.message())).await;
            }
        }
    }
}

pub async fn deliver(state: &AppState, emits: Vec<Outbound>) {
    for outbound in emits {
        match outbound {
            Outbound::Room {
                room_key,
                except,
                signal,
            } => {
                dispatcher::broadcast_room(&state.signals, &room_key, except, &signal).await;
            }
            Outbound::User {
                room_key,
                user_id,
                signal,
            } => {
                dispatcher::send_to_user_in_room(&state.signals, &room_key, &user_id, &signal)
                    .await;
            }
        }
    }
}
