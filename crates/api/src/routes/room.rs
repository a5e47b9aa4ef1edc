use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use bson::oid::ObjectId;
use connect_db::models::{JoinRequest, Room};
use serde::{Deserialize, Serialize};

use crate::ws::dispatcher;
use crate::ws::signal::ServerSignal;
use crate::{error::ApiError, extractors::auth::AuthUser, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub id: String,
    pub room_code: String,
    pub name: String,
    pub host_user_id: String,
    pub waiting_room: bool,
    pub chat_muted: bool,
    pub recording_allowed: bool,
    pub participant_count: u32,
}

impl From<&Room> for RoomResponse {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id.map(|id| id.to_hex()).unwrap_or_default(),
            room_code: room.room_code.clone(),
            name: room.name.clone(),
            host_user_id: room.host_user_id.to_hex(),
            waiting_room: room.settings.waiting_room,
            chat_muted: room.settings.chat_muted,
            recording_allowed: room.settings.recording_allowed,
            participant_count: room.participant_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequestResponse {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub status: String,
}

impl From<&JoinRequest> for JoinRequestResponse {
    fn from(request: &JoinRequest) -> Self {
        Self {
            id: request.id.map(|id| id.to_hex()).unwrap_or_default(),
            room_id: request.room_id.to_hex(),
            user_id: request.user_id.to_hex(),
            display_name: request.display_name.clone(),
            status: format!("{:?}", request.status).to_lowercase(),
        }
    }
}

async fn room_for_host(
    state: &AppState,
    room_code: &str,
    user_id: ObjectId,
) -> Result<Room, ApiError> {
    let room = state.rooms.find_by_code(room_code).await?;
    if room.host_user_id != user_id {
        return Err(ApiError::Forbidden(
            "Only the host can do that".to_string(),
        ));
    }
    Ok(room)
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Room name is required".to_string()));
    }
    let room = state.rooms.create(auth.user_id, name.to_string()).await?;
    Ok((StatusCode::CREATED, Json(RoomResponse::from(&room))))
}

pub async fn get(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(room_code): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let room = state.rooms.find_by_code(&room_code).await?;
    Ok(Json(RoomResponse::from(&room)))
}

/// Durable pre-join. Already-joined is not an error: the room comes back
/// either way.
pub async fn join(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_code): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let room = state.rooms.find_by_code(&room_code).await?;
    let room_id = room.id.ok_or_else(|| ApiError::Internal("room without id".to_string()))?;
    let is_host = room.host_user_id == auth.user_id;

    if room.settings.waiting_room && !is_host {
        let approved = state
            .rooms
            .join_requests
            .find_one(bson::doc! {
                "room_id": room_id,
                "user_id": auth.user_id,
                "status": "approved",
            })
            .await?;
        if approved.is_none() {
            return Err(ApiError::Forbidden(
                "Join approval required; use request-join".to_string(),
            ));
        }
    }

    state
        .rooms
        .join_participant(&room, auth.user_id, auth.name.clone(), Some(auth.email), None)
        .await?;
    let room = state.rooms.find_by_code(&room_code).await?;
    Ok(Json(RoomResponse::from(&room)))
}

pub async fn leave(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_code): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state.rooms.find_by_code(&room_code).await?;
    let room_id = room.id.ok_or_else(|| ApiError::Internal("room without id".to_string()))?;
    let left = state.rooms.leave_participant(room_id, auth.user_id).await?;
    Ok(Json(serde_json::json!({ "left": left })))
}

pub async fn request_join(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_code): Path<String>,
) -> Result<Json<JoinRequestResponse>, ApiError> {
    let room = state.rooms.find_by_code(&room_code).await?;
    let room_id = room.id.ok_or_else(|| ApiError::Internal("room without id".to_string()))?;
    if room.host_user_id == auth.user_id {
        return Err(ApiError::Conflict(
            "You administer this room; join directly".to_string(),
        ));
    }
    let request = state
        .rooms
        .create_join_request(room_id, auth.user_id, auth.name.clone())
        .await?;
    Ok(Json(JoinRequestResponse::from(&request)))
}

pub async fn approve(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_code, request_id)): Path<(String, String)>,
) -> Result<Json<JoinRequestResponse>, ApiError> {
    resolve(state, auth, room_code, request_id, true).await
}

pub async fn reject(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_code, request_id)): Path<(String, String)>,
) -> Result<Json<JoinRequestResponse>, ApiError> {
    resolve(state, auth, room_code, request_id, false).await
}

async fn resolve(
    state: AppState,
    auth: AuthUser,
    room_code: String,
    request_id: String,
    approved: bool,
) -> Result<Json<JoinRequestResponse>, ApiError> {
    let room = room_for_host(&state, &room_code, auth.user_id).await?;
    let request_id = ObjectId::parse_str(&request_id)
        .map_err(|_| ApiError::BadRequest("Invalid request id".to_string()))?;

    let request = state.rooms.join_requests.find_by_id(request_id).await?;
    if Some(request.room_id) != room.id {
        return Err(ApiError::NotFound("Join request not found".to_string()));
    }

    let request = state
        .rooms
        .resolve_request(request_id, approved, auth.user_id)
        .await?;
    Ok(Json(JoinRequestResponse::from(&request)))
}

pub async fn pending_requests(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_code): Path<String>,
) -> Result<Json<Vec<JoinRequestResponse>>, ApiError> {
    let room = room_for_host(&state, &room_code, auth.user_id).await?;
    let room_id = room.id.ok_or_else(|| ApiError::Internal("room without id".to_string()))?;
    let requests = state.rooms.pending_requests(room_id).await?;
    Ok(Json(requests.iter().map(JoinRequestResponse::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub waiting_room: Option<bool>,
    pub chat_muted: Option<bool>,
    pub recording_allowed: Option<bool>,
}

pub async fn update_settings(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_code): Path<String>,
    Json(body): Json<UpdateSettingsRequest>,
) -> Result<Json<RoomResponse>, ApiError> {
    let room = room_for_host(&state, &room_code, auth.user_id).await?;
    let room_id = room.id.ok_or_else(|| ApiError::Internal("room without id".to_string()))?;

    let mut settings = room.settings.clone();
    if let Some(waiting_room) = body.waiting_room {
        settings.waiting_room = waiting_room;
    }
    if let Some(chat_muted) = body.chat_muted {
        settings.chat_muted = chat_muted;
        // Keep the live control mirror in step so in-flight chat checks it.
        state.mute.set_control(&room.room_code, chat_muted).await;
    }
    if let Some(recording_allowed) = body.recording_allowed {
        settings.recording_allowed = recording_allowed;
    }

    state.rooms.update_settings(room_id, &settings).await?;
    let room = state.rooms.find_by_code(&room_code).await?;
    Ok(Json(RoomResponse::from(&room)))
}

pub async fn recording_start(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_code): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = room_for_host(&state, &room_code, auth.user_id).await?;
    let room_id = room.id.ok_or_else(|| ApiError::Internal("room without id".to_string()))?;

    let session_id = state.recording.start(room_id, auth.user_id).await?;
    dispatcher::broadcast_room(
        &state.signals,
        &room_id.to_hex(),
        None,
        &ServerSignal::RecordingStarted {
            session_id: session_id.to_hex(),
        },
    )
    .await;
    Ok(Json(serde_json::json!({ "sessionId": session_id.to_hex() })))
}

pub async fn recording_stop(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_code): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = room_for_host(&state, &room_code, auth.user_id).await?;
    let room_id = room.id.ok_or_else(|| ApiError::Internal("room without id".to_string()))?;

    let session_id = state.recording.stop(room_id).await?;
    dispatcher::broadcast_room(
        &state.signals,
        &room_id.to_hex(),
        None,
        &ServerSignal::RecordingStopped {
            session_id: session_id.to_hex(),
        },
    )
    .await;
    Ok(Json(serde_json::json!({ "sessionId": session_id.to_hex() })))
}
