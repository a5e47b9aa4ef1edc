use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

/// A conference room. The `room_code` is the human-facing identifier
/// (`xxxx-xxxx-xxxx`, lowercase); everything cross-node keys off either the
/// code or the document id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub room_code: String,
    pub name: String,
    pub host_user_id: ObjectId,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default)]
    pub settings: RoomSettings,
    #[serde(default)]
    pub participant_count: u32,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub closed_at: Option<DateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomSettings {
    /// Guests must be approved by the host before joining.
    #[serde(default)]
    pub waiting_room: bool,
    /// Host disabled chat for everyone but themselves.
    #[serde(default)]
    pub chat_muted: bool,
    #[serde(default)]
    pub recording_allowed: bool,
}

impl Room {
    pub const COLLECTION: &'static str = "rooms";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub room_id: ObjectId,
    pub user_id: ObjectId,
    pub display_name: String,
    #[serde(default)]
    pub status: JoinRequestStatus,
    pub created_at: DateTime,
    pub resolved_at: Option<DateTime>,
    pub resolved_by: Option<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JoinRequestStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl JoinRequest {
    pub const COLLECTION: &'static str = "join_requests";
}
