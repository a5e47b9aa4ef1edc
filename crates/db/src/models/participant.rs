use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

/// One user's membership in a room. `left_at == None` means currently
/// joined. Mute fields are the durable shadow of the shared-store mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomParticipant {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub room_id: ObjectId,
    pub user_id: ObjectId,
    pub display_name: String,
    pub email: Option<String>,
    pub picture: Option<String>,
    #[serde(default)]
    pub role: ParticipantRole,
    pub joined_at: DateTime,
    pub left_at: Option<DateTime>,
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub video_muted: bool,
    #[serde(default)]
    pub audio_muted_by_host: bool,
    #[serde(default)]
    pub video_muted_by_host: bool,
    pub mute_updated_at: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    #[default]
    Guest,
}

impl RoomParticipant {
    pub const COLLECTION: &'static str = "room_participants";
}
