use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

/// Lifecycle of one composite recording of a room. At most one session per
/// room is active (status Starting/Recording/Uploading) at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSession {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub room_id: ObjectId,
    pub host_user_id: ObjectId,
    pub status: RecordingStatus,
    pub started_at: DateTime,
    pub ended_at: Option<DateTime>,
    pub duration_secs: Option<u32>,
    pub error: Option<String>,
    pub asset: Option<RecordingAsset>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingStatus {
    #[default]
    Starting,
    Recording,
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingAsset {
    pub asset_type: AssetType,
    pub format: String,
    pub size: u64,
    /// Present until the file is uploaded and unlinked.
    pub local_path: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    #[default]
    Composite,
}

impl RecordingSession {
    pub const COLLECTION: &'static str = "recording_sessions";
}
