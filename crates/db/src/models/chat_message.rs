use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub room_id: ObjectId,
    pub sender_id: ObjectId,
    pub sender_name: String,
    /// Set for direct messages; None broadcasts to the room.
    pub recipient_id: Option<ObjectId>,
    pub content: String,
    /// Client-generated id echoed back so senders can reconcile optimistic
    /// inserts.
    pub client_message_id: Option<String>,
    pub created_at: DateTime,
}

impl ChatMessage {
    pub const COLLECTION: &'static str = "chat_messages";

    pub const MAX_CONTENT_LEN: usize = 2000;
}
