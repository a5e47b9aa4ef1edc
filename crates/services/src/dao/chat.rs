use bson::{DateTime, doc, oid::ObjectId};
use connect_db::models::ChatMessage;
use mongodb::Database;
use std::sync::Arc;

use super::base::{BaseDao, DaoError, DaoResult, DbGuard};

pub struct ChatDao {
    pub base: BaseDao<ChatMessage>,
}

pub struct ChatPage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<String>,
}

impl ChatDao {
    pub fn new(db: &Database, guard: Arc<DbGuard>) -> Self {
        Self {
            base: BaseDao::new(db, ChatMessage::COLLECTION, guard),
        }
    }

    pub async fn create(
        &self,
        room_id: ObjectId,
        sender_id: ObjectId,
        sender_name: String,
        recipient_id: Option<ObjectId>,
        content: String,
        client_message_id: Option<String>,
    ) -> DaoResult<ChatMessage> {
        let message = ChatMessage {
            id: None,
            room_id,
            sender_id,
            sender_name,
            recipient_id,
            content,
            client_message_id,
            created_at: DateTime::now(),
        };
        let id = self.base.insert_one(&message).await?;
        self.base.find_by_id(id).await
    }

    /// Newest-first page. Direct messages are only visible to their two
    /// parties; `participant_id` narrows to the DM thread with that user.
    pub async fn history(
        &self,
        room_id: ObjectId,
        viewer_id: ObjectId,
        limit: u32,
        cursor: Option<&str>,
        participant_id: Option<ObjectId>,
    ) -> DaoResult<ChatPage> {
        let limit = limit.clamp(1, 100) as i64;

        let mut filter = match participant_id {
            Some(other) => doc! {
                "room_id": room_id,
                "$or": [
                    { "sender_id": viewer_id, "recipient_id": other },
                    { "sender_id": other, "recipient_id": viewer_id },
                ],
            },
            None => doc! {
                "room_id": room_id,
                "$or": [
                    { "recipient_id": bson::Bson::Null },
                    { "recipient_id": viewer_id },
                    { "sender_id": viewer_id },
                ],
            },
        };

        if let Some(cursor) = cursor {
            let cursor_id = ObjectId::parse_str(cursor)
                .map_err(|_| DaoError::Validation("malformed cursor".into()))?;
            filter.insert("_id", doc! { "$lt": cursor_id });
        }

        // Fetch one extra row to learn whether another page exists.
        let mut messages = self
            .base
            .find_many(filter, Some(doc! { "_id": -1 }), Some(limit + 1))
            .await?;

        let next_cursor = if messages.len() as i64 > limit {
            messages.truncate(limit as usize);
            messages
                .last()
                .and_then(|m| m.id)
                .map(|id| id.to_hex())
        } else {
            None
        };

        Ok(ChatPage {
            messages,
            next_cursor,
        })
    }
}
