use bson::{DateTime, doc, oid::ObjectId};
use connect_db::models::{
    JoinRequest, JoinRequestStatus, ParticipantRole, Room, RoomParticipant, RoomSettings,
    RoomStatus,
};
use mongodb::Database;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::base::{BaseDao, DaoError, DaoResult, DbGuard};
use crate::codes;

/// Join races (two tabs, reconnect storms) resolve against the unique
/// (room, user) participant index with these short waits between attempts.
const JOIN_RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(1), Duration::from_millis(10)];

pub struct RoomDao {
    pub base: BaseDao<Room>,
    pub participants: BaseDao<RoomParticipant>,
    pub join_requests: BaseDao<JoinRequest>,
}

impl RoomDao {
    pub fn new(db: &Database, guard: Arc<DbGuard>) -> Self {
        Self {
            base: BaseDao::new(db, Room::COLLECTION, guard.clone()),
            participants: BaseDao::new(db, RoomParticipant::COLLECTION, guard.clone()),
            join_requests: BaseDao::new(db, JoinRequest::COLLECTION, guard),
        }
    }

    pub async fn create(&self, host_user_id: ObjectId, name: String) -> DaoResult<Room> {
        // Codes are generated uniformly; collide against the unique index
        // and regenerate instead of checking first.
        for _ in 0..5 {
            let now = DateTime::now();
            let room = Room {
                id: None,
                room_code: codes::generate(),
                name: name.clone(),
                host_user_id,
                status: RoomStatus::Active,
                settings: RoomSettings::default(),
                participant_count: 0,
                created_at: now,
                updated_at: now,
                closed_at: None,
            };
            match self.base.insert_one(&room).await {
                Ok(id) => return self.base.find_by_id(id).await,
                Err(DaoError::DuplicateKey(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(DaoError::Validation(
            "could not generate a unique room code".into(),
        ))
    }

    pub async fn find_by_code(&self, code: &str) -> DaoResult<Room> {
        let normalized = codes::normalize(code);
        if !codes::is_valid(&normalized) {
            return Err(DaoError::Validation(format!(
                "malformed room code: {code}"
            )));
        }
        self.base
            .find_one(doc! { "room_code": normalized, "status": "active" })
            .await?
            .ok_or(DaoError::NotFound)
    }

    pub async fn close(&self, room_id: ObjectId) -> DaoResult<bool> {
        self.base
            .update_by_id(
                room_id,
                doc! { "$set": { "status": "closed", "closed_at": DateTime::now() } },
            )
            .await
    }

    pub async fn update_settings(
        &self,
        room_id: ObjectId,
        settings: &RoomSettings,
    ) -> DaoResult<bool> {
        self.base
            .update_by_id(
                room_id,
                doc! { "$set": { "settings": bson::to_bson(settings)? } },
            )
            .await
    }

    /// Upserts the participant row for a join. Rejoins reset `left_at`;
    /// concurrent first-joins race on the unique index and retry.
    pub async fn join_participant(
        &self,
        room: &Room,
        user_id: ObjectId,
        display_name: String,
        email: Option<String>,
        picture: Option<String>,
    ) -> DaoResult<RoomParticipant> {
        let room_id = room.id.ok_or(DaoError::NotFound)?;
        let role = if room.host_user_id == user_id {
            ParticipantRole::Host
        } else {
            ParticipantRole::Guest
        };

        let mut attempt = 0;
        loop {
            match self
                .try_join(room_id, user_id, &display_name, &email, &picture, &role)
                .await
            {
                Ok(participant) => return Ok(participant),
                Err(DaoError::DuplicateKey(_)) if attempt < JOIN_RETRY_DELAYS.len() => {
                    debug!(%room_id, %user_id, attempt, "join raced, retrying");
                    tokio::time::sleep(JOIN_RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_join(
        &self,
        room_id: ObjectId,
        user_id: ObjectId,
        display_name: &str,
        email: &Option<String>,
        picture: &Option<String>,
        role: &ParticipantRole,
    ) -> DaoResult<RoomParticipant> {
        let now = DateTime::now();
        let existing = self
            .participants
            .find_one(doc! { "room_id": room_id, "user_id": user_id })
            .await?;

        if let Some(existing) = existing {
            let id = existing.id.ok_or(DaoError::NotFound)?;
            let was_gone = existing.left_at.is_some();
            self.participants
                .update_by_id(
                    id,
                    doc! { "$set": {
                        "display_name": display_name,
                        "email": email.clone(),
                        "picture": picture.clone(),
                        "joined_at": now,
                        "left_at": bson::Bson::Null,
                    }},
                )
                .await?;
            if was_gone {
                self.base
                    .update_by_id(room_id, doc! { "$inc": { "participant_count": 1 } })
                    .await?;
            }
            return self.participants.find_by_id(id).await;
        }

        let participant = RoomParticipant {
            id: None,
            room_id,
            user_id,
            display_name: display_name.to_string(),
            email: email.clone(),
            picture: picture.clone(),
            role: role.clone(),
            joined_at: now,
            left_at: None,
            audio_muted: false,
            video_muted: false,
            audio_muted_by_host: false,
            video_muted_by_host: false,
            mute_updated_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = self.participants.insert_one(&participant).await?;
        self.base
            .update_by_id(room_id, doc! { "$inc": { "participant_count": 1 } })
            .await?;
        self.participants.find_by_id(id).await
    }

    pub async fn leave_participant(
        &self,
        room_id: ObjectId,
        user_id: ObjectId,
    ) -> DaoResult<bool> {
        let updated = self
            .participants
            .update_one(
                doc! { "room_id": room_id, "user_id": user_id, "left_at": bson::Bson::Null },
                doc! { "$set": { "left_at": DateTime::now() } },
            )
            .await?;
        if updated {
            self.base
                .update_by_id(room_id, doc! { "$inc": { "participant_count": -1 } })
                .await?;
        }
        Ok(updated)
    }

    pub async fn active_participants(
        &self,
        room_id: ObjectId,
    ) -> DaoResult<Vec<RoomParticipant>> {
        self.participants
            .find_many(
                doc! { "room_id": room_id, "left_at": bson::Bson::Null },
                Some(doc! { "joined_at": 1 }),
                None,
            )
            .await
    }

    pub async fn find_participant(
        &self,
        room_id: ObjectId,
        user_id: ObjectId,
    ) -> DaoResult<Option<RoomParticipant>> {
        self.participants
            .find_one(doc! { "room_id": room_id, "user_id": user_id })
            .await
    }

    /// Durable shadow of the mute mirror; failures here degrade to the
    /// shared store's copy.
    pub async fn set_mute_shadow(
        &self,
        room_id: ObjectId,
        user_id: ObjectId,
        audio: Option<(bool, bool)>,
        video: Option<(bool, bool)>,
    ) -> DaoResult<bool> {
        let mut set = doc! { "mute_updated_at": DateTime::now() };
        if let Some((muted, by_host)) = audio {
            set.insert("audio_muted", muted);
            set.insert("audio_muted_by_host", by_host);
        }
        if let Some((muted, by_host)) = video {
            set.insert("video_muted", muted);
            set.insert("video_muted_by_host", by_host);
        }
        self.participants
            .update_one(
                doc! { "room_id": room_id, "user_id": user_id },
                doc! { "$set": set },
            )
            .await
    }

    // --- join requests ---

    /// Idempotent: a second request while one is pending returns the
    /// pending one.
    pub async fn create_join_request(
        &self,
        room_id: ObjectId,
        user_id: ObjectId,
        display_name: String,
    ) -> DaoResult<JoinRequest> {
        if let Some(pending) = self
            .join_requests
            .find_one(doc! { "room_id": room_id, "user_id": user_id, "status": "pending" })
            .await?
        {
            return Ok(pending);
        }

        let request = JoinRequest {
            id: None,
            room_id,
            user_id,
            display_name,
            status: JoinRequestStatus::Pending,
            created_at: DateTime::now(),
            resolved_at: None,
            resolved_by: None,
        };
        match self.join_requests.insert_one(&request).await {
            Ok(id) => self.join_requests.find_by_id(id).await,
            // Raced another request from the same user; the index kept one.
            Err(DaoError::DuplicateKey(_)) => {
                warn!(%room_id, %user_id, "join request raced");
                self.join_requests
                    .find_one(doc! { "room_id": room_id, "user_id": user_id, "status": "pending" })
                    .await?
                    .ok_or(DaoError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn pending_requests(&self, room_id: ObjectId) -> DaoResult<Vec<JoinRequest>> {
        self.join_requests
            .find_many(
                doc! { "room_id": room_id, "status": "pending" },
                Some(doc! { "created_at": 1 }),
                None,
            )
            .await
    }

    pub async fn resolve_request(
        &self,
        request_id: ObjectId,
        approved: bool,
        resolver: ObjectId,
    ) -> DaoResult<JoinRequest> {
        let request = self.join_requests.find_by_id(request_id).await?;
        if request.status != JoinRequestStatus::Pending {
            return Err(DaoError::Validation("join request already resolved".into()));
        }
        let status = if approved { "approved" } else { "rejected" };
        self.join_requests
            .update_by_id(
                request_id,
                doc! { "$set": {
                    "status": status,
                    "resolved_at": DateTime::now(),
                    "resolved_by": resolver,
                }},
            )
            .await?;
        self.join_requests.find_by_id(request_id).await
    }
}
