use bson::{DateTime, doc, oid::ObjectId};
use connect_db::models::{RecordingAsset, RecordingSession, RecordingStatus};
use mongodb::Database;
use std::sync::Arc;

use super::base::{BaseDao, DaoResult, DbGuard};

pub struct RecordingDao {
    pub base: BaseDao<RecordingSession>,
}

impl RecordingDao {
    pub fn new(db: &Database, guard: Arc<DbGuard>) -> Self {
        Self {
            base: BaseDao::new(db, RecordingSession::COLLECTION, guard),
        }
    }

    pub async fn create(
        &self,
        room_id: ObjectId,
        host_user_id: ObjectId,
    ) -> DaoResult<RecordingSession> {
        let now = DateTime::now();
        let session = RecordingSession {
            id: None,
            room_id,
            host_user_id,
            status: RecordingStatus::Starting,
            started_at: now,
            ended_at: None,
            duration_secs: None,
            error: None,
            asset: None,
            created_at: now,
            updated_at: now,
        };
        let id = self.base.insert_one(&session).await?;
        self.base.find_by_id(id).await
    }

    pub async fn set_status(
        &self,
        session_id: ObjectId,
        status: RecordingStatus,
    ) -> DaoResult<bool> {
        self.base
            .update_by_id(
                session_id,
                doc! { "$set": { "status": bson::to_bson(&status)? } },
            )
            .await
    }

    pub async fn mark_failed(&self, session_id: ObjectId, error: &str) -> DaoResult<bool> {
        self.base
            .update_by_id(
                session_id,
                doc! { "$set": {
                    "status": "FAILED",
                    "error": error,
                    "ended_at": DateTime::now(),
                }},
            )
            .await
    }

    pub async fn set_asset(
        &self,
        session_id: ObjectId,
        asset: &RecordingAsset,
    ) -> DaoResult<bool> {
        self.base
            .update_by_id(
                session_id,
                doc! { "$set": { "asset": bson::to_bson(asset)? } },
            )
            .await
    }

    pub async fn finish(
        &self,
        session_id: ObjectId,
        status: RecordingStatus,
        duration_secs: u32,
    ) -> DaoResult<bool> {
        self.base
            .update_by_id(
                session_id,
                doc! { "$set": {
                    "status": bson::to_bson(&status)?,
                    "ended_at": DateTime::now(),
                    "duration_secs": duration_secs,
                }},
            )
            .await
    }

    pub async fn find_active(&self, room_id: ObjectId) -> DaoResult<Option<RecordingSession>> {
        self.base
            .find_one(doc! {
                "room_id": room_id,
                "status": { "$in": ["STARTING", "RECORDING", "UPLOADING"] },
            })
            .await
    }
}
