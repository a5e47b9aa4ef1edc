use crate::dao::{DaoResult, RoomDao};
use crate::store::{PipelineOp, StoreClient, keys};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Per-user mute flags: live copy in the shared store (refresh TTL),
/// durable shadow on the participant row. The mirror write is best-effort;
/// the database row is authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuteState {
    pub audio_muted: bool,
    pub video_muted: bool,
    pub audio_forced_by_host: bool,
    pub video_forced_by_host: bool,
    pub updated_at_ms: i64,
}

/// Host-set room-wide controls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomControl {
    pub chat_muted: bool,
    pub updated_at_ms: i64,
}

pub struct MuteService {
    store: StoreClient,
    rooms: Arc<RoomDao>,
}

impl MuteService {
    pub fn new(store: StoreClient, rooms: Arc<RoomDao>) -> Self {
        Self { store, rooms }
    }

    pub async fn set_audio(
        &self,
        room_code: &str,
        room_id: ObjectId,
        user_id: ObjectId,
        muted: bool,
        forced_by_host: bool,
    ) -> DaoResult<MuteState> {
        let state = self
            .write_mirror(room_code, &user_id.to_hex(), |s| {
                s.audio_muted = muted;
                s.audio_forced_by_host = forced_by_host;
            })
            .await;
        self.rooms
            .set_mute_shadow(room_id, user_id, Some((muted, forced_by_host)), None)
            .await?;
        Ok(state)
    }

    pub async fn set_video(
        &self,
        room_code: &str,
        room_id: ObjectId,
        user_id: ObjectId,
        muted: bool,
        forced_by_host: bool,
    ) -> DaoResult<MuteState> {
        let state = self
            .write_mirror(room_code, &user_id.to_hex(), |s| {
                s.video_muted = muted;
                s.video_forced_by_host = forced_by_host;
            })
            .await;
        self.rooms
            .set_mute_shadow(room_id, user_id, None, Some((muted, forced_by_host)))
            .await?;
        Ok(state)
    }

    /// Read-modify-write of the mirror entry in one atomic pipeline. A
    /// store failure downgrades silently; the shadow row still lands.
    async fn write_mirror(
        &self,
        room_code: &str,
        user_id: &str,
        apply: impl FnOnce(&mut MuteState),
    ) -> MuteState {
        let key = keys::room_mute(room_code, user_id);
        let mut state = match self.store.get_json::<MuteState>(&key).await {
            Ok(Some(state)) => state,
            Ok(None) => MuteState::default(),
            Err(e) => {
                warn!(%key, %e, "mute mirror read failed, starting fresh");
                MuteState::default()
            }
        };
        apply(&mut state);
        state.updated_at_ms = chrono::Utc::now().timestamp_millis();

        match serde_json::to_string(&state) {
            Ok(raw) => {
                let result = self
                    .store
                    .pipeline(vec![PipelineOp::SetWithTtl {
                        key: key.clone(),
                        value: raw,
                        ttl: keys::MUTE_TTL,
                    }])
                    .await;
                if let Err(e) = result {
                    warn!(%key, %e, "mute mirror write failed, shadow only");
                }
            }
            Err(e) => warn!(%key, %e, "mute state encoding failed"),
        }
        state
    }

    pub async fn state_of(&self, room_code: &str, user_id: &str) -> MuteState {
        self.store
            .get_json::<MuteState>(&keys::room_mute(room_code, user_id))
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub async fn control(&self, room_code: &str) -> RoomControl {
        self.store
            .get_json::<RoomControl>(&keys::room_control(room_code))
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub async fn set_control(&self, room_code: &str, chat_muted: bool) {
        let control = RoomControl {
            chat_muted,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let result = self
            .store
            .set_json_with_ttl(&keys::room_control(room_code), &control, keys::MUTE_TTL)
            .await;
        if let Err(e) = result {
            warn!(%room_code, %e, "room control write failed");
        }
    }
}
