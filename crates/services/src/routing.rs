use crate::store::{PipelineOp, StoreClient, StoreError, keys};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A server is healthy while its last heartbeat is younger than this.
pub const HEARTBEAT_TTL_MS: i64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub id: String,
    pub last_heartbeat_ms: i64,
    pub signaling_port: u16,
    pub api_port: u16,
}

impl ServerStatus {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms - self.last_heartbeat_ms < HEARTBEAT_TTL_MS
    }
}

/// Deterministic room→server placement over the healthy fleet, plus the
/// liveness heartbeat. Rooms are assigned by rendezvous hashing so a
/// membership change only re-maps the rooms won by the new server.
pub struct RoomRoutingService {
    store: StoreClient,
    instance_id: String,
    signaling_port: u16,
    api_port: u16,
}

impl RoomRoutingService {
    pub fn new(
        store: StoreClient,
        instance_id: String,
        signaling_port: u16,
        api_port: u16,
    ) -> Self {
        Self {
            store,
            instance_id,
            signaling_port,
            api_port,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn own_status(&self) -> ServerStatus {
        ServerStatus {
            id: self.instance_id.clone(),
            last_heartbeat_ms: Self::now_ms(),
            signaling_port: self.signaling_port,
            api_port: self.api_port,
        }
    }

    pub async fn heartbeat(&self) -> Result<(), StoreError> {
        self.store
            .set_json_with_ttl(
                &keys::server_status(&self.instance_id),
                &self.own_status(),
                keys::SERVER_STATUS_TTL,
            )
            .await
    }

    /// Removes the own status key so peers stop routing here immediately.
    pub async fn shutdown(&self) {
        if let Err(e) = self
            .store
            .delete(&keys::server_status(&self.instance_id))
            .await
        {
            warn!(%e, "failed to remove own status key");
        }
    }

    /// Healthy servers sorted by id. The own node is always included, even
    /// when its own heartbeat write is lagging.
    pub async fn healthy_servers(&self) -> Result<Vec<ServerStatus>, StoreError> {
        let now_ms = Self::now_ms();
        let mut servers = Vec::new();

        for key in self.store.scan_keys(keys::server_status_pattern()).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<ServerStatus>(&raw) {
                Ok(status) if status.is_fresh(now_ms) => servers.push(status),
                Ok(_) => {}
                Err(e) => warn!(%key, %e, "undecodable server status"),
            }
        }

        if !servers.iter().any(|s| s.id == self.instance_id) {
            servers.push(self.own_status());
        }
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    async fn is_server_healthy(&self, server_id: &str) -> Result<bool, StoreError> {
        if server_id == self.instance_id {
            return Ok(true);
        }
        let Some(status) = self
            .store
            .get_json::<ServerStatus>(&keys::server_status(server_id))
            .await?
        else {
            return Ok(false);
        };
        Ok(status.is_fresh(Self::now_ms()))
    }

    /// Resolves the owning server for a room, assigning one when needed.
    /// Under store failure this falls back to the local node: serving
    /// locally beats rejecting the join.
    pub async fn get_or_assign(&self, room_id: &str) -> String {
        match self.try_get_or_assign(room_id).await {
            Ok(server_id) => server_id,
            Err(e) => {
                warn!(%room_id, %e, "routing degraded, serving locally");
                self.instance_id.clone()
            }
        }
    }

    async fn try_get_or_assign(&self, room_id: &str) -> Result<String, StoreError> {
        if let Some(owner) = self.store.get(&keys::room_route(room_id)).await? {
            if self.is_server_healthy(&owner).await? {
                return Ok(owner);
            }
            self.store
                .pipeline(vec![
                    PipelineOp::Delete {
                        key: keys::room_route(room_id),
                    },
                    PipelineOp::SetRemove {
                        key: keys::server_rooms(&owner),
                        member: room_id.to_string(),
                    },
                ])
                .await?;
        }

        let healthy = self.healthy_servers().await?;
        let target = rendezvous_pick(room_id, &healthy)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| self.instance_id.clone());

        self.store
            .pipeline(vec![
                PipelineOp::SetWithTtl {
                    key: keys::room_route(room_id),
                    value: target.clone(),
                    ttl: keys::ROOM_ROUTE_TTL,
                },
                PipelineOp::SetAdd {
                    key: keys::server_rooms(&target),
                    member: room_id.to_string(),
                },
            ])
            .await?;

        info!(%room_id, server = %target, "room assigned");
        Ok(target)
    }

    /// Whether this node should host the room right now. Takes over (and
    /// rewrites the mapping) when the current owner's heartbeat has lapsed.
    pub async fn should_handle(&self, room_id: &str) -> bool {
        match self.try_should_handle(room_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%room_id, %e, "routing degraded, handling locally");
                true
            }
        }
    }

    async fn try_should_handle(&self, room_id: &str) -> Result<bool, StoreError> {
        let Some(owner) = self.store.get(&keys::room_route(room_id)).await? else {
            return Ok(true);
        };
        if owner == self.instance_id {
            return Ok(true);
        }
        if self.is_server_healthy(&owner).await? {
            return Ok(false);
        }

        self.store
            .pipeline(vec![
                PipelineOp::SetWithTtl {
                    key: keys::room_route(room_id),
                    value: self.instance_id.clone(),
                    ttl: keys::ROOM_ROUTE_TTL,
                },
                PipelineOp::SetRemove {
                    key: keys::server_rooms(&owner),
                    member: room_id.to_string(),
                },
                PipelineOp::SetAdd {
                    key: keys::server_rooms(&self.instance_id),
                    member: room_id.to_string(),
                },
            ])
            .await?;
        info!(%room_id, previous = %owner, "took over room from dead server");
        Ok(true)
    }

    /// Drops the assignment when a room closes on this node.
    pub async fn release_room(&self, room_id: &str) {
        let result = self
            .store
            .pipeline(vec![
                PipelineOp::Delete {
                    key: keys::room_route(room_id),
                },
                PipelineOp::SetRemove {
                    key: keys::server_rooms(&self.instance_id),
                    member: room_id.to_string(),
                },
            ])
            .await;
        if let Err(e) = result {
            warn!(%room_id, %e, "failed to release room assignment");
        }
    }

    /// Rooms currently indexed to this server (diagnostics only).
    pub async fn room_count(&self) -> u64 {
        self.store
            .set_cardinality(&keys::server_rooms(&self.instance_id))
            .await
            .unwrap_or(0)
    }
}

fn weight(room_id: &str, server_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(room_id.as_bytes());
    hasher.update(b":");
    hasher.update(server_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 digest is 32 bytes"))
}

/// Highest-random-weight choice over the healthy set.
pub fn rendezvous_pick<'a>(
    room_id: &str,
    healthy: &'a [ServerStatus],
) -> Option<&'a ServerStatus> {
    healthy.iter().max_by_key(|s| weight(room_id, &s.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    fn service(backend: Arc<MemoryBackend>, id: &str) -> RoomRoutingService {
        RoomRoutingService::new(StoreClient::new(backend, None), id.to_string(), 5000, 5001)
    }

    fn status(id: &str) -> ServerStatus {
        ServerStatus {
            id: id.to_string(),
            last_heartbeat_ms: chrono::Utc::now().timestamp_millis(),
            signaling_port: 5000,
            api_port: 5001,
        }
    }

    #[tokio::test]
    async fn assigns_and_reuses_mapping() {
        let backend = Arc::new(MemoryBackend::new());
        let routing = service(backend.clone(), "node-a");
        routing.heartbeat().await.unwrap();

        let owner = routing.get_or_assign("room-1").await;
        assert_eq!(owner, "node-a");
        assert_eq!(routing.get_or_assign("room-1").await, "node-a");

        let store = StoreClient::new(backend, None);
        assert_eq!(
            store.get(&keys::room_route("room-1")).await.unwrap(),
            Some("node-a".to_string())
        );
        assert_eq!(
            store
                .set_members(&keys::server_rooms("node-a"))
                .await
                .unwrap(),
            vec!["room-1".to_string()]
        );
    }

    #[tokio::test]
    async fn stale_owner_is_replaced() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StoreClient::new(backend.clone(), None);

        let stale = ServerStatus {
            last_heartbeat_ms: chrono::Utc::now().timestamp_millis() - HEARTBEAT_TTL_MS - 1000,
            ..status("node-dead")
        };
        store
            .set_json_with_ttl(
                &keys::server_status("node-dead"),
                &stale,
                keys::SERVER_STATUS_TTL,
            )
            .await
            .unwrap();
        store
            .set_with_ttl(
                &keys::room_route("room-1"),
                "node-dead",
                keys::ROOM_ROUTE_TTL,
            )
            .await
            .unwrap();

        let routing = service(backend, "node-b");
        routing.heartbeat().await.unwrap();
        assert_eq!(routing.get_or_assign("room-1").await, "node-b");
    }

    #[tokio::test]
    async fn should_handle_takes_over_dead_owner() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StoreClient::new(backend.clone(), None);
        store
            .set_with_ttl(&keys::room_route("room-1"), "node-gone", keys::ROOM_ROUTE_TTL)
            .await
            .unwrap();

        let routing = service(backend.clone(), "node-b");
        assert!(routing.should_handle("room-1").await);
        assert_eq!(
            store.get(&keys::room_route("room-1")).await.unwrap(),
            Some("node-b".to_string())
        );
    }

    #[tokio::test]
    async fn healthy_owner_is_respected() {
        let backend = Arc::new(MemoryBackend::new());
        let other = service(backend.clone(), "node-a");
        other.heartbeat().await.unwrap();

        let store = StoreClient::new(backend.clone(), None);
        store
            .set_with_ttl(&keys::room_route("room-1"), "node-a", keys::ROOM_ROUTE_TTL)
            .await
            .unwrap();

        let routing = service(backend, "node-b");
        assert!(!routing.should_handle("room-1").await);
    }

    #[tokio::test]
    async fn store_failure_falls_back_to_local() {
        let backend = Arc::new(MemoryBackend::new());
        let routing = service(backend.clone(), "node-a");
        backend.set_failing(true);

        assert_eq!(routing.get_or_assign("room-1").await, "node-a");
        assert!(routing.should_handle("room-1").await);
    }

    #[test]
    fn rendezvous_remaps_only_to_the_new_server() {
        let mut servers: Vec<ServerStatus> = (0..10).map(|i| status(&format!("node-{i:02}"))).collect();
        let rooms: Vec<String> = (0..1000).map(|i| format!("room-{i}")).collect();

        let before: Vec<String> = rooms
            .iter()
            .map(|r| rendezvous_pick(r, &servers).unwrap().id.clone())
            .collect();

        servers.push(status("node-new"));
        servers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut moved = 0;
        for (room, old) in rooms.iter().zip(&before) {
            let new = &rendezvous_pick(room, &servers).unwrap().id;
            if new != old {
                moved += 1;
                assert_eq!(new, "node-new", "{room} moved to an existing server");
            }
        }

        // Expected share is 1/11 of 1000 ≈ 91; allow generous sampling slack.
        assert!(moved > 30, "suspiciously few rooms moved: {moved}");
        assert!(moved < 180, "too many rooms moved: {moved}");
    }
}
