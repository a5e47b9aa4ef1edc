use connect_services::store::{MemoryBackend, StoreClient};
use connect_services::routing::{RoomRoutingService, ServerStatus};
use std::sync::Arc;

/// A shared in-memory store standing in for Redis; every client built from
/// the same fixture sees the same data, like nodes sharing one cluster.
pub struct SharedStore {
    pub backend: Arc<MemoryBackend>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
        }
    }

    pub fn client(&self) -> StoreClient {
        StoreClient::new(self.backend.clone(), None)
    }

    /// A routing service as one named node would construct it.
    pub fn routing(&self, instance_id: &str) -> RoomRoutingService {
        RoomRoutingService::new(self.client(), instance_id.to_string(), 5000, 5001)
    }
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A status document as a live node would heartbeat it.
pub fn fresh_status(id: &str) -> ServerStatus {
    ServerStatus {
        id: id.to_string(),
        last_heartbeat_ms: chrono::Utc::now().timestamp_millis(),
        signaling_port: 5000,
        api_port: 5001,
    }
}

/// A status document whose heartbeat lapsed beyond the health window.
pub fn stale_status(id: &str) -> ServerStatus {
    ServerStatus {
        last_heartbeat_ms: chrono::Utc::now().timestamp_millis() - 120_000,
        ..fresh_status(id)
    }
}
