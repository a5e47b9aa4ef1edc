use super::codecs::media_codecs;
use super::worker_pool::WorkerPool;
use crate::metrics::Metrics;
use crate::routing::RoomRoutingService;
use crate::store::{StoreClient, keys};
use dashmap::DashMap;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One router per room on this node, mirrored cross-node for discovery.
pub struct RouterRegistry {
    routers: DashMap<String, RouterEntry>,
    /// Serializes concurrent creations for the same room.
    create_lock: Mutex<()>,
    worker_pool: Arc<WorkerPool>,
    routing: Arc<RoomRoutingService>,
    store: StoreClient,
    metrics: Option<Arc<Metrics>>,
}

struct RouterEntry {
    router: Router,
    worker_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterMirror {
    pub router_id: String,
    pub server_id: String,
}

impl RouterRegistry {
    pub fn new(
        worker_pool: Arc<WorkerPool>,
        routing: Arc<RoomRoutingService>,
        store: StoreClient,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            routers: DashMap::new(),
            create_lock: Mutex::new(()),
            worker_pool,
            routing,
            store,
            metrics,
        }
    }

    pub fn get(&self, room_id: &str) -> Option<Router> {
        self.routers.get(room_id).map(|e| e.router.clone())
    }

    pub async fn get_or_create(&self, room_id: &str) -> anyhow::Result<Router> {
        if let Some(router) = self.get(room_id) {
            return Ok(router);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(router) = self.get(room_id) {
            return Ok(router);
        }

        if !self.routing.should_handle(room_id).await {
            // Failover window: a client landed here while the mapping still
            // points at a healthy peer. Serve it anyway.
            warn!(%room_id, "creating router for a room assigned elsewhere");
        }

        let (worker, worker_index) = self
            .worker_pool
            .acquire()
            .ok_or_else(|| anyhow::anyhow!("no live media workers"))?;

        let router = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| anyhow::anyhow!("failed to create router: {}", e))?;
        self.worker_pool.register_router(worker_index);

        let mirror = RouterMirror {
            router_id: router.id().to_string(),
            server_id: self.routing.instance_id().to_string(),
        };
        if let Err(e) = self
            .store
            .set_json_with_ttl(&keys::router(room_id), &mirror, keys::ROUTER_TTL)
            .await
        {
            warn!(%room_id, %e, "router mirror write failed");
        }

        info!(%room_id, router_id = %router.id(), worker_index, "router created");
        self.routers.insert(
            room_id.to_string(),
            RouterEntry {
                router: router.clone(),
                worker_index,
            },
        );
        self.update_gauge();
        Ok(router)
    }

    /// Closes the room's router (drop closes the SFU object) and removes
    /// the mirror.
    pub async fn close(&self, room_id: &str) -> bool {
        let Some((_, entry)) = self.routers.remove(room_id) else {
            return false;
        };
        self.worker_pool.unregister_router(entry.worker_index);
        drop(entry);

        if let Err(e) = self.store.delete(&keys::router(room_id)).await {
            warn!(%room_id, %e, "router mirror delete failed");
        }
        self.routing.release_room(room_id).await;
        info!(%room_id, "router closed");
        self.update_gauge();
        true
    }

    pub fn count(&self) -> usize {
        self.routers.len()
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.routers.set(self.routers.len() as i64);
        }
    }
}
