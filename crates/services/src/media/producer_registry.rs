use super::kind_str;
use crate::metrics::Metrics;
use crate::store::{PipelineOp, StoreClient, keys};
use dashmap::DashMap;
use event_listener_primitives::HandlerId;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

pub const SOURCE_MICROPHONE: &str = "microphone";
pub const SOURCE_CAMERA: &str = "camera";
pub const SOURCE_SCREEN: &str = "screen";
pub const SOURCE_DATA: &str = "data";
pub const SOURCE_UNKNOWN: &str = "unknown";

/// Everything the rest of the system needs to know about a producer; also
/// the mirror entry format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerMeta {
    pub producer_id: String,
    pub socket_id: String,
    pub room_id: String,
    pub user_id: String,
    pub kind: String,
    pub source: String,
    pub server_id: String,
    #[serde(default)]
    pub app_data: serde_json::Value,
}

/// Published to in-process subscribers (recording, signaling notifications).
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Added(ProducerMeta),
    Closed(ProducerMeta),
}

/// Result of a close/pause/resume attempt.
pub enum ControlOutcome {
    /// Applied to a local producer.
    Done(ProducerMeta),
    /// The producer lives on another node; the caller delegates.
    Foreign(ProducerMeta),
    /// Exists, but the caller does not own it.
    Unauthorized,
    NotFound,
}

struct ProducerEntry {
    producer: Producer,
    meta: ProducerMeta,
    _handlers: Vec<HandlerId>,
}

enum InternalEvent {
    TransportClosed(String),
}

pub struct ProducerRegistry {
    producers: DashMap<String, ProducerEntry>,
    store: StoreClient,
    instance_id: String,
    events: broadcast::Sender<ProducerEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl ProducerRegistry {
    pub fn new(
        store: StoreClient,
        instance_id: String,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            producers: DashMap::new(),
            store,
            instance_id,
            events,
            internal_tx,
            metrics,
        });
        tokio::spawn(Self::event_loop(registry.clone(), internal_rx));
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }

    async fn event_loop(registry: Arc<Self>, mut rx: mpsc::UnboundedReceiver<InternalEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                InternalEvent::TransportClosed(producer_id) => {
                    debug!(%producer_id, "producer transport closed");
                    registry.remove_local(&producer_id).await;
                }
            }
        }
    }

    fn infer_source(kind: MediaKind, app_data: &serde_json::Value) -> String {
        match app_data.get("source").and_then(|s| s.as_str()) {
            Some(s @ (SOURCE_MICROPHONE | SOURCE_CAMERA | SOURCE_SCREEN | SOURCE_DATA)) => {
                s.to_string()
            }
            Some(_) => SOURCE_UNKNOWN.to_string(),
            None => match kind {
                MediaKind::Audio => SOURCE_MICROPHONE.to_string(),
                MediaKind::Video => SOURCE_CAMERA.to_string(),
            },
        }
    }

    pub async fn add(
        &self,
        socket_id: &str,
        user_id: &str,
        room_id: &str,
        producer: Producer,
        app_data: serde_json::Value,
    ) -> ProducerMeta {
        let producer_id = producer.id().to_string();
        let meta = ProducerMeta {
            producer_id: producer_id.clone(),
            socket_id: socket_id.to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            kind: kind_str(producer.kind()).to_string(),
            source: Self::infer_source(producer.kind(), &app_data),
            server_id: self.instance_id.clone(),
            app_data,
        };

        let mut handlers = Vec::new();
        {
            let id = producer_id.clone();
            let tx = self.internal_tx.clone();
            handlers.push(producer.on_transport_close(move || {
                let _ = tx.send(InternalEvent::TransportClosed(id));
            }));
        }

        self.write_mirror(&meta).await;
        self.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                producer,
                meta: meta.clone(),
                _handlers: handlers,
            },
        );
        self.update_gauge();
        debug!(%producer_id, %socket_id, %room_id, kind = %meta.kind, source = %meta.source, "producer added");

        let _ = self.events.send(ProducerEvent::Added(meta.clone()));
        meta
    }

    async fn write_mirror(&self, meta: &ProducerMeta) {
        let raw = match serde_json::to_string(meta) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%e, "producer meta encoding failed");
                return;
            }
        };
        let result = self
            .store
            .pipeline(vec![
                PipelineOp::SetWithTtl {
                    key: keys::producer(&meta.producer_id),
                    value: raw,
                    ttl: keys::STATE_TTL,
                },
                PipelineOp::SetAdd {
                    key: keys::socket_producers(&meta.socket_id),
                    member: meta.producer_id.clone(),
                },
                PipelineOp::SetAdd {
                    key: keys::room_producers(&meta.room_id),
                    member: meta.producer_id.clone(),
                },
            ])
            .await;
        if let Err(e) = result {
            warn!(producer_id = %meta.producer_id, %e, "producer mirror write failed");
        }
    }

    async fn clean_mirror(&self, meta: &ProducerMeta) {
        let result = self
            .store
            .pipeline(vec![
                PipelineOp::Delete {
                    key: keys::producer(&meta.producer_id),
                },
                PipelineOp::SetRemove {
                    key: keys::socket_producers(&meta.socket_id),
                    member: meta.producer_id.clone(),
                },
                PipelineOp::SetRemove {
                    key: keys::room_producers(&meta.room_id),
                    member: meta.producer_id.clone(),
                },
            ])
            .await;
        if let Err(e) = result {
            warn!(producer_id = %meta.producer_id, %e, "producer mirror cleanup failed");
        }
    }

    pub fn get(&self, producer_id: &str) -> Option<Producer> {
        self.producers.get(producer_id).map(|e| e.producer.clone())
    }

    pub fn meta(&self, producer_id: &str) -> Option<ProducerMeta> {
        self.producers.get(producer_id).map(|e| e.meta.clone())
    }

    /// Local-first lookup; a mirror-only hit names the owning node.
    pub async fn find(&self, producer_id: &str) -> Option<ProducerMeta> {
        if let Some(meta) = self.meta(producer_id) {
            return Some(meta);
        }
        self.store
            .get_json::<ProducerMeta>(&keys::producer(producer_id))
            .await
            .ok()
            .flatten()
    }

    async fn remove_local(&self, producer_id: &str) -> Option<ProducerMeta> {
        let (_, entry) = self.producers.remove(producer_id)?;
        let meta = entry.meta.clone();
        // Dropping the entry closes the producer; attached consumers get
        // their producer-close hooks from the SFU.
        drop(entry);
        self.update_gauge();
        self.clean_mirror(&meta).await;
        let _ = self.events.send(ProducerEvent::Closed(meta.clone()));
        Some(meta)
    }

    /// Owner-only close. A mirror-only entry is always cleaned (covers the
    /// takeover window) and reported as foreign for delegation.
    pub async fn close(&self, user_id: &str, producer_id: &str) -> ControlOutcome {
        if let Some(meta) = self.meta(producer_id) {
            if meta.user_id != user_id {
                return ControlOutcome::Unauthorized;
            }
            match self.remove_local(producer_id).await {
                Some(meta) => return ControlOutcome::Done(meta),
                None => return ControlOutcome::NotFound,
            }
        }

        match self.find(producer_id).await {
            Some(meta) => {
                if meta.user_id != user_id {
                    return ControlOutcome::Unauthorized;
                }
                self.clean_mirror(&meta).await;
                if meta.server_id != self.instance_id {
                    ControlOutcome::Foreign(meta)
                } else {
                    // Stale local mirror from a crashed predecessor.
                    ControlOutcome::Done(meta)
                }
            }
            None => ControlOutcome::NotFound,
        }
    }

    pub async fn pause(&self, user_id: &str, producer_id: &str) -> ControlOutcome {
        self.set_paused(user_id, producer_id, true).await
    }

    pub async fn resume(&self, user_id: &str, producer_id: &str) -> ControlOutcome {
        self.set_paused(user_id, producer_id, false).await
    }

    async fn set_paused(&self, user_id: &str, producer_id: &str, paused: bool) -> ControlOutcome {
        let local = {
            match self.producers.get(producer_id) {
                Some(entry) => {
                    if entry.meta.user_id != user_id {
                        return ControlOutcome::Unauthorized;
                    }
                    Some((entry.producer.clone(), entry.meta.clone()))
                }
                None => None,
            }
        };

        if let Some((producer, meta)) = local {
            let result = if paused {
                producer.pause().await
            } else {
                producer.resume().await
            };
            return match result {
                Ok(()) => ControlOutcome::Done(meta),
                Err(e) => {
                    warn!(%producer_id, %e, paused, "producer pause/resume failed");
                    ControlOutcome::NotFound
                }
            };
        }

        match self.find(producer_id).await {
            Some(meta) if meta.user_id != user_id => ControlOutcome::Unauthorized,
            Some(meta) if meta.server_id != self.instance_id => ControlOutcome::Foreign(meta),
            Some(_) | None => ControlOutcome::NotFound,
        }
    }

    /// Host-forced mute path: pauses this room's local producers of one
    /// user and kind.
    pub async fn pause_by_kind(
        &self,
        room_id: &str,
        user_id: &str,
        kind: MediaKind,
    ) -> Vec<ProducerMeta> {
        self.set_paused_by_kind(room_id, user_id, kind, true).await
    }

    pub async fn resume_by_kind(
        &self,
        room_id: &str,
        user_id: &str,
        kind: MediaKind,
    ) -> Vec<ProducerMeta> {
        self.set_paused_by_kind(room_id, user_id, kind, false).await
    }

    async fn set_paused_by_kind(
        &self,
        room_id: &str,
        user_id: &str,
        kind: MediaKind,
        paused: bool,
    ) -> Vec<ProducerMeta> {
        let kind = kind_str(kind);
        let targets: Vec<(Producer, ProducerMeta)> = self
            .producers
            .iter()
            .filter(|e| {
                e.meta.room_id == room_id && e.meta.user_id == user_id && e.meta.kind == kind
            })
            .map(|e| (e.producer.clone(), e.meta.clone()))
            .collect();

        let mut affected = Vec::new();
        for (producer, meta) in targets {
            let result = if paused {
                producer.pause().await
            } else {
                producer.resume().await
            };
            match result {
                Ok(()) => affected.push(meta),
                Err(e) => warn!(producer_id = %meta.producer_id, %e, "pause-by-kind failed"),
            }
        }
        affected
    }

    /// Producers visible to a joining socket: the local registry filtered
    /// by room, excluding the socket's own.
    pub fn list_room(&self, room_id: &str, exclude_socket: Option<&str>) -> Vec<ProducerMeta> {
        self.producers
            .iter()
            .filter(|e| e.meta.room_id == room_id)
            .filter(|e| exclude_socket.is_none_or(|s| e.meta.socket_id != s))
            .map(|e| e.meta.clone())
            .collect()
    }

    /// Closes everything the socket owned, mirror included.
    pub async fn close_all(&self, socket_id: &str) -> Vec<ProducerMeta> {
        let mut ids: HashSet<String> = self
            .producers
            .iter()
            .filter(|e| e.meta.socket_id == socket_id)
            .map(|e| e.key().clone())
            .collect();

        match self
            .store
            .set_members(&keys::socket_producers(socket_id))
            .await
        {
            Ok(mirrored) => ids.extend(mirrored),
            Err(e) => warn!(%socket_id, %e, "producer mirror index unavailable"),
        }

        let mut closed = Vec::new();
        for producer_id in &ids {
            if let Some(meta) = self.remove_local(producer_id).await {
                closed.push(meta);
            } else if let Ok(Some(meta)) = self
                .store
                .get_json::<ProducerMeta>(&keys::producer(producer_id))
                .await
            {
                self.clean_mirror(&meta).await;
                closed.push(meta);
            }
        }
        if let Err(e) = self.store.delete(&keys::socket_producers(socket_id)).await {
            warn!(%socket_id, %e, "producer socket index cleanup failed");
        }
        closed
    }

    pub fn count(&self) -> usize {
        self.producers.len()
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.producers.set(self.producers.len() as i64);
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
