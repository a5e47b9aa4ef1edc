use super::kind_str;
use crate::metrics::Metrics;
use crate::store::{PipelineOp, StoreClient, keys};
use dashmap::DashMap;
use event_listener_primitives::HandlerId;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerMeta {
    pub consumer_id: String,
    pub socket_id: String,
    pub producer_id: String,
    pub kind: String,
    pub server_id: String,
}

struct ConsumerEntry {
    _consumer: Consumer,
    meta: ConsumerMeta,
    _handlers: Vec<HandlerId>,
}

enum InternalEvent {
    Remove(String),
}

/// Consumers owned by this node's sockets. Both `transport-close` and
/// `producer-close` remove the entry; the drop closes the SFU object (the
/// primitive does not cascade on producer close by itself).
pub struct ConsumerRegistry {
    consumers: DashMap<String, ConsumerEntry>,
    store: StoreClient,
    instance_id: String,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl ConsumerRegistry {
    pub fn new(
        store: StoreClient,
        instance_id: String,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            consumers: DashMap::new(),
            store,
            instance_id,
            internal_tx,
            metrics,
        });
        tokio::spawn(Self::event_loop(registry.clone(), internal_rx));
        registry
    }

    async fn event_loop(registry: Arc<Self>, mut rx: mpsc::UnboundedReceiver<InternalEvent>) {
        while let Some(InternalEvent::Remove(consumer_id)) = rx.recv().await {
            registry.remove(&consumer_id).await;
        }
    }

    pub async fn add(&self, socket_id: &str, consumer: Consumer) -> ConsumerMeta {
        let consumer_id = consumer.id().to_string();
        let meta = ConsumerMeta {
            consumer_id: consumer_id.clone(),
            socket_id: socket_id.to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: kind_str(consumer.kind()).to_string(),
            server_id: self.instance_id.clone(),
        };

        let mut handlers = Vec::new();
        {
            let id = consumer_id.clone();
            let tx = self.internal_tx.clone();
            handlers.push(consumer.on_transport_close(move || {
                let _ = tx.send(InternalEvent::Remove(id));
            }));
        }
        {
            let id = consumer_id.clone();
            let tx = self.internal_tx.clone();
            handlers.push(consumer.on_producer_close(move || {
                let _ = tx.send(InternalEvent::Remove(id));
            }));
        }

        let raw = serde_json::to_string(&meta).unwrap_or_default();
        let mirror_write = self
            .store
            .pipeline(vec![
                PipelineOp::SetWithTtl {
                    key: keys::consumer(&consumer_id),
                    value: raw,
                    ttl: keys::STATE_TTL,
                },
                PipelineOp::SetAdd {
                    key: keys::socket_consumers(socket_id),
                    member: consumer_id.clone(),
                },
            ])
            .await;
        if let Err(e) = mirror_write {
            warn!(%consumer_id, %e, "consumer mirror write failed");
        }

        self.consumers.insert(
            consumer_id.clone(),
            ConsumerEntry {
                _consumer: consumer,
                meta: meta.clone(),
                _handlers: handlers,
            },
        );
        self.update_gauge();
        debug!(%consumer_id, %socket_id, producer_id = %meta.producer_id, "consumer added");
        meta
    }

    pub async fn remove(&self, consumer_id: &str) -> Option<ConsumerMeta> {
        let (_, entry) = self.consumers.remove(consumer_id)?;
        let meta = entry.meta.clone();
        drop(entry);
        self.update_gauge();

        let result = self
            .store
            .pipeline(vec![
                PipelineOp::Delete {
                    key: keys::consumer(consumer_id),
                },
                PipelineOp::SetRemove {
                    key: keys::socket_consumers(&meta.socket_id),
                    member: consumer_id.to_string(),
                },
            ])
            .await;
        if let Err(e) = result {
            warn!(%consumer_id, %e, "consumer mirror cleanup failed");
        }
        debug!(%consumer_id, "consumer removed");
        Some(meta)
    }

    pub async fn close_all(&self, socket_id: &str) -> usize {
        let mut ids: HashSet<String> = self
            .consumers
            .iter()
            .filter(|e| e.meta.socket_id == socket_id)
            .map(|e| e.key().clone())
            .collect();

        match self
            .store
            .set_members(&keys::socket_consumers(socket_id))
            .await
        {
            Ok(mirrored) => ids.extend(mirrored),
            Err(e) => warn!(%socket_id, %e, "consumer mirror index unavailable"),
        }

        let mut closed = 0;
        let mut ops = Vec::new();
        for consumer_id in &ids {
            if self.consumers.remove(consumer_id).is_some() {
                closed += 1;
            }
            ops.push(PipelineOp::Delete {
                key: keys::consumer(consumer_id),
            });
        }
        ops.push(PipelineOp::Delete {
            key: keys::socket_consumers(socket_id),
        });
        if let Err(e) = self.store.pipeline(ops).await {
            warn!(%socket_id, %e, "consumer mirror cleanup failed");
        }

        self.update_gauge();
        debug!(%socket_id, closed, "all consumers closed for socket");
        closed
    }

    pub fn count(&self) -> usize {
        self.consumers.len()
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.consumers.set(self.consumers.len() as i64);
        }
    }
}
