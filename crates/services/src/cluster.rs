//! Node-to-node delegation over the shared store's pub-sub. A producer
//! control that lands on the wrong node is forwarded to the owner's channel
//! and applied there. Best-effort: a lost command is recovered by mirror
//! TTL expiry.

use crate::store::{StoreClient, StoreError, keys};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClusterCommand {
    CloseProducer {
        producer_id: String,
        room_id: String,
        user_id: String,
    },
    PauseProducer {
        producer_id: String,
        room_id: String,
        user_id: String,
    },
    ResumeProducer {
        producer_id: String,
        room_id: String,
        user_id: String,
    },
}

pub struct ClusterRpc {
    store: StoreClient,
    instance_id: String,
}

impl ClusterRpc {
    pub fn new(store: StoreClient, instance_id: String) -> Self {
        Self { store, instance_id }
    }

    /// Publishes a command to the owning node's channel.
    pub async fn delegate(
        &self,
        target_server: &str,
        command: &ClusterCommand,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(command)?;
        debug!(target = %target_server, ?command, "delegating producer control");
        self.store
            .publish(&keys::cluster_channel(target_server), &payload)
            .await
    }

    /// Subscribes to this node's own channel; undecodable payloads are
    /// dropped with a warning.
    pub async fn subscribe_own(&self) -> Result<mpsc::Receiver<ClusterCommand>, StoreError> {
        let mut raw = self
            .store
            .subscribe(&keys::cluster_channel(&self.instance_id))
            .await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(payload) = raw.recv().await {
                match serde_json::from_str::<ClusterCommand>(&payload) {
                    Ok(command) => {
                        if tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%e, "undecodable cluster command"),
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn delegated_command_reaches_target_node() {
        let backend = Arc::new(MemoryBackend::new());
        let node_a = ClusterRpc::new(
            StoreClient::new(backend.clone(), None),
            "node-a".to_string(),
        );
        let node_b = ClusterRpc::new(StoreClient::new(backend, None), "node-b".to_string());

        let mut inbox = node_b.subscribe_own().await.unwrap();

        let command = ClusterCommand::CloseProducer {
            producer_id: "p1".into(),
            room_id: "r1".into(),
            user_id: "u1".into(),
        };
        node_a.delegate("node-b", &command).await.unwrap();

        let received = inbox.recv().await.unwrap();
        assert_eq!(received, command);
    }
}
