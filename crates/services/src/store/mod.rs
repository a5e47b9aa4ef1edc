pub mod backend;
pub mod keys;
pub mod memory;
pub mod mirror;

use crate::breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use crate::metrics::Metrics;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

pub use backend::{RedisBackend, StoreBackend};
pub use memory::MemoryBackend;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The breaker is OPEN; callers on non-critical paths downgrade.
    #[error("shared store unavailable (circuit open)")]
    CircuitOpen,
    #[error("shared store call timed out")]
    Timeout,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

/// One step of an atomic multi-command write.
#[derive(Debug, Clone)]
pub enum PipelineOp {
    SetWithTtl {
        key: String,
        value: String,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Typed access to the shared key-value / pub-sub store, wrapped in the
/// circuit breaker. All cross-node coordination goes through here.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn StoreBackend>,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<Metrics>>,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn StoreBackend>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            backend,
            breaker: Arc::new(CircuitBreaker::new("shared-store", BreakerConfig::default())),
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let result = self.breaker.call(fut).await;
        if let Some(metrics) = &self.metrics {
            metrics
                .store_latency
                .observe(started.elapsed().as_secs_f64());
        }
        match result {
            Ok(value) => Ok(value),
            Err(BreakerError::Open) => Err(StoreError::CircuitOpen),
            Err(BreakerError::Timeout(_)) => Err(StoreError::Timeout),
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.guarded(self.backend.get(key)).await
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.guarded(self.backend.set_with_ttl(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.delete(key)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.guarded(self.backend.exists(key)).await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.guarded(self.backend.ping()).await
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.set_add(key, member)).await
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.set_remove(key, member)).await
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.guarded(self.backend.set_members(key)).await
    }

    pub async fn set_cardinality(&self, key: &str) -> Result<u64, StoreError> {
        self.guarded(self.backend.set_cardinality(key)).await
    }

    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.guarded(self.backend.scan_keys(pattern)).await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.publish(channel, payload)).await
    }

    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        self.guarded(self.backend.subscribe(channel)).await
    }

    pub async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), StoreError> {
        self.guarded(self.backend.pipeline(ops)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set_with_ttl(key, &raw, ttl).await
    }
}
