use super::{PipelineOp, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// In-memory [`super::StoreBackend`]. Backs hermetic tests (routing,
/// mirror cleanup, cluster RPC) without a Redis server; expiry is honored
/// lazily on read so paused-clock tests can drive TTLs.
#[derive(Default)]
pub struct MemoryBackend {
    strings: DashMap<String, Expiring<String>>,
    sets: DashMap<String, Expiring<HashSet<String>>>,
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    fail: AtomicBool,
}

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail, simulating a store outage.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StoreError::Backend("injected store failure".into()))
        } else {
            Ok(())
        }
    }

    fn apply(&self, op: &PipelineOp) {
        match op {
            PipelineOp::SetWithTtl { key, value, ttl } => {
                self.strings
                    .insert(key.clone(), Expiring::new(value.clone(), Some(*ttl)));
            }
            PipelineOp::Delete { key } => {
                self.strings.remove(key);
                self.sets.remove(key);
            }
            PipelineOp::SetAdd { key, member } => {
                self.sets
                    .entry(key.clone())
                    .or_insert_with(|| Expiring::new(HashSet::new(), None))
                    .value
                    .insert(member.clone());
            }
            PipelineOp::SetRemove { key, member } => {
                if let Some(mut set) = self.sets.get_mut(key) {
                    set.value.remove(member);
                }
            }
            PipelineOp::Expire { key, ttl } => {
                let at = Some(Instant::now() + *ttl);
                if let Some(mut e) = self.strings.get_mut(key) {
                    e.expires_at = at;
                }
                if let Some(mut e) = self.sets.get_mut(key) {
                    e.expires_at = at;
                }
            }
        }
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // Only '*' wildcards, which is all the key schema needs.
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 && !pattern.ends_with('*') {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    parts.len() > 1 || pattern == key
}

#[async_trait]
impl super::StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        if let Some(entry) = self.strings.get(key) {
            if entry.expired() {
                drop(entry);
                self.strings.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.strings
            .insert(key.to_string(), Expiring::new(value.to_string(), Some(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.strings.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some() || {
            self.check()?;
            self.sets
                .get(key)
                .map(|e| !e.expired() && !e.value.is_empty())
                .unwrap_or(false)
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        self.apply(&PipelineOp::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        self.apply(&PipelineOp::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        if let Some(entry) = self.sets.get(key) {
            if entry.expired() {
                drop(entry);
                self.sets.remove(key);
                return Ok(Vec::new());
            }
            return Ok(entry.value.iter().cloned().collect());
        }
        Ok(Vec::new())
    }

    async fn set_cardinality(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.set_members(key).await?.len() as u64)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let mut keys: Vec<String> = self
            .strings
            .iter()
            .filter(|e| !e.value().expired())
            .map(|e| e.key().clone())
            .chain(
                self.sets
                    .iter()
                    .filter(|e| !e.value().expired())
                    .map(|e| e.key().clone()),
            )
            .filter(|k| glob_match(pattern, k))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut channels = self.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|tx| tx.try_send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        self.check()?;
        let (tx, rx) = mpsc::channel(64);
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), StoreError> {
        self.check()?;
        for op in &ops {
            self.apply(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::StoreBackend;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn string_ttl_expires() {
        let store = MemoryBackend::new();
        store
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_matches_wildcards() {
        let store = MemoryBackend::new();
        store
            .set_with_ttl(
                "connect:routing:server:a:status",
                "{}",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store
            .set_with_ttl(
                "connect:routing:server:b:status",
                "{}",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store
            .set_with_ttl("connect:routing:room:x", "a", Duration::from_secs(60))
            .await
            .unwrap();

        let keys = store
            .scan_keys("connect:routing:server:*:status")
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_propagates() {
        let store = MemoryBackend::new();
        store.set_failing(true);
        assert!(store.ping().await.is_err());
        store.set_failing(false);
        assert!(store.ping().await.is_ok());
    }
}
