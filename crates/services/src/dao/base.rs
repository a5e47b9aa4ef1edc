use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use bson::{Document, doc, oid::ObjectId};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DaoError {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("BSON serialization error: {0}")]
    BsonSer(#[from] bson::ser::Error),
    #[error("BSON deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),
    #[error("Entity not found")]
    NotFound,
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Validation: {0}")]
    Validation(String),
    #[error("database call timed out")]
    Timeout,
    #[error("database unavailable (circuit open)")]
    CircuitOpen,
}

pub type DaoResult<T> = Result<T, DaoError>;

impl DaoError {
    /// Connection-level and contention faults retry; application faults
    /// (not-found, duplicate key, validation) never do.
    pub fn is_transient(&self) -> bool {
        match self {
            DaoError::Timeout => true,
            DaoError::Mongo(e) => mongo_transient(e),
            _ => false,
        }
    }
}

fn mongo_transient(e: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    match &*e.kind {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => true,
        // WriteConflict, PrimarySteppedDown, ShutdownInProgress
        ErrorKind::Command(c) => matches!(c.code, 112 | 189 | 91),
        _ => false,
    }
}

/// breaker → retry → per-operation timeout, in that order, around every
/// database call.
pub struct DbGuard {
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    op_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl DbGuard {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Arc<Self> {
        Arc::new(Self {
            breaker: CircuitBreaker::new(
                "database",
                BreakerConfig {
                    call_timeout: Duration::from_secs(10),
                    ..BreakerConfig::default()
                },
            ),
            policy: RetryPolicy::default(),
            op_timeout: Duration::from_secs(10),
            metrics,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> DaoResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DaoResult<T>>,
    {
        if !self.breaker.try_acquire() {
            return Err(DaoError::CircuitOpen);
        }

        let started = Instant::now();
        let result = self
            .policy
            .run(DaoError::is_transient, || async {
                match tokio::time::timeout(self.op_timeout, f()).await {
                    Ok(res) => res,
                    Err(_) => Err(DaoError::Timeout),
                }
            })
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.db_latency.observe(started.elapsed().as_secs_f64());
        }

        match &result {
            Ok(_) => self.breaker.on_success(),
            Err(e) if e.is_transient() => self.breaker.on_failure(),
            // The service answered; an application-level error is not an
            // outage signal.
            Err(_) => self.breaker.on_success(),
        }

        if let Err(e) = &result {
            debug!(op, %e, "database operation failed");
        }
        result
    }
}

pub struct BaseDao<T: Send + Sync> {
    collection: Collection<T>,
    guard: Arc<DbGuard>,
}

impl<T> BaseDao<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Unpin + Send + Sync,
{
    pub fn new(db: &Database, collection_name: &str, guard: Arc<DbGuard>) -> Self {
        Self {
            collection: db.collection::<T>(collection_name),
            guard,
        }
    }

    pub fn collection(&self) -> &Collection<T> {
        &self.collection
    }

    pub fn guard(&self) -> &Arc<DbGuard> {
        &self.guard
    }

    pub async fn find_by_id(&self, id: ObjectId) -> DaoResult<T> {
        let collection = self.collection.clone();
        self.guard
            .run("find_by_id", move || {
                let collection = collection.clone();
                async move {
                    collection
                        .find_one(doc! { "_id": id })
                        .await?
                        .ok_or(DaoError::NotFound)
                }
            })
            .await
    }

    pub async fn find_one(&self, filter: Document) -> DaoResult<Option<T>> {
        let collection = self.collection.clone();
        self.guard
            .run("find_one", move || {
                let collection = collection.clone();
                let filter = filter.clone();
                async move { Ok(collection.find_one(filter).await?) }
            })
            .await
    }

    pub async fn find_many(
        &self,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> DaoResult<Vec<T>> {
        let collection = self.collection.clone();
        self.guard
            .run("find_many", move || {
                let collection = collection.clone();
                let filter = filter.clone();
                let sort = sort.clone();
                async move {
                    let mut find = collection.find(filter);
                    if let Some(sort) = sort {
                        find = find.sort(sort);
                    }
                    if let Some(limit) = limit {
                        find = find.limit(limit);
                    }
                    let mut cursor = find.await?;

                    let mut results = Vec::new();
                    use futures::TryStreamExt;
                    while let Some(item) = cursor.try_next().await? {
                        results.push(item);
                    }
                    Ok(results)
                }
            })
            .await
    }

    pub async fn insert_one(&self, document: &T) -> DaoResult<ObjectId> {
        let collection = self.collection.clone();
        self.guard
            .run("insert_one", move || {
                let collection = collection.clone();
                async move {
                    let result = collection.insert_one(document).await.map_err(|e| {
                        if let mongodb::error::ErrorKind::Write(
                            mongodb::error::WriteFailure::WriteError(ref write_error),
                        ) = *e.kind
                        {
                            if write_error.code == 11000 {
                                return DaoError::DuplicateKey(write_error.message.clone());
                            }
                        }
                        DaoError::Mongo(e)
                    })?;

                    result.inserted_id.as_object_id().ok_or_else(|| {
                        DaoError::Validation("inserted_id is not an ObjectId".into())
                    })
                }
            })
            .await
    }

    pub async fn update_one(&self, filter: Document, update: Document) -> DaoResult<bool> {
        let mut update = update;
        if let Ok(set_doc) = update.get_document_mut("$set") {
            set_doc.insert("updated_at", bson::DateTime::now());
        }
        let collection = self.collection.clone();
        self.guard
            .run("update_one", move || {
                let collection = collection.clone();
                let filter = filter.clone();
                let update = update.clone();
                async move {
                    let result = collection.update_one(filter, update).await?;
                    Ok(result.modified_count > 0)
                }
            })
            .await
    }

    pub async fn update_by_id(&self, id: ObjectId, update: Document) -> DaoResult<bool> {
        self.update_one(doc! { "_id": id }, update).await
    }

    pub async fn count(&self, filter: Document) -> DaoResult<u64> {
        let collection = self.collection.clone();
        self.guard
            .run("count", move || {
                let collection = collection.clone();
                let filter = filter.clone();
                async move { Ok(collection.count_documents(filter).await?) }
            })
            .await
    }
}
