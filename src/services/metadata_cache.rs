//! TTL cache for `File` records, consulted before the metadata store.
//!
//! The cache holds no authority: a miss (or any cache failure) only sends the
//! caller to the durable store. Two implementations:
//! - `InMemoryMetadataCache`: LRU with per-entry expiry, process local
//! - `RedisMetadataCache`: `file:{id}` keys holding JSON, expiry via `SET EX`

use crate::{
    models::file::File,
    services::storage_service::{StorageError, StorageResult},
};
use async_trait::async_trait;
use lru::LruCache;
use redis::{AsyncCommands, aio::ConnectionManager};
use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait MetadataCache: Send + Sync {
    /// `None` on a miss or an expired entry.
    async fn get(&self, file_id: Uuid) -> StorageResult<Option<File>>;

    async fn set(&self, file: &File, ttl: Duration) -> StorageResult<()>;

    async fn delete(&self, file_id: Uuid) -> StorageResult<()>;
}

#[derive(Clone)]
struct CacheEntry {
    file: File,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

pub struct InMemoryMetadataCache {
    entries: RwLock<LruCache<Uuid, CacheEntry>>,
}

impl InMemoryMetadataCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl MetadataCache for InMemoryMetadataCache {
    async fn get(&self, file_id: Uuid) -> StorageResult<Option<File>> {
        // write lock: a hit promotes the entry, an expired one is evicted
        let mut entries = self.entries.write().await;
        let expired = match entries.get(&file_id) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.file.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&file_id);
        }
        Ok(None)
    }

    async fn set(&self, file: &File, ttl: Duration) -> StorageResult<()> {
        let entry = CacheEntry {
            file: file.clone(),
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries.write().await.put(file.id, entry);
        Ok(())
    }

    async fn delete(&self, file_id: Uuid) -> StorageResult<()> {
        self.entries.write().await.pop(&file_id);
        Ok(())
    }
}

/// Redis-backed cache shared between service instances.
#[derive(Clone)]
pub struct RedisMetadataCache {
    conn: ConnectionManager,
}

impl RedisMetadataCache {
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = redis::Client::open(url).map_err(cache_error)?;
        let conn = client.get_connection_manager().await.map_err(cache_error)?;
        Ok(Self { conn })
    }

    fn key(file_id: Uuid) -> String {
        format!("file:{}", file_id)
    }
}

fn cache_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Cache(err.to_string())
}

#[async_trait]
impl MetadataCache for RedisMetadataCache {
    async fn get(&self, file_id: Uuid) -> StorageResult<Option<File>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::key(file_id)).await.map_err(cache_error)?;
        match raw {
            Some(json) => serde_json::from_str(&json).map(Some).map_err(cache_error),
            None => Ok(None),
        }
    }

    async fn set(&self, file: &File, ttl: Duration) -> StorageResult<()> {
        let payload = serde_json::to_string(file).map_err(cache_error)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::key(file.id), payload, ttl.as_secs().max(1))
            .await
            .map_err(cache_error)
    }

    async fn delete(&self, file_id: Uuid) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(file_id))
            .await
            .map_err(cache_error)
    }
}
