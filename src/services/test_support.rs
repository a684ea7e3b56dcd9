//! Test doubles for the pipeline collaborators.

use crate::{
    models::{file::File, segment::Segment},
    services::{
        blob_store::BlobStore,
        instrumentation::{Instrumentation, PipelineEvent},
        metadata_cache::{InMemoryMetadataCache, MetadataCache},
        metadata_store::{MetadataStore, SqliteMetadataStore, memory_store},
        storage_service::{PipelineConfig, StorageError, StorageResult, StorageService},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

/// In-memory blob store with per-key delays and injected faults.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Mutex<Option<Duration>>,
    failing_gets: Mutex<HashSet<String>>,
    failing_put_suffixes: Mutex<Vec<String>>,
    puts: AtomicUsize,
    gets: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Overwrite a blob behind the pipeline's back.
    pub fn overwrite(&self, key: &str, data: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
    }

    pub fn remove(&self, key: &str) {
        self.blobs.lock().unwrap().remove(key);
    }

    pub fn set_delay(&self, key: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
    }

    /// Delay for every key without its own `set_delay`.
    pub fn set_default_delay(&self, delay: Duration) {
        *self.default_delay.lock().unwrap() = Some(delay);
    }

    /// Fail puts for any key ending in `suffix`, e.g. `"/2"` for every index 2.
    pub fn fail_puts_ending_with(&self, suffix: &str) {
        self.failing_put_suffixes
            .lock()
            .unwrap()
            .push(suffix.to_string());
    }

    pub fn fail_get(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, key: &str) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .or(*self.default_delay.lock().unwrap());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn injected(key: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        format!("injected failure for {}", key),
    ))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.enter(key).await;
        let failing = self
            .failing_put_suffixes
            .lock()
            .unwrap()
            .iter()
            .any(|suffix| key.ends_with(suffix.as_str()));
        let result = if failing {
            Err(injected(key))
        } else {
            self.blobs.lock().unwrap().insert(key.to_string(), data);
            Ok(())
        };
        self.leave();
        result
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.enter(key).await;
        let failing = self.failing_gets.lock().unwrap().contains(key);
        let result = if failing {
            Err(injected(key))
        } else {
            self.blobs
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::BlobNotFound(key.to_string()))
        };
        self.leave();
        result
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}

/// SQLite metadata store that counts file lookups and can refuse commits.
pub struct CountingMetadataStore {
    pub inner: SqliteMetadataStore,
    get_file_calls: AtomicUsize,
    fail_commit: AtomicBool,
}

impl CountingMetadataStore {
    pub async fn new() -> Self {
        Self {
            inner: memory_store().await,
            get_file_calls: AtomicUsize::new(0),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn get_file_calls(&self) -> usize {
        self.get_file_calls.load(Ordering::SeqCst)
    }

    pub fn fail_commits(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for CountingMetadataStore {
    async fn create_file(&self, file: &File) -> StorageResult<()> {
        self.inner.create_file(file).await
    }

    async fn create_segment(&self, segment: &Segment) -> StorageResult<()> {
        self.inner.create_segment(segment).await
    }

    async fn get_file(&self, file_id: Uuid) -> StorageResult<Option<File>> {
        self.get_file_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_file(file_id).await
    }

    async fn get_segments(&self, file_id: Uuid) -> StorageResult<Vec<Segment>> {
        self.inner.get_segments(file_id).await
    }

    async fn commit_file(&self, file: &File, segments: &[Segment]) -> StorageResult<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StorageError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        self.inner.commit_file(file, segments).await
    }
}

/// Cache whose every call fails.
pub struct BrokenCache;

#[async_trait]
impl MetadataCache for BrokenCache {
    async fn get(&self, _file_id: Uuid) -> StorageResult<Option<File>> {
        Err(StorageError::Cache("connection refused".into()))
    }

    async fn set(&self, _file: &File, _ttl: Duration) -> StorageResult<()> {
        Err(StorageError::Cache("connection refused".into()))
    }

    async fn delete(&self, _file_id: Uuid) -> StorageResult<()> {
        Err(StorageError::Cache("connection refused".into()))
    }
}

#[derive(Default)]
pub struct RecordingInstrumentation {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingInstrumentation {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Instrumentation for RecordingInstrumentation {
    fn record(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A service wired to test doubles, with handles on each double.
pub struct Harness {
    pub service: StorageService,
    pub blobs: Arc<MemoryBlobStore>,
    pub metadata: Arc<CountingMetadataStore>,
    pub cache: Arc<InMemoryMetadataCache>,
    pub events: Arc<RecordingInstrumentation>,
}

impl Harness {
    pub async fn new(segment_size: usize, max_inflight: usize) -> Self {
        let blobs = Arc::new(MemoryBlobStore::default());
        let metadata = Arc::new(CountingMetadataStore::new().await);
        let cache = Arc::new(InMemoryMetadataCache::new(NonZeroUsize::new(64).unwrap()));
        let events = Arc::new(RecordingInstrumentation::default());
        let config = PipelineConfig {
            segment_size: NonZeroUsize::new(segment_size).unwrap(),
            cache_ttl: Duration::from_secs(60),
            max_inflight: NonZeroUsize::new(max_inflight).unwrap(),
        };
        let service = StorageService::new(
            blobs.clone(),
            metadata.clone(),
            cache.clone(),
            events.clone(),
            config,
        );
        Self {
            service,
            blobs,
            metadata,
            cache,
            events,
        }
    }

    /// Same doubles, but with a cache that always fails.
    pub fn with_broken_cache(mut self) -> Self {
        self.service.cache = Arc::new(BrokenCache);
        self
    }
}

/// Deterministic non-repeating-ish test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7) % 256) as u8).collect()
}
