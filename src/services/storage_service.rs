//! src/services/storage_service.rs
//!
//! StorageService wires the segment pipeline to its three collaborators: a
//! blob store holding segment bytes, a durable metadata store holding file and
//! segment records, and a metadata cache in front of file lookups. The write
//! path lives in `write_path.rs`, the read path in `read_path.rs`.

use crate::services::{
    blob_store::BlobStore, instrumentation::Instrumentation, metadata_cache::MetadataCache,
    metadata_store::MetadataStore,
};
use std::{io, num::NonZeroUsize, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error("segment {order_index} (`{blob_key}`) failed integrity check")]
    IntegrityFailure { order_index: i64, blob_key: String },
    #[error("file `{file_id}` has an inconsistent segment plan: expected {expected}, found {actual}")]
    SegmentPlanMismatch {
        file_id: String,
        expected: String,
        actual: String,
    },
    #[error("blob `{0}` not found")]
    BlobNotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidBlobKey(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Map a join or semaphore failure of a fan-out unit.
pub(crate) fn task_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Task(err.to_string())
}

/// Pipeline tunables. Fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Size of every segment but the last.
    pub segment_size: NonZeroUsize,

    /// TTL applied when populating the metadata cache.
    pub cache_ttl: Duration,

    /// Upper bound on concurrent blob transfers per request.
    pub max_inflight: NonZeroUsize,
}

pub const DEFAULT_SEGMENT_SIZE: NonZeroUsize = NonZeroUsize::new(1024 * 1024).unwrap();
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_INFLIGHT: NonZeroUsize = NonZeroUsize::new(16).unwrap();

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

/// StorageService exposes the two pipeline operations:
/// - `write_stream`: segment, upload, commit metadata, invalidate cache
/// - `read`: cache-aside lookup, bounded concurrent fetch and verify, reassembly
///
/// plus `describe` and `verify` for diagnostics. Collaborators are trait
/// objects so tests can substitute doubles for any of them.
#[derive(Clone)]
pub struct StorageService {
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub cache: Arc<dyn MetadataCache>,
    pub instrumentation: Arc<dyn Instrumentation>,
    pub config: PipelineConfig,
}

const MAX_NAME_LEN: usize = 1024;

impl StorageService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<dyn MetadataCache>,
        instrumentation: Arc<dyn Instrumentation>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            blobs,
            metadata,
            cache,
            instrumentation,
            config,
        }
    }

    /// Validate a client-supplied file name.
    ///
    /// Rejects empty names, names longer than 1024 bytes and names containing
    /// control characters, since the name is echoed back in response headers.
    pub(crate) fn ensure_name_valid(name: &str) -> StorageResult<()> {
        if name.trim().is_empty() {
            return Err(StorageError::InvalidName("name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(StorageError::InvalidName(format!(
                "name exceeds {} bytes",
                MAX_NAME_LEN
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(StorageError::InvalidName(
                "name must not contain control characters".into(),
            ));
        }
        Ok(())
    }
}
