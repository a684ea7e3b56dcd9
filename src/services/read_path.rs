//! Read path: cache-aside file lookup, segment plan, concurrent fetch and
//! verify, ordered reassembly.
//!
//! Fetches run on a `JoinSet`, at most `max_inflight` at a time. Each unit
//! returns its `order_index` with its bytes and the coordinator writes the
//! result into that slot, so completion order never affects the output. The
//! first failed unit aborts all of its siblings.

use crate::{
    models::{file::File, segment::Segment},
    services::{
        blob_store::BlobStore,
        instrumentation::{Instrumentation, PipelineEvent},
        integrity,
        storage_service::{StorageError, StorageResult, StorageService, task_error},
    },
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{Instrument, debug, debug_span, info, instrument, warn};
use uuid::Uuid;

/// Result of checking one segment against its recorded hash.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SegmentCheck {
    pub order_index: i64,
    pub blob_key: String,
    pub expected_hash: String,
    pub actual_hash: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
}

/// Per-segment integrity report for a whole file.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub file_id: Uuid,
    pub segment_count: usize,
    pub ok: bool,
    pub segments: Vec<SegmentCheck>,
}

impl StorageService {
    /// Read a file back. Returns its metadata and the reassembled content.
    ///
    /// Either every segment is fetched and verified or the read fails; there
    /// is no partial result.
    #[instrument(skip(self))]
    pub async fn read(&self, file_id: Uuid) -> StorageResult<(File, Bytes)> {
        let file = self.resolve_file(file_id).await?;
        let plan = self.segment_plan(&file).await?;

        info!("fetching {} segments", plan.len());
        let slots = self.fetch_segments(file_id, plan).await?;

        let content = reassemble(slots, file.size as usize);
        self.instrumentation.record(PipelineEvent::Reassembled {
            file_id,
            size: content.len(),
        });
        Ok((file, content))
    }

    /// File metadata only, through the same cache-aside lookup as `read`.
    pub async fn describe(&self, file_id: Uuid) -> StorageResult<File> {
        self.resolve_file(file_id).await
    }

    /// Fetch every segment and report which ones fail their hash check.
    ///
    /// Unlike `read`, a bad segment does not stop the scan.
    #[instrument(skip(self))]
    pub async fn verify_file(&self, file_id: Uuid) -> StorageResult<IntegrityReport> {
        let file = self.resolve_file(file_id).await?;
        let plan = self.segment_plan(&file).await?;
        let segment_count = plan.len();

        let blobs = self.blobs.clone();
        let mut segments: Vec<SegmentCheck> = stream::iter(plan)
            .map(|segment| {
                let blobs = blobs.clone();
                async move { check_segment(blobs.as_ref(), segment).await }
            })
            .buffer_unordered(self.config.max_inflight.get())
            .collect()
            .await;
        segments.sort_by_key(|check| check.order_index);

        let ok = segments.iter().all(|check| check.ok);
        if !ok {
            warn!("integrity scan found corrupt segments");
        }
        Ok(IntegrityReport {
            file_id,
            segment_count,
            ok,
            segments,
        })
    }

    /// Cache first, then the metadata store; a store hit repopulates the cache.
    ///
    /// Cache errors are logged and treated as misses. Concurrent misses for
    /// the same id may both hit the store and both populate the cache; files
    /// are immutable, so either write is correct.
    async fn resolve_file(&self, file_id: Uuid) -> StorageResult<File> {
        match self.cache.get(file_id).await {
            Ok(Some(file)) => {
                debug!("cache hit");
                self.instrumentation
                    .record(PipelineEvent::CacheLookup { file_id, hit: true });
                return Ok(file);
            }
            Ok(None) => debug!("cache miss"),
            Err(err) => warn!("cache lookup failed, falling back to metadata store: {}", err),
        }
        self.instrumentation
            .record(PipelineEvent::CacheLookup { file_id, hit: false });

        let file = self
            .metadata
            .get_file(file_id)
            .await?
            .ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;

        if let Err(err) = self.cache.set(&file, self.config.cache_ttl).await {
            warn!("failed to populate cache: {}", err);
        }
        Ok(file)
    }

    /// Load the ordered segment list and check it against the file record.
    async fn segment_plan(&self, file: &File) -> StorageResult<Vec<Segment>> {
        let plan = self.metadata.get_segments(file.id).await?;
        let mismatch = |expected: String, actual: String| StorageError::SegmentPlanMismatch {
            file_id: file.id.to_string(),
            expected,
            actual,
        };

        if plan.len() as i64 != file.segment_count {
            return Err(mismatch(
                format!("{} segments", file.segment_count),
                format!("{} segments", plan.len()),
            ));
        }
        for (position, segment) in plan.iter().enumerate() {
            if segment.order_index != position as i64 {
                return Err(mismatch(
                    format!("order_index {}", position),
                    format!("order_index {}", segment.order_index),
                ));
            }
        }
        let total: i64 = plan.iter().map(|segment| segment.size).sum();
        if total != file.size {
            return Err(mismatch(
                format!("{} bytes", file.size),
                format!("{} bytes", total),
            ));
        }
        Ok(plan)
    }

    /// Fan out one fetch-and-verify unit per segment and fan the results back
    /// into order-indexed slots.
    async fn fetch_segments(&self, file_id: Uuid, plan: Vec<Segment>) -> StorageResult<Vec<Bytes>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_inflight.get()));
        let mut slots: Vec<Option<Bytes>> = vec![None; plan.len()];
        let mut tasks = JoinSet::new();

        for segment in plan {
            let span = debug_span!("fetch_segment", order_index = segment.order_index);
            tasks.spawn(
                fetch_and_verify(
                    self.blobs.clone(),
                    semaphore.clone(),
                    self.instrumentation.clone(),
                    file_id,
                    segment,
                )
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(task_error).and_then(|outcome| outcome) {
                Ok((order_index, data)) => slots[order_index] = Some(data),
                Err(err) => {
                    tasks.abort_all();
                    warn!("segment fetch failed, cancelling remaining fetches: {}", err);
                    return Err(err);
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| task_error(format!("segment {} produced no result", index)))
            })
            .collect()
    }
}

async fn fetch_and_verify(
    blobs: Arc<dyn BlobStore>,
    semaphore: Arc<Semaphore>,
    instrumentation: Arc<dyn Instrumentation>,
    file_id: Uuid,
    segment: Segment,
) -> StorageResult<(usize, Bytes)> {
    let _permit = semaphore.acquire_owned().await.map_err(task_error)?;
    let data = blobs.get(&segment.blob_key).await?;

    if !integrity::verify(&data, &segment.hash) {
        instrumentation.record(PipelineEvent::SegmentRejected {
            file_id,
            order_index: segment.order_index,
        });
        return Err(StorageError::IntegrityFailure {
            order_index: segment.order_index,
            blob_key: segment.blob_key,
        });
    }

    instrumentation.record(PipelineEvent::SegmentFetched {
        file_id,
        order_index: segment.order_index,
        size: data.len(),
    });
    Ok((segment.order_index as usize, data))
}

async fn check_segment(blobs: &dyn BlobStore, segment: Segment) -> SegmentCheck {
    let (actual_hash, error) = match blobs.get(&segment.blob_key).await {
        Ok(data) => (Some(integrity::compute_hash(&data)), None),
        Err(err) => (None, Some(err.to_string())),
    };
    SegmentCheck {
        ok: actual_hash.as_deref() == Some(segment.hash.as_str()),
        order_index: segment.order_index,
        blob_key: segment.blob_key,
        expected_hash: segment.hash,
        actual_hash,
        error,
    }
}

/// Concatenate slots in index order.
fn reassemble(slots: Vec<Bytes>, size_hint: usize) -> Bytes {
    if slots.len() == 1 {
        return slots.into_iter().next().unwrap_or_default();
    }
    let mut content = BytesMut::with_capacity(size_hint);
    for slot in slots {
        content.extend_from_slice(&slot);
    }
    content.freeze()
}
