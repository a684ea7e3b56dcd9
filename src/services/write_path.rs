//! Write path: segment -> upload -> commit metadata -> invalidate cache.
//!
//! Segmentation runs to completion before the first upload, so a failing input
//! stream leaves nothing behind. Once uploads start, any failure deletes every
//! blob key this attempt could have written before the error is returned.

use crate::{
    models::{
        file::{File, WriteResult},
        segment::Segment,
    },
    services::{
        instrumentation::PipelineEvent,
        segmenter::{self, SegmentData},
        storage_service::{StorageError, StorageResult, StorageService, task_error},
    },
};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::{io::AsyncRead, sync::Semaphore, task::JoinSet};
use tracing::{Span, field, info, instrument, warn};
use uuid::Uuid;

impl StorageService {
    /// Store the content of `reader` as a new file named `name`.
    #[instrument(skip(self, reader), fields(file_id = field::Empty))]
    pub async fn write_stream<R>(&self, name: &str, reader: R) -> StorageResult<WriteResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        Self::ensure_name_valid(name)?;

        let file_id = Uuid::new_v4();
        Span::current().record("file_id", field::display(file_id));
        self.instrumentation
            .record(PipelineEvent::WriteStarted { file_id });

        let (segments, total_size) = segmenter::split(reader, self.config.segment_size).await?;
        self.instrumentation.record(PipelineEvent::Segmented {
            file_id,
            segment_count: segments.len(),
            size: total_size,
        });
        info!(
            "segmented {} into {} segments ({} bytes)",
            name,
            segments.len(),
            total_size
        );

        let records = self.upload_segments(file_id, segments).await?;

        let file = File {
            id: file_id,
            name: name.to_string(),
            size: total_size as i64,
            segment_count: records.len() as i64,
            created_at: Utc::now(),
        };

        if let Err(err) = self.metadata.commit_file(&file, &records).await {
            warn!("metadata commit failed, removing uploaded segments: {}", err);
            self.discard_blobs(records.into_iter().map(|s| s.blob_key))
                .await;
            return Err(err);
        }
        self.instrumentation
            .record(PipelineEvent::MetadataCommitted { file_id });

        match self.cache.delete(file_id).await {
            Ok(()) => self
                .instrumentation
                .record(PipelineEvent::CacheInvalidated { file_id }),
            Err(err) => warn!("failed to invalidate cache entry: {}", err),
        }

        info!("stored {} ({} bytes)", name, file.size);
        Ok(WriteResult::from(&file))
    }

    /// Upload every segment concurrently, bounded by `max_inflight`.
    ///
    /// Returns the segment records in `order_index` order. On the first
    /// failure no further uploads start, the in-flight ones are awaited, and
    /// every key of the attempt is deleted.
    async fn upload_segments(
        &self,
        file_id: Uuid,
        segments: Vec<SegmentData>,
    ) -> StorageResult<Vec<Segment>> {
        let count = segments.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_inflight.get()));
        let mut tasks = JoinSet::new();

        for segment in segments {
            let blobs = self.blobs.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(task_error)?;
                let blob_key = Segment::blob_key_for(file_id, segment.order_index);
                blobs.put(&blob_key, segment.data).await?;
                Ok::<_, StorageError>(Segment {
                    id: Uuid::new_v4(),
                    file_id,
                    order_index: segment.order_index,
                    hash: segment.hash,
                    blob_key,
                    size: segment.size,
                })
            });
        }

        let mut slots: Vec<Option<Segment>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(task_error).and_then(|outcome| outcome) {
                Ok(record) => {
                    self.instrumentation.record(PipelineEvent::SegmentUploaded {
                        file_id,
                        order_index: record.order_index,
                    });
                    let index = record.order_index as usize;
                    slots[index] = Some(record);
                }
                Err(err) => {
                    // queued uploads stop here; puts already running must land
                    // before their keys are discarded
                    semaphore.close();
                    while tasks.join_next().await.is_some() {}
                    warn!("segment upload failed, removing partial upload: {}", err);
                    self.discard_blobs(
                        (0..count as i64).map(|index| Segment::blob_key_for(file_id, index)),
                    )
                    .await;
                    return Err(err);
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Best-effort removal of blobs left behind by a failed write.
    async fn discard_blobs<I>(&self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        let deletions = keys.into_iter().map(|key| async move {
            if let Err(err) = self.blobs.delete(&key).await {
                warn!("failed to remove orphaned blob {}: {}", key, err);
            }
        });
        join_all(deletions).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::services::{
        blob_store::{BlobStore, FsBlobStore},
        instrumentation::{NoopInstrumentation, PipelineEvent},
        metadata_cache::InMemoryMetadataCache,
        metadata_store::{MetadataStore, memory_store},
        storage_service::{PipelineConfig, StorageError, StorageResult, StorageService},
        test_support::{Harness, payload},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::{
        io,
        num::NonZeroUsize,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };
    use tokio_util::io::StreamReader;

    /// Filesystem store whose puts fail, after a short delay, for keys ending
    /// in `suffix`.
    struct FailingSuffixStore {
        inner: FsBlobStore,
        suffix: &'static str,
    }

    #[async_trait]
    impl BlobStore for FailingSuffixStore {
        async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
            if key.ends_with(self.suffix) {
                tokio::time::sleep(Duration::from_millis(5)).await;
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "disk went away",
                )));
            }
            self.inner.put(key, data).await
        }

        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
    }

    fn files_under(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn write_persists_segments_and_metadata() {
        let h = Harness::new(4, 4).await;
        let input = payload(10);

        let result = h.service.write_stream("notes.txt", &input[..]).await.unwrap();
        assert_eq!(result.name, "notes.txt");
        assert_eq!(result.size, 10);
        assert_eq!(result.segment_count, 3);

        let id = result.file_id;
        assert_eq!(
            h.blobs.keys(),
            vec![
                format!("segments/{}/0", id),
                format!("segments/{}/1", id),
                format!("segments/{}/2", id),
            ]
        );

        let file = h.metadata.get_file(id).await.unwrap().unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(file.segment_count, 3);

        let segments = h.metadata.get_segments(id).await.unwrap();
        let sizes: Vec<i64> = segments.iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(sizes.iter().sum::<i64>(), file.size);
    }

    #[tokio::test]
    async fn empty_input_creates_file_without_segments() {
        let h = Harness::new(1024 * 1024, 4).await;
        let result = h.service.write_stream("empty.bin", &b""[..]).await.unwrap();
        assert_eq!(result.size, 0);
        assert_eq!(result.segment_count, 0);
        assert_eq!(h.blobs.put_count(), 0);
        let file = h.metadata.get_file(result.file_id).await.unwrap().unwrap();
        assert_eq!(file.segment_count, 0);
    }

    #[tokio::test]
    async fn single_byte_input_is_one_segment_of_one_byte() {
        let h = Harness::new(1024 * 1024, 4).await;
        let result = h.service.write_stream("one.bin", &[7u8][..]).await.unwrap();
        assert_eq!(result.segment_count, 1);
        assert_eq!(result.size, 1);

        let segments = h.metadata.get_segments(result.file_id).await.unwrap();
        assert_eq!(segments[0].size, 1);
    }

    #[tokio::test]
    async fn empty_name_is_rejected_without_side_effects() {
        let h = Harness::new(4, 4).await;
        let err = h.service.write_stream("", &b"data"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));
        assert_eq!(h.blobs.put_count(), 0);
        assert!(h.events.events().is_empty());
    }

    #[tokio::test]
    async fn stream_failure_aborts_before_any_upload() {
        let h = Harness::new(4, 4).await;
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from(payload(9))),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated body")),
        ];
        let reader = StreamReader::new(stream::iter(chunks));

        let err = h.service.write_stream("broken.bin", reader).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(h.blobs.put_count(), 0);
        assert!(h.blobs.keys().is_empty());
    }

    #[tokio::test]
    async fn upload_failure_removes_already_uploaded_segments() {
        let h = Harness::new(4, 2).await;
        h.blobs.fail_puts_ending_with("/2");

        let err = h
            .service
            .write_stream("fails.bin", &payload(20)[..])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(h.blobs.keys().is_empty(), "orphans left: {:?}", h.blobs.keys());
        assert!(
            !h.events
                .events()
                .iter()
                .any(|e| matches!(e, PipelineEvent::MetadataCommitted { .. }))
        );
    }

    #[tokio::test]
    async fn commit_failure_removes_uploaded_segments() {
        let h = Harness::new(4, 4).await;
        h.metadata.fail_commits();

        let err = h
            .service
            .write_stream("lost.bin", &payload(12)[..])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Sqlx(_)));
        assert_eq!(h.blobs.put_count(), 3);
        assert!(h.blobs.keys().is_empty());
    }

    #[tokio::test]
    async fn write_invalidates_cache_and_emits_step_events() {
        let h = Harness::new(4, 4).await;
        let result = h.service.write_stream("a.bin", &payload(8)[..]).await.unwrap();
        let id = result.file_id;

        let events = h.events.events();
        assert_eq!(events.first(), Some(&PipelineEvent::WriteStarted { file_id: id }));
        assert!(events.contains(&PipelineEvent::MetadataCommitted { file_id: id }));
        assert_eq!(events.last(), Some(&PipelineEvent::CacheInvalidated { file_id: id }));
        let uploads = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::SegmentUploaded { .. }))
            .count();
        assert_eq!(uploads, 2);
    }

    #[tokio::test]
    async fn cache_failure_does_not_fail_the_write() {
        let h = Harness::new(4, 4).await.with_broken_cache();
        let result = h.service.write_stream("a.bin", &payload(5)[..]).await.unwrap();
        assert_eq!(result.segment_count, 2);
        assert!(
            !h.events
                .events()
                .contains(&PipelineEvent::CacheInvalidated { file_id: result.file_id })
        );
    }

    #[tokio::test]
    async fn rewriting_same_name_creates_new_file() {
        let h = Harness::new(4, 4).await;
        let first = h.service.write_stream("dup.txt", &b"one"[..]).await.unwrap();
        let second = h.service.write_stream("dup.txt", &b"two!"[..]).await.unwrap();
        assert_ne!(first.file_id, second.file_id);
        assert_eq!(h.blobs.keys().len(), 2);
    }

    #[tokio::test]
    async fn failed_upload_leaves_nothing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let segment_size = 1024 * 1024;
        let service = StorageService::new(
            Arc::new(FailingSuffixStore {
                inner: FsBlobStore::new(dir.path()),
                suffix: "/7",
            }),
            Arc::new(memory_store().await),
            Arc::new(InMemoryMetadataCache::new(NonZeroUsize::new(4).unwrap())),
            Arc::new(NoopInstrumentation),
            PipelineConfig {
                segment_size: NonZeroUsize::new(segment_size).unwrap(),
                cache_ttl: Duration::from_secs(60),
                max_inflight: NonZeroUsize::new(16).unwrap(),
            },
        );

        let input = payload(8 * segment_size);
        let err = service.write_stream("big.bin", &input[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));

        let leftovers = files_under(dir.path());
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
    }

    #[tokio::test]
    async fn upload_fan_out_respects_inflight_bound() {
        let h = Harness::new(4, 2).await;
        h.blobs.set_default_delay(Duration::from_millis(15));

        let result = h.service.write_stream("slow.bin", &payload(32)[..]).await.unwrap();
        assert_eq!(result.segment_count, 8);
        assert_eq!(h.blobs.put_count(), 8);
        assert!(h.blobs.max_in_flight() <= 2, "saw {}", h.blobs.max_in_flight());
    }
}
