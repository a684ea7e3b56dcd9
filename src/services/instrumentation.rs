//! Instrumentation sink for pipeline step markers.
//!
//! The service holds an `Arc<dyn Instrumentation>`; nothing in the pipeline
//! reaches for a global tracer. Swapping in `NoopInstrumentation` does not
//! change functional behavior.

use uuid::Uuid;

/// Step markers emitted by the write and read paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    WriteStarted { file_id: Uuid },
    Segmented { file_id: Uuid, segment_count: usize, size: u64 },
    SegmentUploaded { file_id: Uuid, order_index: i64 },
    MetadataCommitted { file_id: Uuid },
    CacheInvalidated { file_id: Uuid },
    CacheLookup { file_id: Uuid, hit: bool },
    SegmentFetched { file_id: Uuid, order_index: i64, size: usize },
    SegmentRejected { file_id: Uuid, order_index: i64 },
    Reassembled { file_id: Uuid, size: usize },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WriteStarted { .. } => "write_started",
            Self::Segmented { .. } => "segmented",
            Self::SegmentUploaded { .. } => "segment_uploaded",
            Self::MetadataCommitted { .. } => "metadata_committed",
            Self::CacheInvalidated { .. } => "cache_invalidated",
            Self::CacheLookup { .. } => "cache_lookup",
            Self::SegmentFetched { .. } => "segment_fetched",
            Self::SegmentRejected { .. } => "segment_rejected",
            Self::Reassembled { .. } => "reassembled",
        }
    }
}

/// Receives pipeline events. Implementations must not block.
pub trait Instrumentation: Send + Sync {
    fn record(&self, event: PipelineEvent);
}

/// Forwards events to the `tracing` subscriber at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInstrumentation;

impl Instrumentation for TracingInstrumentation {
    fn record(&self, event: PipelineEvent) {
        tracing::debug!(event = event.name(), details = ?event, "pipeline event");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {
    fn record(&self, _event: PipelineEvent) {}
}
