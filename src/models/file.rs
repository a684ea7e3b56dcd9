//! Represents a file written through the segment pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// File metadata as committed to the metadata store.
///
/// Immutable once written: a re-write of the same name produces a new `File`
/// with a fresh `id`. The content itself lives in the blob store, split into
/// `segment_count` segments whose sizes add up to `size`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct File {
    /// Identifier generated by the write path.
    pub id: Uuid,

    /// Client-supplied name, used for `Content-Disposition` on read.
    pub name: String,

    /// Total size in bytes.
    pub size: i64,

    /// Number of segments persisted for this file.
    pub segment_count: i64,

    /// When the write committed.
    pub created_at: DateTime<Utc>,
}

/// Summary returned to the caller after a successful write.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub file_id: Uuid,
    pub name: String,
    pub size: i64,
    pub segment_count: i64,
}

impl From<&File> for WriteResult {
    fn from(file: &File) -> Self {
        Self {
            file_id: file.id,
            name: file.name.clone(),
            size: file.size,
            segment_count: file.segment_count,
        }
    }
}
