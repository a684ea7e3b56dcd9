//! Represents a single segment of a file's content.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Segment metadata row.
///
/// For a given `file_id` the `order_index` values form the contiguous range
/// `0..segment_count`. `hash` is the hex SHA-256 of the bytes stored at
/// `blob_key`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Segment {
    pub id: Uuid,

    /// Owning file.
    pub file_id: Uuid,

    /// Zero-based position within the file.
    pub order_index: i64,

    /// Hex-encoded SHA-256 of the segment bytes.
    pub hash: String,

    /// Blob store key, always `segments/{file_id}/{order_index}`.
    pub blob_key: String,

    /// Size in bytes.
    pub size: i64,
}

impl Segment {
    /// Build the blob key for a segment.
    ///
    /// The layout is shared with data already in the blob store and must not change.
    pub fn blob_key_for(file_id: Uuid, order_index: i64) -> String {
        format!("segments/{}/{}", file_id, order_index)
    }
}
