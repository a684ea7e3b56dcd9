//! Splits an incoming byte stream into fixed-size, hashed segments.
//!
//! Every segment is exactly `segment_size` bytes except the last, which may be
//! shorter but is never empty. An empty input yields no segments.
//! The reader is consumed once; re-splitting needs a fresh reader.

use crate::services::integrity::compute_hash;
use bytes::Bytes;
use std::{io, num::NonZeroUsize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// One segment as produced by the segmenter, before it is uploaded.
#[derive(Debug, Clone)]
pub struct SegmentData {
    pub data: Bytes,
    pub order_index: i64,
    pub hash: String,
    pub size: i64,
}

/// Pull-based segmenter over an `AsyncRead`.
pub struct Segmenter<R> {
    reader: R,
    segment_size: usize,
    next_index: i64,
    total_size: u64,
    exhausted: bool,
}

impl<R> Segmenter<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, segment_size: NonZeroUsize) -> Self {
        Self {
            reader,
            segment_size: segment_size.get(),
            next_index: 0,
            total_size: 0,
            exhausted: false,
        }
    }

    /// Bytes consumed so far.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Read the next segment, or `None` once the reader is exhausted.
    ///
    /// Short reads from the underlying stream are accumulated until a full
    /// segment is available or EOF is reached.
    pub async fn next_segment(&mut self) -> io::Result<Option<SegmentData>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.segment_size];
        let mut filled = 0;
        while filled < self.segment_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let segment = SegmentData {
            hash: compute_hash(&buf),
            order_index: self.next_index,
            size: filled as i64,
            data: Bytes::from(buf),
        };
        self.next_index += 1;
        self.total_size += filled as u64;
        Ok(Some(segment))
    }
}

/// Split `reader` to exhaustion. Returns the ordered segments and the total size.
///
/// On error nothing is returned; segments read before the failure are dropped.
pub async fn split<R>(reader: R, segment_size: NonZeroUsize) -> io::Result<(Vec<SegmentData>, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut segmenter = Segmenter::new(reader, segment_size);
    let mut segments = Vec::new();
    while let Some(segment) = segmenter.next_segment().await? {
        segments.push(segment);
    }
    Ok((segments, segmenter.total_size()))
}
