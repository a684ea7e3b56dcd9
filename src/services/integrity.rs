//! Segment content hashing.
//!
//! The write path records `compute_hash` for every segment; the read path and
//! the diagnostic verify endpoint recompute it with `verify`.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `data`.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Recompute the digest of `data` and compare it with `expected_hash`.
pub fn verify(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data) == expected_hash
}
