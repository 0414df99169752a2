//! Durable memory store — records, paths, side-indices, and lifecycle.
//!
//! The store exclusively owns the `memories` and `paths` tables. Content
//! updates never destroy data on the write path: the old version is marked
//! deprecated and linked forward through `migrated_to`, so the Snapshot
//! Ledger can restore it byte-for-byte.

pub mod index;
pub mod memory;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::PalaceConfig;

/// Store façade over the single embedded connection. Readers and writers lock
/// the connection for the duration of one call; cross-call write ordering is
/// the Write Lane's job.
pub struct Store {
    conn: Mutex<Connection>,
    pub config: Arc<PalaceConfig>,
}

impl Store {
    pub fn new(conn: Connection, config: Arc<PalaceConfig>) -> Self {
        Self {
            conn: Mutex::new(conn),
            config,
        }
    }

    /// Exclusive handle to the underlying connection. Hold it only for the
    /// duration of one statement batch.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }

    pub fn now_iso() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

/// sha256 hex digest of memory content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert a cosine similarity threshold to an L2 distance threshold.
///
/// sqlite-vec defaults to L2 distance. For L2-normalized vectors:
///   L2_dist = sqrt(2 * (1 - cosine_similarity))
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).sqrt()
}

/// Inverse of [`cosine_threshold_to_l2`] for normalized vectors.
pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[test]
    fn cosine_l2_round_trip() {
        for cos in [0.0, 0.5, 0.78, 0.92, 1.0] {
            let d = cosine_threshold_to_l2(cos);
            assert!((l2_to_cosine(d) - cos).abs() < 1e-9);
        }
    }
}
