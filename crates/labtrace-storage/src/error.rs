//! Storage error types for labtrace-storage.

use thiserror::Error;

use crate::types::CacheKey;

/// Errors produced by cache operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record was stored under a key that does not describe it.
    #[error("record for '{procedure}' ({content_hash}) does not match key {key}")]
    KeyMismatch {
        key: CacheKey,
        procedure: String,
        content_hash: String,
    },

    /// `release` was called for a key nobody claimed.
    #[error("no in-flight claim for {key}")]
    NotClaimed { key: CacheKey },
}
