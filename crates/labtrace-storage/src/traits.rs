//! The [`AnalysisCache`] trait: the contract between the analyzer and
//! whatever owns analysis results.
//!
//! The cache is shared across concurrent analyses, so every method takes
//! `&self`. Writes are last-writer-wins. `claim`/`release` let callers
//! avoid computing the same key twice; they are advisory and a caller that
//! sees [`Claim::InFlight`] may still compute.

use labtrace_core::AnalysisRecord;

use crate::error::StorageError;
use crate::types::{CacheKey, Claim};

pub trait AnalysisCache: Send + Sync {
    /// The record stored under `key`, if any.
    fn get(&self, key: &CacheKey) -> Result<Option<AnalysisRecord>, StorageError>;

    /// Stores `record` under `key`, replacing any previous record.
    ///
    /// Fails with [`StorageError::KeyMismatch`] when the record's procedure
    /// or content hash disagrees with the key.
    fn put(&self, key: &CacheKey, record: AnalysisRecord) -> Result<(), StorageError>;

    /// Marks `key` as being computed.
    fn claim(&self, key: &CacheKey) -> Claim;

    /// Drops the in-flight marker for `key`.
    fn release(&self, key: &CacheKey) -> Result<(), StorageError>;

    /// Removes every record of `procedure`, whatever its version. Returns
    /// the number removed.
    fn invalidate_procedure(&self, procedure: &str) -> usize;

    /// Number of stored records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
