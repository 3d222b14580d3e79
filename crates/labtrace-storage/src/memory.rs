//! In-memory implementation of [`AnalysisCache`].
//!
//! [`InMemoryCache`] backs the CLI and tests. Records and in-flight markers
//! live in `DashMap`s so analyses running on different threads can share
//! one cache without an outer lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use labtrace_core::AnalysisRecord;

use crate::error::StorageError;
use crate::traits::AnalysisCache;
use crate::types::{CacheKey, Claim};

#[derive(Debug, Default)]
pub struct InMemoryCache {
    records: DashMap<CacheKey, AnalysisRecord>,
    in_flight: DashMap<CacheKey, ()>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.records.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// True while some caller holds a claim on `key`.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }
}

impl AnalysisCache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<AnalysisRecord>, StorageError> {
        let found = self.records.get(key).map(|r| r.value().clone());
        debug!(key = %key, hit = found.is_some(), "cache lookup");
        Ok(found)
    }

    fn put(&self, key: &CacheKey, record: AnalysisRecord) -> Result<(), StorageError> {
        if record.procedure != key.procedure || record.content_hash != key.content_hash.as_str() {
            return Err(StorageError::KeyMismatch {
                key: key.clone(),
                procedure: record.procedure,
                content_hash: record.content_hash,
            });
        }
        debug!(key = %key, "cache store");
        self.records.insert(key.clone(), record);
        Ok(())
    }

    fn claim(&self, key: &CacheKey) -> Claim {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => Claim::InFlight,
            Entry::Vacant(slot) => {
                slot.insert(());
                Claim::Claimed
            }
        }
    }

    fn release(&self, key: &CacheKey) -> Result<(), StorageError> {
        self.in_flight
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotClaimed { key: key.clone() })
    }

    fn invalidate_procedure(&self, procedure: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|key, _| key.procedure != procedure);
        let removed = before.saturating_sub(self.records.len());
        debug!(procedure, removed, "cache invalidation");
        removed
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
