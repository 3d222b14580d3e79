//! Integration tests for the in-memory analysis cache.
//!
//! Covers key/record agreement on `put`, version separation, procedure
//! invalidation, claim/release markers, and concurrent access from several
//! threads sharing one cache.

use std::sync::Arc;
use std::thread;

use labtrace_core::{AnalysisOutcome, AnalysisRecord, ProtocolComputationGraph};
use labtrace_storage::{
    content_hash, record_digest, AnalysisCache, CacheKey, Claim, InMemoryCache, StorageError,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn key_for(procedure: &str, source: &str, version: &str) -> CacheKey {
    CacheKey::new(procedure, content_hash(procedure, source), version)
}

fn record_for(key: &CacheKey) -> AnalysisRecord {
    AnalysisRecord {
        procedure: key.procedure.clone(),
        content_hash: key.content_hash.to_string(),
        simulation_version: key.simulation_version.clone(),
        outcome: AnalysisOutcome::Analyzable { failure_conditions: 0, verified_level: None },
        computation_graph: ProtocolComputationGraph::new(key.procedure.clone()),
        inferred_requirements: Vec::new(),
        machine_requirements: Vec::new(),
        failure_modes: Vec::new(),
        violations: Vec::new(),
        warnings: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Basic behaviour
// ---------------------------------------------------------------------------

#[test]
fn put_then_get_returns_record() {
    let cache = InMemoryCache::new();
    let key = key_for("protocol", "def protocol(): pass\n", "sim-1");
    assert!(cache.get(&key).unwrap().is_none());

    let record = record_for(&key);
    cache.put(&key, record.clone()).unwrap();
    assert_eq!(cache.get(&key).unwrap(), Some(record));
    assert_eq!(cache.len(), 1);
}

#[test]
fn put_rejects_mismatched_record() {
    let cache = InMemoryCache::new();
    let key = key_for("protocol", "a = 1\n", "sim-1");
    let other = key_for("protocol", "a = 2\n", "sim-1");

    let err = cache.put(&key, record_for(&other)).unwrap_err();
    assert!(matches!(err, StorageError::KeyMismatch { .. }));
    assert!(cache.is_empty());
}

#[test]
fn source_change_misses() {
    let cache = InMemoryCache::new();
    let v1 = key_for("protocol", "a = 1\n", "sim-1");
    cache.put(&v1, record_for(&v1)).unwrap();

    let v2 = key_for("protocol", "a = 2\n", "sim-1");
    assert!(cache.get(&v2).unwrap().is_none());
}

#[test]
fn analyzer_version_is_part_of_key() {
    let cache = InMemoryCache::new();
    let old = key_for("protocol", "a = 1\n", "sim-1");
    cache.put(&old, record_for(&old)).unwrap();

    let new = key_for("protocol", "a = 1\n", "sim-2");
    assert!(cache.get(&new).unwrap().is_none());
}

#[test]
fn last_writer_wins() {
    let cache = InMemoryCache::new();
    let key = key_for("protocol", "a = 1\n", "sim-1");
    cache.put(&key, record_for(&key)).unwrap();

    let mut second = record_for(&key);
    second.outcome = AnalysisOutcome::Analyzable { failure_conditions: 3, verified_level: None };
    cache.put(&key, second.clone()).unwrap();

    assert_eq!(cache.get(&key).unwrap(), Some(second));
    assert_eq!(cache.len(), 1);
}

#[test]
fn invalidate_procedure_removes_all_versions() {
    let cache = InMemoryCache::new();
    for src in ["a = 1\n", "a = 2\n", "a = 3\n"] {
        let key = key_for("protocol", src, "sim-1");
        cache.put(&key, record_for(&key)).unwrap();
    }
    let keep = key_for("other", "a = 1\n", "sim-1");
    cache.put(&keep, record_for(&keep)).unwrap();

    assert_eq!(cache.invalidate_procedure("protocol"), 3);
    assert_eq!(cache.keys(), vec![keep]);
    assert_eq!(cache.invalidate_procedure("protocol"), 0);
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[test]
fn second_claim_sees_in_flight() {
    let cache = InMemoryCache::new();
    let key = key_for("protocol", "a = 1\n", "sim-1");

    assert_eq!(cache.claim(&key), Claim::Claimed);
    assert_eq!(cache.claim(&key), Claim::InFlight);
    assert!(cache.is_in_flight(&key));

    cache.release(&key).unwrap();
    assert!(!cache.is_in_flight(&key));
    assert_eq!(cache.claim(&key), Claim::Claimed);
}

#[test]
fn release_without_claim_fails() {
    let cache = InMemoryCache::new();
    let key = key_for("protocol", "a = 1\n", "sim-1");
    assert!(matches!(cache.release(&key), Err(StorageError::NotClaimed { .. })));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn exactly_one_thread_claims_a_key() {
    let cache = Arc::new(InMemoryCache::new());
    let key = key_for("protocol", "a = 1\n", "sim-1");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            thread::spawn(move || cache.claim(&key))
        })
        .collect();
    let claims: Vec<Claim> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(claims.iter().filter(|c| **c == Claim::Claimed).count(), 1);
    assert_eq!(claims.iter().filter(|c| **c == Claim::InFlight).count(), 7);
}

#[test]
fn concurrent_puts_of_distinct_procedures() {
    let cache = Arc::new(InMemoryCache::new());

    thread::scope(|s| {
        for i in 0..16 {
            let cache = Arc::clone(&cache);
            s.spawn(move || {
                let key = key_for(&format!("proc_{i}"), "a = 1\n", "sim-1");
                cache.put(&key, record_for(&key)).unwrap();
            });
        }
    });

    assert_eq!(cache.len(), 16);
}

#[test]
fn record_digest_tracks_content() {
    let key = key_for("protocol", "a = 1\n", "sim-1");
    let a = record_for(&key);
    let b = record_for(&key);
    assert_eq!(record_digest(&a).unwrap(), record_digest(&b).unwrap());

    let mut c = record_for(&key);
    c.outcome = AnalysisOutcome::Analyzable { failure_conditions: 1, verified_level: None };
    assert_ne!(record_digest(&a).unwrap(), record_digest(&c).unwrap());
}
