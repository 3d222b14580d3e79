//! Deterministic content hashing using blake3.
//!
//! The procedure name is length-prefixed so that moving text between name
//! and source cannot produce the same digest.

use labtrace_core::AnalysisRecord;

use crate::error::StorageError;
use crate::types::ContentHash;

/// Hash of a procedure version: its name plus the full module source.
pub fn content_hash(procedure: &str, source: &str) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(procedure.len() as u64).to_le_bytes());
    hasher.update(procedure.as_bytes());
    hasher.update(source.as_bytes());
    ContentHash(hasher.finalize().to_hex().to_string())
}

/// Digest of a record's canonical JSON. Equal records give equal digests
/// because every collection in the record is ordered.
pub fn record_digest(record: &AnalysisRecord) -> Result<ContentHash, StorageError> {
    let bytes = serde_json::to_vec(record)?;
    Ok(ContentHash(blake3::hash(&bytes).to_hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        let a = content_hash("protocol", "def protocol(): pass\n");
        let b = content_hash("protocol", "def protocol(): pass\n");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn content_hash_changes_with_source_or_name() {
        let base = content_hash("protocol", "x = 1\n");
        assert_ne!(base, content_hash("protocol", "x = 2\n"));
        assert_ne!(base, content_hash("other", "x = 1\n"));
    }

    #[test]
    fn name_and_source_boundary_matters() {
        assert_ne!(content_hash("ab", "c"), content_hash("a", "bc"));
    }
}
