//! Cache keys and claim outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hex-encoded blake3 digest of a procedure's name and module source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one cached analysis: the procedure, the version of its
/// source, and the version of the analyzer that produced the record.
///
/// A change to either the source or the contract database yields a new key,
/// so stale records are never returned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub procedure: String,
    pub content_hash: ContentHash,
    pub simulation_version: String,
}

impl CacheKey {
    pub fn new(
        procedure: impl Into<String>,
        content_hash: ContentHash,
        simulation_version: impl Into<String>,
    ) -> Self {
        CacheKey {
            procedure: procedure.into(),
            content_hash,
            simulation_version: simulation_version.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.content_hash.as_str().get(..12).unwrap_or(self.content_hash.as_str());
        write!(f, "{}@{}[{}]", self.procedure, short, self.simulation_version)
    }
}

/// Result of trying to claim a key for computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the computation and must `release` when done.
    Claimed,
    /// Another caller is computing this key right now.
    InFlight,
}
