//! Result caching for procedure analyses.
//!
//! Analyses are keyed by procedure name, a blake3 hash of the procedure's
//! module source, and the analyzer version. The [`AnalysisCache`] trait is
//! the contract the analyzer relies on; [`InMemoryCache`] is the concurrent
//! in-process backend.
//!
//! # Modules
//!
//! - [`error`]: StorageError
//! - [`types`]: ContentHash, CacheKey, Claim
//! - [`hash`]: content and record digests
//! - [`traits`]: AnalysisCache trait definition
//! - [`memory`]: InMemoryCache implementation

pub mod error;
pub mod hash;
pub mod memory;
pub mod traits;
pub mod types;

// Re-export key types for ergonomic use.
pub use error::StorageError;
pub use hash::{content_hash, record_digest};
pub use memory::InMemoryCache;
pub use traits::AnalysisCache;
pub use types::{CacheKey, Claim, ContentHash};
