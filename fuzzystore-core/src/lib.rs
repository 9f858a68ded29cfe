//! # fuzzystore-core
//!
//! Matching engine for fuzzystore.
//!
//! This crate provides:
//! - Exact `(flag, digest)` lookups
//! - Near-duplicate matching by shingle votes with a configurable threshold
//! - The WRITE/DEL/STAT/REFRESH paths against a `FuzzyBackend`

pub mod engine;
pub mod error;

pub use engine::{MatchKind, MatchPolicy, MatchingEngine, Outcome, Query};
pub use error::{CoreError, ErrorKind};

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
