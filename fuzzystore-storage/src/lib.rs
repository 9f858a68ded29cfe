//! # fuzzystore-storage
//!
//! Storage layer for fuzzystore.
//!
//! This crate provides:
//! - The `FuzzyBackend` contract the matching engine and update queue rely on
//! - An in-memory backend with a shingle index and strong/weak expiry
//! - Checksummed JSON snapshots for persisting the in-memory backend

pub mod backend;
pub mod error;
pub mod memory;
pub mod snapshot;

pub use backend::{FuzzyBackend, ShingleVote, StoredEntry, UpdateSummary, WriteRequest};
pub use error::StorageError;
pub use memory::{MemoryBackend, MemoryConfig};
pub use snapshot::{Snapshot, SnapshotEntry};
