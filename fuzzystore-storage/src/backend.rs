//! The storage contract.

use crate::error::StorageError;
use fuzzystore_protocol::{Digest, PeerCommand};

/// A stored fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub flag: u8,
    pub digest: Digest,
    /// Accumulated weight.
    pub value: i32,
    /// Unix seconds of the first write.
    pub created: u64,
    /// Unix seconds of the last write.
    pub ts: u64,
    /// Unix seconds after which the entry is gone.
    pub expires_at: u64,
    pub weak: bool,
    pub shingles: Option<Vec<u64>>,
}

impl StoredEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// Timestamp as carried in replies.
    pub fn reply_ts(&self) -> u32 {
        u32::try_from(self.ts).unwrap_or(u32::MAX)
    }
}

/// A WRITE as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub flag: u8,
    pub digest: Digest,
    pub value: i32,
    pub weak: bool,
    pub shingles: Option<Vec<u64>>,
}

impl WriteRequest {
    pub fn new(flag: u8, digest: Digest, value: i32) -> Self {
        Self {
            flag,
            digest,
            value,
            weak: false,
            shingles: None,
        }
    }

    pub fn weak(mut self, weak: bool) -> Self {
        self.weak = weak;
        self
    }

    pub fn with_shingles(mut self, shingles: &[u64]) -> Self {
        self.shingles = Some(shingles.to_vec());
        self
    }
}

/// Votes collected by one candidate during a shingle query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShingleVote {
    pub digest: Digest,
    pub value: i32,
    pub ts: u64,
    pub votes: u32,
}

/// Outcome of applying a batch of queued updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: u32,
    pub deleted: u32,
    pub extended: u32,
    pub ignored: u32,
}

impl UpdateSummary {
    pub fn total(&self) -> u32 {
        self.added + self.deleted + self.extended + self.ignored
    }
}

/// Key-value store of fingerprints keyed by `(flag, digest)`.
///
/// Implementations serialize operations on the same entry: a WRITE racing
/// a DEL or CHECK on the same key observes one of the two orders, never a
/// partially written entry. All timestamps are Unix seconds supplied by the
/// caller.
pub trait FuzzyBackend: Send + Sync {
    /// Exact lookup. Expired entries are reported as absent.
    fn lookup(&self, flag: u8, digest: &Digest, now: u64)
        -> Result<Option<StoredEntry>, StorageError>;

    /// Counts, per stored entry in `flag`, how many positions of `shingles`
    /// match the entry's shingle at the same position.
    ///
    /// The result is one consistent snapshot taken under a single read.
    fn shingle_votes(
        &self,
        flag: u8,
        shingles: &[u64],
        now: u64,
    ) -> Result<Vec<ShingleVote>, StorageError>;

    /// Adds `value` to the entry's weight (saturating), refreshes its TTL and
    /// replaces its shingles if any are given.
    fn upsert(&self, write: &WriteRequest, now: u64) -> Result<StoredEntry, StorageError>;

    /// Removes the entry and its shingle index entries.
    fn remove(&self, flag: u8, digest: &Digest) -> Result<Option<StoredEntry>, StorageError>;

    /// Extends the TTL of a live entry. Returns false if there is none.
    fn touch(&self, flag: u8, digest: &Digest, now: u64) -> Result<bool, StorageError>;

    /// Drops every entry whose TTL has passed. Returns how many were dropped.
    fn expire(&self, now: u64) -> Result<usize, StorageError>;

    /// Number of stored entries, including expired ones not yet swept by
    /// [`expire`](Self::expire).
    fn count(&self) -> u64;

    /// Number of entries still live at `now`.
    fn live_count(&self, now: u64) -> u64 {
        let _ = now;
        self.count()
    }

    /// Last revision applied from `source`, zero if none.
    fn version(&self, source: &str) -> u64;

    /// Applies a batch of queued updates atomically.
    ///
    /// Without a `revision` a non-empty batch bumps the source's version by
    /// one. With one, the batch is refused with
    /// [`StorageError::StaleRevision`] unless `revision` is newer than the
    /// stored version, and the version becomes `revision` even for an empty
    /// batch.
    fn process_updates(
        &self,
        batch: &[PeerCommand],
        source: &str,
        revision: Option<u64>,
        now: u64,
    ) -> Result<UpdateSummary, StorageError>;

    /// Flushes the entries live at `now` to durable storage, if the backend
    /// has any.
    fn sync(&self, now: u64) -> Result<(), StorageError> {
        let _ = now;
        Ok(())
    }
}
