//! In-memory backend.

use crate::backend::{FuzzyBackend, ShingleVote, StoredEntry, UpdateSummary, WriteRequest};
use crate::error::StorageError;
use crate::snapshot::{Snapshot, SnapshotEntry};
use fuzzystore_protocol::{Digest, Opcode, PeerCommand};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// In-memory backend configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Lifetime of a strong entry after its last write or refresh.
    pub expire: Duration,
    /// Lifetime of a weak entry.
    pub weak_expire: Duration,
    /// Snapshot file; `None` keeps everything in memory only.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            expire: Duration::from_secs(2 * 24 * 3600),
            weak_expire: Duration::from_secs(3600),
            snapshot_path: None,
        }
    }
}

impl MemoryConfig {
    fn ttl(&self, weak: bool) -> u64 {
        if weak {
            self.weak_expire.as_secs()
        } else {
            self.expire.as_secs()
        }
    }
}

type EntryKey = (u8, Digest);

/// (flag, position, shingle value)
type ShingleKey = (u8, u32, u64);

#[derive(Default)]
struct Inner {
    entries: HashMap<EntryKey, StoredEntry>,
    shingles: HashMap<ShingleKey, HashSet<Digest>>,
    versions: BTreeMap<String, u64>,
}

impl Inner {
    fn index(&mut self, flag: u8, digest: Digest, shingles: &[u64]) {
        for (pos, value) in shingles.iter().enumerate() {
            self.shingles
                .entry((flag, pos as u32, *value))
                .or_default()
                .insert(digest);
        }
    }

    fn unindex(&mut self, flag: u8, digest: &Digest, shingles: &[u64]) {
        for (pos, value) in shingles.iter().enumerate() {
            let key = (flag, pos as u32, *value);
            if let Some(set) = self.shingles.get_mut(&key) {
                set.remove(digest);
                if set.is_empty() {
                    self.shingles.remove(&key);
                }
            }
        }
    }

    fn insert_loaded(&mut self, entry: StoredEntry) {
        if let Some(shingles) = entry.shingles.clone() {
            self.index(entry.flag, entry.digest, &shingles);
        }
        self.entries.insert((entry.flag, entry.digest), entry);
    }

    fn remove_entry(&mut self, key: &EntryKey) -> Option<StoredEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(shingles) = &entry.shingles {
            self.unindex(entry.flag, &entry.digest, shingles);
        }
        Some(entry)
    }

    fn live(&self, key: &EntryKey, now: u64) -> Option<&StoredEntry> {
        self.entries.get(key).filter(|e| !e.is_expired(now))
    }

    fn upsert(&mut self, write: &WriteRequest, now: u64, config: &MemoryConfig) -> StoredEntry {
        let key = (write.flag, write.digest);
        if self.entries.get(&key).is_some_and(|e| e.is_expired(now)) {
            self.remove_entry(&key);
        }

        let mut replaced = None;
        let entry = match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.value = entry.value.saturating_add(write.value);
                // A strong write promotes; a weak write never demotes.
                entry.weak &= write.weak;
                entry.ts = now;
                entry.expires_at = now.saturating_add(config.ttl(entry.weak));
                if let Some(shingles) = &write.shingles {
                    replaced = entry.shingles.replace(shingles.clone());
                }
                entry.clone()
            }
            None => {
                let entry = StoredEntry {
                    flag: write.flag,
                    digest: write.digest,
                    value: write.value,
                    created: now,
                    ts: now,
                    expires_at: now.saturating_add(config.ttl(write.weak)),
                    weak: write.weak,
                    shingles: write.shingles.clone(),
                };
                self.entries.insert(key, entry.clone());
                entry
            }
        };

        if let Some(shingles) = &write.shingles {
            if let Some(old) = replaced {
                self.unindex(write.flag, &write.digest, &old);
            }
            self.index(write.flag, write.digest, shingles);
        }
        entry
    }

    fn touch(&mut self, key: &EntryKey, now: u64, config: &MemoryConfig) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = now.saturating_add(config.ttl(entry.weak));
                true
            }
            _ => false,
        }
    }

    fn apply(
        &mut self,
        cmd: &PeerCommand,
        now: u64,
        config: &MemoryConfig,
        summary: &mut UpdateSummary,
    ) {
        let command = cmd.command();
        let key = (command.flag, command.digest);

        match command.cmd {
            Opcode::Write => {
                let mut write = WriteRequest::new(command.flag, command.digest, command.value)
                    .weak(command.is_weak());
                if let Some(shingles) = cmd.shingles() {
                    write = write.with_shingles(shingles.as_slice());
                }
                self.upsert(&write, now, config);
                summary.added += 1;
            }
            Opcode::Del => {
                if self.remove_entry(&key).is_some() {
                    summary.deleted += 1;
                } else {
                    summary.ignored += 1;
                }
            }
            Opcode::Refresh => {
                if self.touch(&key, now, config) {
                    summary.extended += 1;
                } else {
                    summary.ignored += 1;
                }
            }
            Opcode::Dup | Opcode::Check | Opcode::Stat | Opcode::Ping => {
                summary.ignored += 1;
            }
        }
    }

    fn snapshot(&self, now: u64) -> Snapshot {
        let mut entries: Vec<SnapshotEntry> = self
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .map(Into::into)
            .collect();
        entries.sort_by(|a, b| (a.flag, &a.digest).cmp(&(b.flag, &b.digest)));
        Snapshot {
            entries,
            versions: self.versions.clone(),
        }
    }
}

/// Fingerprint store held entirely in memory, optionally persisted to a
/// snapshot file on `sync`.
pub struct MemoryBackend {
    config: MemoryConfig,
    inner: RwLock<Inner>,
    dirty: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend without loading any snapshot.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Creates a backend, restoring the configured snapshot if present.
    pub fn open(config: MemoryConfig) -> Result<Self, StorageError> {
        let backend = Self::new(config);

        if let Some(path) = &backend.config.snapshot_path {
            if let Some(snapshot) = Snapshot::load(path)? {
                let mut inner = backend.inner.write();
                for raw in snapshot.entries {
                    inner.insert_loaded(raw.try_into()?);
                }
                inner.versions = snapshot.versions;

                tracing::info!(
                    "Restored {} entries from snapshot {}",
                    inner.entries.len(),
                    path.display()
                );
            }
        }

        Ok(backend)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl FuzzyBackend for MemoryBackend {
    fn lookup(
        &self,
        flag: u8,
        digest: &Digest,
        now: u64,
    ) -> Result<Option<StoredEntry>, StorageError> {
        Ok(self.inner.read().live(&(flag, *digest), now).cloned())
    }

    fn shingle_votes(
        &self,
        flag: u8,
        shingles: &[u64],
        now: u64,
    ) -> Result<Vec<ShingleVote>, StorageError> {
        let inner = self.inner.read();
        let mut votes: HashMap<Digest, u32> = HashMap::new();

        for (pos, value) in shingles.iter().enumerate() {
            if let Some(digests) = inner.shingles.get(&(flag, pos as u32, *value)) {
                for digest in digests {
                    *votes.entry(*digest).or_default() += 1;
                }
            }
        }

        Ok(votes
            .into_iter()
            .filter_map(|(digest, votes)| {
                let entry = inner.live(&(flag, digest), now)?;
                Some(ShingleVote {
                    digest,
                    value: entry.value,
                    ts: entry.ts,
                    votes,
                })
            })
            .collect())
    }

    fn upsert(&self, write: &WriteRequest, now: u64) -> Result<StoredEntry, StorageError> {
        let entry = self.inner.write().upsert(write, now, &self.config);
        self.mark_dirty();
        Ok(entry)
    }

    fn remove(&self, flag: u8, digest: &Digest) -> Result<Option<StoredEntry>, StorageError> {
        let removed = self.inner.write().remove_entry(&(flag, *digest));
        if removed.is_some() {
            self.mark_dirty();
        }
        Ok(removed)
    }

    fn touch(&self, flag: u8, digest: &Digest, now: u64) -> Result<bool, StorageError> {
        let touched = self
            .inner
            .write()
            .touch(&(flag, *digest), now, &self.config);
        if touched {
            self.mark_dirty();
        }
        Ok(touched)
    }

    fn expire(&self, now: u64) -> Result<usize, StorageError> {
        let mut inner = self.inner.write();
        let stale: Vec<EntryKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| *k)
            .collect();

        for key in &stale {
            inner.remove_entry(key);
        }
        drop(inner);

        if !stale.is_empty() {
            self.mark_dirty();
            tracing::debug!("Expired {} entries", stale.len());
        }
        Ok(stale.len())
    }

    fn count(&self) -> u64 {
        self.inner.read().entries.len() as u64
    }

    fn live_count(&self, now: u64) -> u64 {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count() as u64
    }

    fn version(&self, source: &str) -> u64 {
        self.inner.read().versions.get(source).copied().unwrap_or(0)
    }

    fn process_updates(
        &self,
        batch: &[PeerCommand],
        source: &str,
        revision: Option<u64>,
        now: u64,
    ) -> Result<UpdateSummary, StorageError> {
        let mut summary = UpdateSummary::default();
        if batch.is_empty() && revision.is_none() {
            return Ok(summary);
        }

        let mut inner = self.inner.write();
        let current = inner.versions.get(source).copied().unwrap_or(0);
        let next = match revision {
            Some(revision) if revision <= current => {
                return Err(StorageError::StaleRevision {
                    origin: source.to_string(),
                    revision,
                    current,
                });
            }
            Some(revision) => revision,
            None => current + 1,
        };

        for cmd in batch {
            inner.apply(cmd, now, &self.config, &mut summary);
        }
        inner.versions.insert(source.to_string(), next);
        drop(inner);

        self.mark_dirty();
        Ok(summary)
    }

    fn sync(&self, now: u64) -> Result<(), StorageError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let snapshot = self.inner.read().snapshot(now);
        if let Err(e) = snapshot.save(path, now) {
            self.mark_dirty();
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzystore_protocol::{Command, Shingles, HASH_BYTES, SHINGLE_COUNT};
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const NOW: u64 = 1_700_000_000;

    fn digest(byte: u8) -> Digest {
        [byte; HASH_BYTES]
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new(MemoryConfig::default())
    }

    #[test]
    fn test_write_accumulates() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(1), 10), NOW).unwrap();
        let entry = db
            .upsert(&WriteRequest::new(1, digest(1), 15), NOW + 5)
            .unwrap();

        assert_eq!(entry.value, 25);
        assert_eq!(entry.created, NOW);
        assert_eq!(entry.ts, NOW + 5);

        let found = db.lookup(1, &digest(1), NOW + 6).unwrap().unwrap();
        assert_eq!(found.value, 25);
        assert!(db.lookup(2, &digest(1), NOW).unwrap().is_none());
    }

    #[test]
    fn test_write_saturates() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(1), i32::MAX - 1), NOW)
            .unwrap();
        let entry = db.upsert(&WriteRequest::new(1, digest(1), 10), NOW).unwrap();
        assert_eq!(entry.value, i32::MAX);

        db.upsert(&WriteRequest::new(1, digest(2), i32::MIN), NOW)
            .unwrap();
        let entry = db.upsert(&WriteRequest::new(1, digest(2), -1), NOW).unwrap();
        assert_eq!(entry.value, i32::MIN);
    }

    #[test]
    fn test_weak_and_strong_expiry() {
        let db = backend();
        let weak = db
            .upsert(&WriteRequest::new(1, digest(1), 1).weak(true), NOW)
            .unwrap();
        assert!(weak.weak);
        assert_eq!(weak.expires_at, NOW + 3600);

        // Weak write to a strong entry keeps it strong
        db.upsert(&WriteRequest::new(1, digest(2), 1), NOW).unwrap();
        let still_strong = db
            .upsert(&WriteRequest::new(1, digest(2), 1).weak(true), NOW)
            .unwrap();
        assert!(!still_strong.weak);
        assert_eq!(still_strong.expires_at, NOW + 2 * 24 * 3600);

        // Strong write promotes the weak entry
        let promoted = db.upsert(&WriteRequest::new(1, digest(1), 1), NOW).unwrap();
        assert!(!promoted.weak);
    }

    #[test]
    fn test_expired_entries_are_absent() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(1), 5).weak(true), NOW)
            .unwrap();
        db.upsert(&WriteRequest::new(1, digest(2), 5), NOW).unwrap();

        let later = NOW + 3600;
        assert!(db.lookup(1, &digest(1), later).unwrap().is_none());
        assert!(db.lookup(1, &digest(2), later).unwrap().is_some());

        // Writing over an expired entry starts from zero
        let fresh = db.upsert(&WriteRequest::new(1, digest(1), 3), later).unwrap();
        assert_eq!(fresh.value, 3);
        assert_eq!(fresh.created, later);
    }

    #[test]
    fn test_expire_sweeps_index() {
        let db = backend();
        db.upsert(
            &WriteRequest::new(1, digest(1), 5)
                .weak(true)
                .with_shingles(&[1, 2, 3]),
            NOW,
        )
        .unwrap();
        db.upsert(&WriteRequest::new(1, digest(2), 5), NOW).unwrap();

        assert_eq!(db.expire(NOW + 3600).unwrap(), 1);
        assert_eq!(db.count(), 1);
        assert!(db.inner.read().shingles.is_empty());
        assert_eq!(db.expire(NOW + 3600).unwrap(), 0);
    }

    #[test]
    fn test_live_count_ignores_unswept() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(1), 5).weak(true), NOW)
            .unwrap();
        db.upsert(&WriteRequest::new(1, digest(2), 5), NOW).unwrap();

        assert_eq!(db.live_count(NOW), 2);
        assert_eq!(db.live_count(NOW + 3600), 1);
        assert_eq!(db.count(), 2);
    }

    #[test]
    fn test_remove_idempotent() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(1), 7), NOW).unwrap();

        let removed = db.remove(1, &digest(1)).unwrap().unwrap();
        assert_eq!(removed.value, 7);
        assert!(db.remove(1, &digest(1)).unwrap().is_none());
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn test_shingle_votes() {
        let db = backend();
        let stored = [10, 20, 30, 40, 50, 60, 70, 80];
        db.upsert(
            &WriteRequest::new(1, digest(1), 3).with_shingles(&stored),
            NOW,
        )
        .unwrap();

        let query = [10, 20, 30, 40, 50, 60, 0, 0];
        let votes = db.shingle_votes(1, &query, NOW).unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].votes, 6);
        assert_eq!(votes[0].value, 3);

        // Same values at different positions do not vote
        let shifted = [0, 10, 20, 30, 40, 50, 60, 70];
        assert!(db.shingle_votes(1, &shifted, NOW).unwrap().is_empty());

        // Other flags are separate namespaces
        assert!(db.shingle_votes(2, &query, NOW).unwrap().is_empty());
    }

    #[test]
    fn test_shingles_replaced_and_removed() {
        let db = backend();
        db.upsert(
            &WriteRequest::new(1, digest(1), 1).with_shingles(&[1, 2, 3, 4]),
            NOW,
        )
        .unwrap();
        db.upsert(
            &WriteRequest::new(1, digest(1), 1).with_shingles(&[5, 6, 7, 8]),
            NOW,
        )
        .unwrap();

        assert!(db.shingle_votes(1, &[1, 2, 3, 4], NOW).unwrap().is_empty());
        assert_eq!(db.shingle_votes(1, &[5, 6, 7, 8], NOW).unwrap()[0].votes, 4);

        // A plain write keeps existing shingles
        db.upsert(&WriteRequest::new(1, digest(1), 1), NOW).unwrap();
        assert_eq!(db.shingle_votes(1, &[5, 6, 7, 8], NOW).unwrap()[0].votes, 4);

        db.remove(1, &digest(1)).unwrap();
        assert!(db.inner.read().shingles.is_empty());
    }

    #[test]
    fn test_touch() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(1), 1), NOW).unwrap();

        assert!(db.touch(1, &digest(1), NOW + 100).unwrap());
        let entry = db.lookup(1, &digest(1), NOW + 100).unwrap().unwrap();
        assert_eq!(entry.expires_at, NOW + 100 + 2 * 24 * 3600);
        // Refresh does not count as a write
        assert_eq!(entry.ts, NOW);

        assert!(!db.touch(1, &digest(9), NOW).unwrap());
    }

    #[test]
    fn test_process_updates() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(2), 1), NOW).unwrap();

        let shingles = Shingles([9u64; SHINGLE_COUNT]);
        let batch = vec![
            PeerCommand::Shingle(
                Command::new(Opcode::Write, 1, digest(1)).with_value(4),
                shingles,
            ),
            PeerCommand::refresh(1, digest(2), None),
            PeerCommand::Normal(Command::new(Opcode::Del, 1, digest(3))),
            PeerCommand::Normal(Command::new(Opcode::Dup, 1, digest(2))),
            PeerCommand::Normal(Command::new(Opcode::Del, 1, digest(2))),
        ];

        let summary = db.process_updates(&batch, "local", None, NOW).unwrap();
        assert_eq!(
            summary,
            UpdateSummary {
                added: 1,
                deleted: 1,
                extended: 1,
                ignored: 2,
            }
        );
        assert_eq!(summary.total(), 5);
        assert_eq!(db.version("local"), 1);
        assert_eq!(db.version("master"), 0);

        assert_eq!(db.lookup(1, &digest(1), NOW).unwrap().unwrap().value, 4);
        assert_eq!(
            db.shingle_votes(1, shingles.as_slice(), NOW).unwrap()[0].votes,
            SHINGLE_COUNT as u32
        );

        // Empty batches do not bump the version
        db.process_updates(&[], "local", None, NOW).unwrap();
        assert_eq!(db.version("local"), 1);
    }

    #[test]
    fn test_revisioned_batch_applied_once() {
        let db = backend();
        let batch = vec![PeerCommand::Normal(
            Command::new(Opcode::Write, 1, digest(1)).with_value(3),
        )];

        db.process_updates(&batch, "master", Some(4), NOW).unwrap();
        assert_eq!(db.version("master"), 4);

        let err = db
            .process_updates(&batch, "master", Some(4), NOW)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::StaleRevision {
                revision: 4,
                current: 4,
                ..
            }
        ));
        assert!(db
            .process_updates(&batch, "master", Some(2), NOW)
            .is_err());
        assert_eq!(db.lookup(1, &digest(1), NOW).unwrap().unwrap().value, 3);

        // An empty batch still moves the revision forward
        db.process_updates(&[], "master", Some(6), NOW).unwrap();
        assert_eq!(db.version("master"), 6);
        assert_eq!(db.version("other"), 0);
    }

    #[test]
    fn test_snapshot_persistence() {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig {
            snapshot_path: Some(dir.path().join("fuzzy.json")),
            ..MemoryConfig::default()
        };

        {
            let db = MemoryBackend::open(config.clone()).unwrap();
            db.upsert(
                &WriteRequest::new(3, digest(1), 12).with_shingles(&[1, 2]),
                NOW,
            )
            .unwrap();
            db.process_updates(
                &[PeerCommand::refresh(3, digest(1), None)],
                "master",
                Some(5),
                NOW,
            )
            .unwrap();
            db.sync(NOW).unwrap();
        }

        let db = MemoryBackend::open(config).unwrap();
        assert_eq!(db.count(), 1);
        assert_eq!(db.lookup(3, &digest(1), NOW).unwrap().unwrap().value, 12);
        assert_eq!(db.shingle_votes(3, &[1, 2], NOW).unwrap()[0].votes, 2);
        assert_eq!(db.version("master"), 5);
    }

    #[test]
    fn test_snapshot_drops_expired() {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig {
            snapshot_path: Some(dir.path().join("fuzzy.json")),
            ..MemoryConfig::default()
        };

        {
            let db = MemoryBackend::open(config.clone()).unwrap();
            db.upsert(&WriteRequest::new(1, digest(1), 5).weak(true), NOW)
                .unwrap();
            db.upsert(&WriteRequest::new(1, digest(2), 5), NOW).unwrap();
            // Not swept yet, but past the weak TTL.
            db.sync(NOW + 3600).unwrap();
            assert_eq!(db.count(), 2);
        }

        let db = MemoryBackend::open(config).unwrap();
        assert_eq!(db.count(), 1);
        assert!(db.lookup(1, &digest(2), NOW).unwrap().is_some());
    }

    #[test]
    fn test_sync_without_path_is_noop() {
        let db = backend();
        db.upsert(&WriteRequest::new(1, digest(1), 1), NOW).unwrap();
        db.sync(NOW).unwrap();
    }

    #[test]
    fn test_concurrent_writes_are_not_lost() {
        let db = Arc::new(backend());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        db.upsert(&WriteRequest::new(1, digest(1), 1), NOW).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(db.lookup(1, &digest(1), NOW).unwrap().unwrap().value, 800);
    }

    proptest! {
        #[test]
        fn prop_weight_is_saturating_sum(values in proptest::collection::vec(any::<i32>(), 1..20)) {
            let db = backend();
            let mut expected: i32 = 0;
            for v in &values {
                expected = expected.saturating_add(*v);
                db.upsert(&WriteRequest::new(1, digest(1), *v), NOW).unwrap();
            }
            let entry = db.lookup(1, &digest(1), NOW).unwrap().unwrap();
            prop_assert_eq!(entry.value, expected);
        }
    }
}
