//! Deferred update queue.
//!
//! Refreshes triggered by matches and updates pushed by masters are queued
//! here and applied in batches on every maintenance tick, together with
//! expiry and the snapshot sync. Applied local batches are handed to the
//! mirror task with their revision.

use crate::metrics::Metrics;
use crate::mirror::MirrorBatch;
use fuzzystore_core::unix_now;
use fuzzystore_protocol::{Digest, Opcode, PeerCommand};
use fuzzystore_storage::{FuzzyBackend, StorageError, UpdateSummary};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Rewrites redundant refreshes to DUP.
///
/// A REFRESH is redundant when the same `(flag, digest)` was already
/// refreshed earlier in the batch, or is written or deleted anywhere in it.
/// Returns how many commands were rewritten.
pub fn coalesce(batch: &mut [PeerCommand]) -> usize {
    let mutated: HashSet<(u8, Digest)> = batch
        .iter()
        .filter(|cmd| matches!(cmd.opcode(), Opcode::Write | Opcode::Del))
        .map(entry_key)
        .collect();

    let mut refreshed = HashSet::new();
    let mut rewritten = 0;
    for cmd in batch.iter_mut() {
        if cmd.opcode() != Opcode::Refresh {
            continue;
        }
        let key = entry_key(cmd);
        if mutated.contains(&key) || !refreshed.insert(key) {
            cmd.command_mut().cmd = Opcode::Dup;
            rewritten += 1;
        }
    }
    rewritten
}

fn entry_key(cmd: &PeerCommand) -> (u8, Digest) {
    let command = cmd.command();
    (command.flag, command.digest)
}

/// Updates from one source waiting for the next flush.
struct Pending {
    source: String,
    /// Set for batches pushed by a master and for local batches bound for
    /// mirrors.
    revision: Option<u64>,
    commands: Vec<PeerCommand>,
    /// Already applied by the handler; only forwarded to mirrors.
    applied: Vec<PeerCommand>,
}

impl Pending {
    fn new(source: String, revision: Option<u64>, commands: Vec<PeerCommand>) -> Self {
        Self {
            source,
            revision,
            commands,
            applied: Vec::new(),
        }
    }
}

/// Queue of updates waiting to be applied to the backend.
pub struct UpdateQueue {
    backend: Arc<dyn FuzzyBackend>,
    interval: Duration,
    max_fail: u32,
    local_source: String,
    pending: Mutex<Vec<Pending>>,
    applied: Mutex<Vec<PeerCommand>>,
    mirror: Mutex<Option<mpsc::UnboundedSender<MirrorBatch>>>,
    failures: AtomicU32,
    shutdown: AtomicBool,
    notify: Notify,
    metrics: Option<Arc<Metrics>>,
}

impl UpdateQueue {
    pub fn new(backend: Arc<dyn FuzzyBackend>, interval: Duration, max_fail: u32) -> Self {
        Self {
            backend,
            interval,
            max_fail,
            local_source: "local".to_string(),
            pending: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            mirror: Mutex::new(None),
            failures: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            metrics: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.local_source = source.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sends every applied local batch, with its new revision, to `mirror`.
    pub fn with_mirror(mut self, mirror: mpsc::UnboundedSender<MirrorBatch>) -> Self {
        self.mirror = Mutex::new(Some(mirror));
        self
    }

    pub fn local_source(&self) -> &str {
        &self.local_source
    }

    /// Queues an update produced by this server.
    pub fn push_local(&self, cmd: PeerCommand) {
        let source = self.local_source.clone();
        self.push(source, cmd);
    }

    /// Queues an update received from `source`.
    pub fn push(&self, source: impl Into<String>, cmd: PeerCommand) {
        let source = source.into();
        let mut pending = self.pending.lock();
        match pending.last_mut() {
            Some(last) if last.revision.is_none() && last.source == source => {
                last.commands.push(cmd);
            }
            _ => pending.push(Pending::new(source, None, vec![cmd])),
        }
    }

    /// Queues a complete batch pushed by a master.
    ///
    /// Refused unless `revision` is newer than both the applied version of
    /// `source` and any batch from it still queued.
    pub fn push_batch(
        &self,
        source: impl Into<String>,
        revision: u64,
        commands: Vec<PeerCommand>,
    ) -> Result<(), StorageError> {
        let source = source.into();
        let mut pending = self.pending.lock();
        let current = pending
            .iter()
            .filter(|p| p.source == source)
            .filter_map(|p| p.revision)
            .fold(self.backend.version(&source), u64::max);

        if revision <= current {
            return Err(StorageError::StaleRevision {
                origin: source,
                revision,
                current,
            });
        }
        if revision > current + 1 {
            tracing::warn!(
                "Revision {} from {} skips ahead of {}, a full resync is recommended",
                revision,
                source,
                current
            );
        }

        pending.push(Pending::new(source, Some(revision), commands));
        Ok(())
    }

    /// Records a WRITE or DEL the handler already applied, for the mirrors.
    /// Does nothing when no mirror is configured.
    pub fn forward(&self, cmd: PeerCommand) {
        if self.mirror.lock().is_some() {
            self.applied.lock().push(cmd);
        }
    }

    /// Number of queued updates.
    pub fn len(&self) -> usize {
        self.pending.lock().iter().map(|p| p.commands.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive failed flushes so far.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Applies everything queued, one batch per source.
    ///
    /// A failed batch is put back at the head of the queue; once more than
    /// `max_fail` flushes in a row have failed it is discarded instead.
    /// Batches whose revision is no longer newer than the stored one are
    /// dropped without counting as a failure.
    pub fn flush(&self, now: u64) -> Result<UpdateSummary, StorageError> {
        let queued = std::mem::take(&mut *self.pending.lock());
        let applied = std::mem::take(&mut *self.applied.lock());
        if queued.is_empty() && applied.is_empty() {
            return Ok(UpdateSummary::default());
        }

        let mut total = UpdateSummary::default();
        let mut failed: Vec<Pending> = Vec::new();
        let mut last_error = None;

        for mut batch in self.assemble(queued, applied) {
            let dups = coalesce(&mut batch.commands);
            match self
                .backend
                .process_updates(&batch.commands, &batch.source, batch.revision, now)
            {
                Ok(summary) => {
                    tracing::info!(
                        "Applied {} updates from {}: {} added, {} deleted, {} extended, {} ignored ({} duplicates)",
                        batch.commands.len(),
                        batch.source,
                        summary.added,
                        summary.deleted,
                        summary.extended,
                        summary.ignored,
                        dups
                    );
                    if let Some(ref metrics) = self.metrics {
                        metrics.record_updates(&summary);
                    }
                    total.added += summary.added;
                    total.deleted += summary.deleted;
                    total.extended += summary.extended;
                    total.ignored += summary.ignored;
                    self.send_to_mirror(batch);
                }
                Err(e @ StorageError::StaleRevision { .. }) => {
                    tracing::warn!("Dropping {} updates: {}", batch.commands.len(), e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to apply {} updates from {}: {}",
                        batch.commands.len(),
                        batch.source,
                        e
                    );
                    failed.push(batch);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => {
                self.failures.store(0, Ordering::Relaxed);
                Ok(total)
            }
            Some(e) => {
                let count: usize = failed.iter().map(|p| p.commands.len()).sum();
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures > self.max_fail {
                    tracing::error!(
                        "Discarding {} updates after {} failed attempts",
                        count,
                        failures
                    );
                    self.failures.store(0, Ordering::Relaxed);
                } else {
                    tracing::warn!(
                        "Re-queued {} updates, {} attempts left",
                        count,
                        self.max_fail + 1 - failures
                    );
                    let mut pending = self.pending.lock();
                    failed.append(&mut pending);
                    *pending = failed;
                }
                Err(e)
            }
        }
    }

    /// Orders queued updates into batches: revisioned ones as they arrived,
    /// then one batch per remaining source. With a mirror configured the
    /// local batch takes the next local revision.
    fn assemble(&self, queued: Vec<Pending>, applied: Vec<PeerCommand>) -> Vec<Pending> {
        let mut ordered = Vec::new();
        let mut grouped: BTreeMap<String, Vec<PeerCommand>> = BTreeMap::new();
        for pending in queued {
            if pending.revision.is_some() {
                ordered.push(pending);
            } else {
                grouped
                    .entry(pending.source)
                    .or_default()
                    .extend(pending.commands);
            }
        }

        if self.mirror.lock().is_some() {
            let local = grouped.remove(&self.local_source).unwrap_or_default();
            if !local.is_empty() || !applied.is_empty() {
                let revision = ordered
                    .iter()
                    .filter(|p| p.source == self.local_source)
                    .filter_map(|p| p.revision)
                    .fold(self.backend.version(&self.local_source), u64::max)
                    + 1;
                ordered.push(Pending {
                    source: self.local_source.clone(),
                    revision: Some(revision),
                    commands: local,
                    applied,
                });
            }
        }

        ordered.extend(
            grouped
                .into_iter()
                .map(|(source, commands)| Pending::new(source, None, commands)),
        );
        ordered
    }

    fn send_to_mirror(&self, batch: Pending) {
        let Some(revision) = batch.revision else {
            return;
        };
        if batch.source != self.local_source {
            return;
        }

        let mut commands = batch.applied;
        commands.extend(
            batch
                .commands
                .into_iter()
                .filter(|cmd| cmd.opcode() != Opcode::Dup),
        );
        if let Some(mirror) = self.mirror.lock().as_ref() {
            if mirror.send(MirrorBatch { revision, commands }).is_err() {
                tracing::debug!("Mirror task stopped, revision {} not forwarded", revision);
            }
        }
    }

    /// One maintenance tick: flush, expire and sync.
    pub fn maintain(&self, now: u64) {
        // Flush errors are logged and re-queued inside flush.
        let _ = self.flush(now);

        match self.backend.expire(now) {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Expired {} entries", n),
            Err(e) => tracing::warn!("Expiry failed: {}", e),
        }

        if let Err(e) = self.backend.sync(now) {
            tracing::error!("Failed to sync storage: {}", e);
        }

        if let Some(ref metrics) = self.metrics {
            metrics.stored_hashes.set(self.backend.live_count(now) as f64);
        }
    }

    /// Runs the maintenance loop (call from a background task).
    pub async fn run(&self) {
        tracing::info!(
            "Update queue started (interval={}s, max_fail={})",
            self.interval.as_secs_f64(),
            self.max_fail
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.maintain(unix_now());
        }

        // Final flush so queued updates reach the snapshot and the mirrors.
        self.maintain(unix_now());
        self.mirror.lock().take();
        tracing::info!("Update queue stopped");
    }

    /// Triggers a maintenance tick without waiting for the interval.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Signals the loop to run a final tick and stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzystore_protocol::{Command, HASH_BYTES};
    use fuzzystore_storage::{
        MemoryBackend, MemoryConfig, ShingleVote, StoredEntry, WriteRequest,
    };

    fn write(flag: u8, byte: u8, value: i32) -> PeerCommand {
        PeerCommand::Normal(Command::new(Opcode::Write, flag, [byte; HASH_BYTES]).with_value(value))
    }

    fn del(flag: u8, byte: u8) -> PeerCommand {
        PeerCommand::Normal(Command::new(Opcode::Del, flag, [byte; HASH_BYTES]))
    }

    fn refresh(flag: u8, byte: u8) -> PeerCommand {
        PeerCommand::refresh(flag, [byte; HASH_BYTES], None)
    }

    fn memory() -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend::new(MemoryConfig::default()))
    }

    #[test]
    fn test_coalesce() {
        let mut batch = vec![
            refresh(1, 1),
            refresh(1, 1),
            refresh(2, 1),
            write(1, 2, 5),
            refresh(1, 2),
            del(1, 3),
            refresh(1, 3),
        ];
        assert_eq!(coalesce(&mut batch), 3);

        let ops: Vec<Opcode> = batch.iter().map(|c| c.opcode()).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::Refresh,
                Opcode::Dup,
                Opcode::Refresh,
                Opcode::Write,
                Opcode::Dup,
                Opcode::Del,
                Opcode::Dup,
            ]
        );
    }

    #[test]
    fn test_flush_applies_per_source() {
        let backend = memory();
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3);

        queue.push("10.0.0.1", write(1, 1, 10));
        queue.push("10.0.0.1", write(1, 2, 10));
        queue.push_local(refresh(1, 1));
        assert_eq!(queue.len(), 3);

        let summary = queue.flush(1000).unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.extended, 1);
        assert!(queue.is_empty());

        assert_eq!(backend.count(), 2);
        assert_eq!(backend.version("10.0.0.1"), 1);
        assert_eq!(backend.version("local"), 1);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let backend = memory();
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3);
        assert_eq!(queue.flush(1).unwrap(), UpdateSummary::default());
        assert_eq!(backend.version("local"), 0);
    }

    /// Fails `process_updates` a fixed number of times, then delegates.
    struct FlakyBackend {
        inner: MemoryBackend,
        failures_left: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryBackend::new(MemoryConfig::default()),
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    impl FuzzyBackend for FlakyBackend {
        fn lookup(&self, flag: u8, digest: &Digest, now: u64) -> Result<Option<StoredEntry>, StorageError> {
            self.inner.lookup(flag, digest, now)
        }

        fn shingle_votes(&self, flag: u8, shingles: &[u64], now: u64) -> Result<Vec<ShingleVote>, StorageError> {
            self.inner.shingle_votes(flag, shingles, now)
        }

        fn upsert(&self, write: &WriteRequest, now: u64) -> Result<StoredEntry, StorageError> {
            self.inner.upsert(write, now)
        }

        fn remove(&self, flag: u8, digest: &Digest) -> Result<Option<StoredEntry>, StorageError> {
            self.inner.remove(flag, digest)
        }

        fn touch(&self, flag: u8, digest: &Digest, now: u64) -> Result<bool, StorageError> {
            self.inner.touch(flag, digest, now)
        }

        fn expire(&self, now: u64) -> Result<usize, StorageError> {
            self.inner.expire(now)
        }

        fn count(&self) -> u64 {
            self.inner.count()
        }

        fn version(&self, source: &str) -> u64 {
            self.inner.version(source)
        }

        fn process_updates(
            &self,
            batch: &[PeerCommand],
            source: &str,
            revision: Option<u64>,
            now: u64,
        ) -> Result<UpdateSummary, StorageError> {
            let left = self.failures_left.load(Ordering::Relaxed);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::Relaxed);
                return Err(StorageError::Unavailable("flaky".into()));
            }
            self.inner.process_updates(batch, source, revision, now)
        }
    }

    #[test]
    fn test_failed_flush_requeues() {
        let backend = Arc::new(FlakyBackend::new(1));
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3);

        queue.push_local(write(1, 1, 10));
        assert!(queue.flush(1).is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.failures(), 1);

        // Newer updates go behind the re-queued ones.
        queue.push_local(del(1, 1));
        let summary = queue.flush(2).unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(queue.failures(), 0);
        assert_eq!(backend.count(), 0);
    }

    #[test]
    fn test_batch_discarded_after_max_fail() {
        let backend = Arc::new(FlakyBackend::new(10));
        let queue = UpdateQueue::new(backend, Duration::from_secs(60), 2);

        queue.push_local(write(1, 1, 10));
        assert!(queue.flush(1).is_err());
        assert!(queue.flush(1).is_err());
        assert_eq!(queue.len(), 1);

        assert!(queue.flush(1).is_err());
        assert!(queue.is_empty());
        assert_eq!(queue.failures(), 0);
    }

    #[test]
    fn test_replayed_batch_refused() {
        let backend = memory();
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3);

        queue.push_batch("10.0.0.1", 1, vec![write(1, 1, 3)]).unwrap();
        assert_eq!(queue.flush(1000).unwrap().added, 1);
        assert_eq!(backend.version("10.0.0.1"), 1);

        let err = queue
            .push_batch("10.0.0.1", 1, vec![write(1, 1, 3)])
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleRevision { current: 1, .. }));
        assert!(queue.is_empty());

        // A queued revision counts too
        queue.push_batch("10.0.0.1", 2, vec![write(1, 1, 3)]).unwrap();
        assert!(queue.push_batch("10.0.0.1", 2, vec![write(1, 1, 3)]).is_err());
        assert_eq!(queue.len(), 1);
        queue.flush(1001).unwrap();

        let entry = backend.lookup(1, &[1u8; HASH_BYTES], 1001).unwrap().unwrap();
        assert_eq!(entry.value, 6);
        assert_eq!(backend.version("10.0.0.1"), 2);
    }

    #[test]
    fn test_stale_batch_dropped_without_failure() {
        let backend = memory();
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3);

        queue.push_batch("10.0.0.1", 3, vec![write(1, 1, 3)]).unwrap();
        // Applied by another connection before the flush
        backend
            .process_updates(&[], "10.0.0.1", Some(5), 1000)
            .unwrap();

        assert_eq!(queue.flush(1000).unwrap(), UpdateSummary::default());
        assert!(queue.is_empty());
        assert_eq!(queue.failures(), 0);
        assert_eq!(backend.count(), 0);
    }

    #[test]
    fn test_local_updates_sent_to_mirror() {
        let backend = memory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3).with_mirror(tx);

        queue.forward(write(1, 1, 5));
        queue.push_local(refresh(1, 1));
        queue.push_local(refresh(1, 1));
        queue.push("10.0.0.1", write(1, 2, 1));
        queue.flush(1000).unwrap();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.revision, 1);
        let ops: Vec<Opcode> = batch.commands.iter().map(|c| c.opcode()).collect();
        assert_eq!(ops, vec![Opcode::Write, Opcode::Refresh]);
        assert_eq!(backend.version("local"), 1);
        // Updates from other sources are not forwarded
        assert!(rx.try_recv().is_err());

        queue.forward(del(1, 1));
        queue.flush(1001).unwrap();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.revision, 2);
        assert_eq!(batch.commands, vec![del(1, 1)]);

        queue.flush(1002).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.version("local"), 2);
    }

    #[test]
    fn test_forward_without_mirror_is_noop() {
        let backend = memory();
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3);

        queue.forward(write(1, 1, 5));
        assert_eq!(queue.flush(1000).unwrap(), UpdateSummary::default());
        assert_eq!(backend.version("local"), 0);
    }

    #[test]
    fn test_maintain_expires_entries() {
        let backend = memory();
        let queue = UpdateQueue::new(backend.clone(), Duration::from_secs(60), 3);

        queue.push_local(write(1, 1, 10));
        queue.maintain(1000);
        assert_eq!(backend.count(), 1);

        queue.maintain(1000 + 3 * 24 * 3600);
        assert_eq!(backend.count(), 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let backend = memory();
        let queue = Arc::new(UpdateQueue::new(backend.clone(), Duration::from_secs(3600), 3));

        let task = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run().await })
        };

        queue.push_local(write(1, 1, 10));
        queue.shutdown();
        task.await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(backend.count(), 1);
    }
}
