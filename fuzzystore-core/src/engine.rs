//! Matching engine - exact and near-duplicate lookups over a `FuzzyBackend`.

use crate::error::CoreError;
use fuzzystore_protocol::{DecodedCommand, Digest, Opcode, Reply, HASH_BYTES};
use fuzzystore_storage::{FuzzyBackend, ShingleVote, StoredEntry, WriteRequest};
use std::cmp::Ordering;
use std::sync::Arc;

/// Matching thresholds.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    /// Minimum number of agreeing shingles before a near match is reported.
    pub min_votes: u32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self { min_votes: 16 }
    }
}

/// A single engine request.
#[derive(Debug, Clone, Copy)]
pub struct Query<'a> {
    pub op: Opcode,
    pub flag: u8,
    pub digest: &'a Digest,
    pub shingles: Option<&'a [u64]>,
    pub value: i32,
    pub weak: bool,
}

impl<'a> Query<'a> {
    pub fn new(op: Opcode, flag: u8, digest: &'a Digest) -> Self {
        Self {
            op,
            flag,
            digest,
            shingles: None,
            value: 0,
            weak: false,
        }
    }

    pub fn with_shingles(mut self, shingles: &'a [u64]) -> Self {
        self.shingles = Some(shingles);
        self
    }

    pub fn with_value(mut self, value: i32) -> Self {
        self.value = value;
        self
    }

    pub fn weak(mut self, weak: bool) -> Self {
        self.weak = weak;
        self
    }

    pub fn from_command(cmd: &'a DecodedCommand) -> Self {
        Self {
            op: cmd.command.cmd,
            flag: cmd.command.flag,
            digest: &cmd.command.digest,
            shingles: cmd.shingles.as_ref().map(|s| s.as_slice()),
            value: cmd.command.value,
            weak: cmd.command.is_weak(),
        }
    }
}

/// How a CHECK was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Shingle { votes: u32 },
}

/// Engine result: the reply to send (tag left at zero) and the match, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub reply: Reply,
    pub matched: Option<MatchKind>,
}

impl Outcome {
    fn plain(reply: Reply) -> Self {
        Self {
            reply,
            matched: None,
        }
    }
}

/// Evaluates commands against the storage backend.
///
/// The engine holds no mutable state of its own; every call reads the
/// backend afresh and acts only on what that call returned.
pub struct MatchingEngine {
    backend: Arc<dyn FuzzyBackend>,
    policy: MatchPolicy,
}

impl MatchingEngine {
    pub fn new(backend: Arc<dyn FuzzyBackend>, policy: MatchPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend(&self) -> &Arc<dyn FuzzyBackend> {
        &self.backend
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Evaluates one command at time `now` (Unix seconds).
    pub fn evaluate(&self, query: &Query<'_>, now: u64) -> Result<Outcome, CoreError> {
        match query.op {
            Opcode::Check => self.check(query, now),
            Opcode::Write => self.write(query, now),
            Opcode::Del => self.delete(query),
            Opcode::Stat => Ok(self.stat(now)),
            Opcode::Refresh => {
                self.backend.touch(query.flag, query.digest, now)?;
                Ok(Outcome::plain(Reply::ok(0, 0, query.flag as u32)))
            }
            Opcode::Ping | Opcode::Dup => Ok(Outcome::plain(Reply::ok(
                0,
                query.value,
                query.flag as u32,
            ))),
        }
    }

    fn check(&self, query: &Query<'_>, now: u64) -> Result<Outcome, CoreError> {
        if let Some(entry) = self.backend.lookup(query.flag, query.digest, now)? {
            return Ok(Outcome {
                reply: found(&entry),
                matched: Some(MatchKind::Exact),
            });
        }

        let shingles = match query.shingles {
            Some(s) if !s.is_empty() => s,
            _ => return Ok(Outcome::plain(Reply::empty(0))),
        };

        // One snapshot of the votes; nothing below re-reads the backend.
        let votes = self.backend.shingle_votes(query.flag, shingles, now)?;
        let winner = match pick_winner(&votes) {
            Some(w) if w.votes >= self.policy.min_votes => w,
            Some(w) => {
                tracing::debug!(
                    "Shingle candidate below threshold: {} of {} votes (min {})",
                    w.votes,
                    shingles.len(),
                    self.policy.min_votes
                );
                return Ok(Outcome::plain(Reply::empty(0)));
            }
            None => return Ok(Outcome::plain(Reply::empty(0))),
        };

        let prob = winner.votes as f32 / shingles.len() as f32;
        Ok(Outcome {
            reply: Reply {
                value: winner.value,
                flag: query.flag as u32,
                tag: 0,
                prob: prob.min(1.0),
                digest: winner.digest,
                ts: u32::try_from(winner.ts).unwrap_or(u32::MAX),
            },
            matched: Some(MatchKind::Shingle {
                votes: winner.votes,
            }),
        })
    }

    fn write(&self, query: &Query<'_>, now: u64) -> Result<Outcome, CoreError> {
        let mut write =
            WriteRequest::new(query.flag, *query.digest, query.value).weak(query.weak);
        if let Some(shingles) = query.shingles {
            write = write.with_shingles(shingles);
        }

        let entry = self.backend.upsert(&write, now)?;
        Ok(Outcome::plain(found(&entry)))
    }

    fn delete(&self, query: &Query<'_>) -> Result<Outcome, CoreError> {
        let removed = self.backend.remove(query.flag, query.digest)?;
        let value = removed.map_or(0, |e| e.value);
        Ok(Outcome::plain(Reply::ok(0, value, query.flag as u32)))
    }

    fn stat(&self, now: u64) -> Outcome {
        let count = u32::try_from(self.backend.live_count(now)).unwrap_or(u32::MAX);
        Outcome::plain(Reply::ok(0, 0, count))
    }
}

fn found(entry: &StoredEntry) -> Reply {
    Reply {
        value: entry.value,
        flag: entry.flag as u32,
        tag: 0,
        prob: 1.0,
        digest: entry.digest,
        ts: entry.reply_ts(),
    }
}

/// Highest vote count wins; ties go to the newer entry, then the smaller digest.
fn pick_winner(votes: &[ShingleVote]) -> Option<&ShingleVote> {
    votes.iter().max_by(|a, b| compare_candidates(a, b))
}

fn compare_candidates(a: &ShingleVote, b: &ShingleVote) -> Ordering {
    a.votes
        .cmp(&b.votes)
        .then(a.ts.cmp(&b.ts))
        .then_with(|| b.digest.cmp(&a.digest))
}

/// An all-zero digest, used when a reply carries no entry.
pub const EMPTY_DIGEST: Digest = [0u8; HASH_BYTES];
