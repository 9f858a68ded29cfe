//! Request dispatch.
//!
//! Every datagram or stream frame passes through [`CommandHandler::handle`],
//! which either produces reply bytes or drops the request. Encrypted
//! requests are opened first, then the plaintext is decoded, checked
//! against the access policy and handed to the matching engine.

use crate::access::AccessPolicy;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::session::RequestContext;
use crate::updates::UpdateQueue;
use fuzzystore_core::{MatchingEngine, Outcome, Query};
use fuzzystore_protocol::envelope::{self, KeyId};
use fuzzystore_protocol::{
    decode_command, encode_reply, peek_tag, split_request, DecodedCommand, Epoch, Extensions,
    FormatError, Keyring, Opcode, PeerCommand, RejectCode, Reply,
};
use std::sync::Arc;

/// CHECK results above this probability refresh the matched entry.
const REFRESH_PROBABILITY: f32 = 0.9;

/// Why a request got no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The envelope could not be opened.
    Crypto,
    /// An internal opcode arrived from an unauthenticated sender.
    InternalCommand,
    /// The reply could not be sealed.
    Seal,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Crypto => "crypto",
            DropReason::InternalCommand => "internal",
            DropReason::Seal => "seal",
        }
    }
}

/// What to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Reply(Vec<u8>),
    Drop(DropReason),
}

impl Disposition {
    pub fn into_reply(self) -> Option<Vec<u8>> {
        match self {
            Disposition::Reply(bytes) => Some(bytes),
            Disposition::Drop(_) => None,
        }
    }
}

/// A decided plaintext answer, before encoding.
enum Answer {
    Reply(Reply, Epoch),
    Drop(DropReason),
}

/// Command handler.
pub struct CommandHandler {
    engine: Arc<MatchingEngine>,
    keyring: Keyring,
    policy: AccessPolicy,
    limiter: Option<RateLimiter>,
    updates: Option<Arc<UpdateQueue>>,
    metrics: Option<Arc<Metrics>>,
}

impl CommandHandler {
    /// Creates a handler with no keys, an open read policy and no limits.
    pub fn new(engine: Arc<MatchingEngine>) -> Self {
        Self {
            engine,
            keyring: Keyring::default(),
            policy: AccessPolicy::default(),
            limiter: None,
            updates: None,
            metrics: None,
        }
    }

    pub fn with_keyring(mut self, keyring: Keyring) -> Self {
        self.keyring = keyring;
        self
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Sets the queue that receives refreshes for matched entries and
    /// applied WRITE/DEL commands for the mirrors.
    pub fn with_updates(mut self, updates: Arc<UpdateQueue>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Handles one raw request.
    pub fn handle(&self, ctx: &RequestContext, buf: &[u8]) -> Disposition {
        if !envelope::is_encrypted(buf) {
            return match self.answer(ctx, buf, None) {
                Answer::Reply(reply, epoch) => {
                    Disposition::Reply(encode_reply(&reply, epoch).to_vec())
                }
                Answer::Drop(reason) => self.dropped(reason),
            };
        }

        let opened = match envelope::open(buf, &self.keyring) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::debug!("Dropping encrypted request from {}: {}", ctx.peer, e);
                return self.dropped(DropReason::Crypto);
            }
        };

        let key_id = opened.key_id();
        match self.answer(ctx, &opened.payload, Some(&key_id)) {
            Answer::Reply(reply, epoch) => {
                match opened.seal_reply(&encode_reply(&reply, epoch)) {
                    Ok(sealed) => Disposition::Reply(sealed),
                    Err(e) => {
                        tracing::warn!("Cannot seal reply to {}: {}", ctx.peer, e);
                        self.dropped(DropReason::Seal)
                    }
                }
            }
            Answer::Drop(reason) => self.dropped(reason),
        }
    }

    fn answer(&self, ctx: &RequestContext, plain: &[u8], key: Option<&KeyId>) -> Answer {
        let (decoded, extensions) = match decode_request(plain) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("Malformed request from {}: {}", ctx.peer, e);
                if let Some(m) = &self.metrics {
                    m.invalid_requests.inc();
                }
                self.count_key(key, "invalid");
                return Answer::Reply(Reply::empty(peek_tag(plain).unwrap_or(0)), Epoch::Epoch10);
            }
        };

        let command = &decoded.command;
        let epoch = command.epoch().unwrap_or(Epoch::Epoch10);
        let op = command.cmd;

        let _timer = self.metrics.as_ref().map(|m| {
            m.requests_total.with_label_values(&[op.name()]).inc();
            m.request_duration
                .with_label_values(&[op.name()])
                .start_timer()
        });

        if op.is_internal() {
            tracing::warn!(
                "Internal command {} from external sender {}",
                op.name(),
                ctx.peer
            );
            return match key {
                Some(_) => self.reject(command.tag, epoch, key, "internal"),
                None => Answer::Drop(DropReason::InternalCommand),
            };
        }

        if key.is_none() && self.policy.requires_encryption() {
            tracing::debug!("Refusing plaintext {} from {}", op.name(), ctx.peer);
            return self.reject(command.tag, epoch, key, "plaintext");
        }

        let ip = ctx.ip();
        if self.policy.is_blocked(ip) {
            tracing::debug!("Refusing {} from blocked source {}", op.name(), ip);
            return self.reject(command.tag, epoch, key, "blocked");
        }

        if op == Opcode::Ping {
            self.count_key(key, "ok");
            return Answer::Reply(
                Reply::ok(command.tag, command.value, u32::from(command.flag)),
                epoch,
            );
        }

        if op.mutates() && !self.policy.can_update(ip) {
            tracing::info!(
                "Refusing {} from {}: updates not allowed",
                op.name(),
                ctx.peer
            );
            return self.reject(command.tag, epoch, key, "update_denied");
        }

        if op == Opcode::Write && self.policy.is_skipped(&command.digest) {
            tracing::info!(
                "Skipping WRITE of listed hash {} from {}",
                short_hex(&command.digest),
                ctx.peer
            );
            self.count_key(key, "skipped");
            return Answer::Reply(Reply::rejected(command.tag, RejectCode::Skipped), epoch);
        }

        if op == Opcode::Check {
            if let Some(limiter) = &self.limiter {
                if !limiter.check(ip) {
                    return self.reject(command.tag, epoch, key, "ratelimit");
                }
            }
        }

        let mut reply = match self
            .engine
            .evaluate(&Query::from_command(&decoded), fuzzystore_core::unix_now())
        {
            Ok(outcome) => {
                if op == Opcode::Check {
                    self.after_check(&decoded, &outcome, epoch);
                } else if op == Opcode::Write || op == Opcode::Del {
                    if let Some(updates) = &self.updates {
                        updates.forward(PeerCommand::from(decoded.clone()));
                    }
                }
                outcome.reply
            }
            Err(e) => {
                tracing::warn!("{} from {} failed: {}", op.name(), ctx.peer, e);
                if let Some(m) = &self.metrics {
                    m.dropped_total.with_label_values(&["backend"]).inc();
                }
                self.count_key(key, "error");
                return Answer::Reply(Reply::empty(command.tag), epoch);
            }
        };
        reply.tag = command.tag;

        if op.mutates() {
            audit(ctx, &decoded, &extensions, &reply);
        }
        self.count_key(key, "ok");
        Answer::Reply(reply, epoch)
    }

    fn after_check(&self, decoded: &DecodedCommand, outcome: &Outcome, epoch: Epoch) {
        let reply = &outcome.reply;
        if let Some(m) = &self.metrics {
            let label = [epoch.label()];
            m.hashes_checked.with_label_values(&label).inc();
            if decoded.shingles.is_some() {
                m.shingle_checks.with_label_values(&label).inc();
            }
            if outcome.matched.is_some() {
                m.hashes_found.with_label_values(&label).inc();
            }
        }

        if reply.prob > REFRESH_PROBABILITY && !self.policy.is_read_only() {
            if let Some(updates) = &self.updates {
                updates.push_local(PeerCommand::refresh(
                    decoded.command.flag,
                    reply.digest,
                    None,
                ));
            }
        }
    }

    fn reject(&self, tag: u32, epoch: Epoch, key: Option<&KeyId>, reason: &str) -> Answer {
        if let Some(m) = &self.metrics {
            m.dropped_total.with_label_values(&[reason]).inc();
        }
        self.count_key(key, "forbidden");
        Answer::Reply(Reply::rejected(tag, RejectCode::Forbidden), epoch)
    }

    fn dropped(&self, reason: DropReason) -> Disposition {
        if let Some(m) = &self.metrics {
            m.dropped_total.with_label_values(&[reason.as_str()]).inc();
        }
        Disposition::Drop(reason)
    }

    fn count_key(&self, key: Option<&KeyId>, outcome: &str) {
        if let (Some(m), Some(key)) = (&self.metrics, key) {
            m.key_requests
                .with_label_values(&[&key.to_hex(), outcome])
                .inc();
        }
    }
}

fn decode_request(buf: &[u8]) -> Result<(DecodedCommand, Extensions), FormatError> {
    let (fixed, rest) = split_request(buf)?;
    let decoded = decode_command(fixed)?;
    Ok((decoded, Extensions::parse(rest)))
}

fn audit(ctx: &RequestContext, decoded: &DecodedCommand, ext: &Extensions, reply: &Reply) {
    let cmd = &decoded.command;
    tracing::info!(
        peer = %ctx.peer,
        transport = ctx.transport.as_str(),
        domain = ext.source_domain().unwrap_or("-"),
        source_ip = ?ext.source_ip(),
        weak = cmd.is_weak(),
        "{} flag={} digest={} value={} -> {}",
        cmd.cmd.name(),
        cmd.flag,
        short_hex(&cmd.digest),
        cmd.value,
        reply.value
    );
}

fn short_hex(digest: &[u8]) -> String {
    hex::encode(&digest[..digest.len().min(10)])
}
