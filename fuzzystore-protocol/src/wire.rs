//! Fixed-layout command and reply structures.
//!
//! ```text
//! Command (76 bytes):
//! +---------+-----+----------------+------+-------+-----+--------------+
//! | version | cmd | shingles_count | flag | value | tag | digest       |
//! | u8      | u8  | u8             | u8   | i32   | u32 | 64 bytes     |
//! +---------+-----+----------------+------+-------+-----+--------------+
//!
//! ShingleCommand (332 bytes) = Command | 32 x u64 shingles
//!
//! ReplyV1 (16 bytes):  value i32 | flag u32 | tag u32 | prob f32
//! Reply   (96 bytes):  ReplyV1 | digest 64 | ts u32 | reserved 12
//! ```
//!
//! Every field is little-endian and written explicitly, so nothing depends on
//! in-memory struct layout.

use crate::error::{FormatError, RejectCode};
use crate::{CLIENT_MAX, HASH_BYTES, PROTOCOL_VERSION, SHINGLE_COUNT, VERSION_MASK, WEAK_FLAG};
use bytes::{Buf, BufMut, BytesMut};

/// Size of a plain command.
pub const COMMAND_SIZE: usize = 4 + 4 + 4 + HASH_BYTES;

/// Size of a shingle command.
pub const SHINGLE_COMMAND_SIZE: usize = COMMAND_SIZE + SHINGLE_COUNT * 8;

/// Size of a legacy (EPOCH10) reply.
pub const REPLY_V1_SIZE: usize = 16;

/// Size of a full (EPOCH11) reply.
pub const REPLY_SIZE: usize = REPLY_V1_SIZE + HASH_BYTES + 4 + 12;

/// A content digest.
pub type Digest = [u8; HASH_BYTES];

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Check = 0,
    Write = 1,
    Del = 2,
    Stat = 3,
    Ping = 4,
    /// Internal: extend the TTL of an existing entry.
    Refresh = 100,
    /// Internal: superseded update, skipped when the batch is applied.
    Dup = 101,
}

impl Opcode {
    /// Returns true for opcodes that only the server itself or a trusted
    /// master may issue.
    pub fn is_internal(self) -> bool {
        (self as u8) > CLIENT_MAX
    }

    /// Returns true for opcodes that change stored entries.
    pub fn mutates(self) -> bool {
        matches!(self, Opcode::Write | Opcode::Del)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Check => "CHECK",
            Opcode::Write => "WRITE",
            Opcode::Del => "DEL",
            Opcode::Stat => "STAT",
            Opcode::Ping => "PING",
            Opcode::Refresh => "REFRESH",
            Opcode::Dup => "DUP",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Check),
            1 => Ok(Opcode::Write),
            2 => Ok(Opcode::Del),
            3 => Ok(Opcode::Stat),
            4 => Ok(Opcode::Ping),
            100 => Ok(Opcode::Refresh),
            101 => Ok(Opcode::Dup),
            other => Err(FormatError::UnknownCommand(other)),
        }
    }
}

/// Protocol generation, which selects the reply layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    /// Versions 1 to 3: 16-byte replies.
    Epoch10,
    /// Version 4: 96-byte replies.
    Epoch11,
}

impl Epoch {
    /// Derives the epoch from a raw version byte (weak bit ignored).
    pub fn from_version(version: u8) -> Result<Self, FormatError> {
        match version & VERSION_MASK {
            1..=3 => Ok(Epoch::Epoch10),
            PROTOCOL_VERSION => Ok(Epoch::Epoch11),
            other => Err(FormatError::UnsupportedVersion(other)),
        }
    }

    pub fn reply_size(self) -> usize {
        match self {
            Epoch::Epoch10 => REPLY_V1_SIZE,
            Epoch::Epoch11 => REPLY_SIZE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Epoch::Epoch10 => "epoch10",
            Epoch::Epoch11 => "epoch11",
        }
    }
}

/// The fixed 76-byte command header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub version: u8,
    pub cmd: Opcode,
    pub shingles_count: u8,
    pub flag: u8,
    pub value: i32,
    pub tag: u32,
    pub digest: Digest,
}

impl Command {
    /// Creates a command at the current protocol version.
    pub fn new(cmd: Opcode, flag: u8, digest: Digest) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            cmd,
            shingles_count: 0,
            flag,
            value: 0,
            tag: 0,
            digest,
        }
    }

    pub fn with_value(mut self, value: i32) -> Self {
        self.value = value;
        self
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    /// Marks the command as a weak write.
    pub fn weak(mut self) -> Self {
        self.version |= WEAK_FLAG;
        self
    }

    pub fn protocol_version(&self) -> u8 {
        self.version & VERSION_MASK
    }

    pub fn is_weak(&self) -> bool {
        self.version & WEAK_FLAG != 0
    }

    pub fn epoch(&self) -> Result<Epoch, FormatError> {
        Epoch::from_version(self.version)
    }

    pub(crate) fn put(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.shingles_count);
        buf.put_u8(self.flag);
        buf.put_i32_le(self.value);
        buf.put_u32_le(self.tag);
        buf.put_slice(&self.digest);
    }

    /// Reads a command header, validating version and opcode.
    ///
    /// The caller guarantees at least `COMMAND_SIZE` bytes remain.
    pub(crate) fn read(cur: &mut &[u8]) -> Result<Self, FormatError> {
        let version = cur.get_u8();
        Epoch::from_version(version)?;
        let cmd = Opcode::try_from(cur.get_u8())?;
        let shingles_count = cur.get_u8();
        let flag = cur.get_u8();
        let value = cur.get_i32_le();
        let tag = cur.get_u32_le();
        let mut digest = [0u8; HASH_BYTES];
        cur.copy_to_slice(&mut digest);

        Ok(Self {
            version,
            cmd,
            shingles_count,
            flag,
            value,
            tag,
            digest,
        })
    }
}

/// The 32 shingle sub-hashes of a shingle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shingles(pub [u64; SHINGLE_COUNT]);

impl Shingles {
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub(crate) fn put(&self, buf: &mut impl BufMut) {
        for value in &self.0 {
            buf.put_u64_le(*value);
        }
    }

    pub(crate) fn read(cur: &mut &[u8]) -> Self {
        let mut values = [0u64; SHINGLE_COUNT];
        for value in values.iter_mut() {
            *value = cur.get_u64_le();
        }
        Shingles(values)
    }
}

/// A decoded plaintext request: the command plus its shingles, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub command: Command,
    pub shingles: Option<Shingles>,
}

impl DecodedCommand {
    /// Wraps a command, fixing up `shingles_count` to match.
    pub fn new(mut command: Command, shingles: Option<Shingles>) -> Self {
        command.shingles_count = if shingles.is_some() {
            SHINGLE_COUNT as u8
        } else {
            0
        };
        Self { command, shingles }
    }

    pub fn wire_size(&self) -> usize {
        if self.shingles.is_some() {
            SHINGLE_COMMAND_SIZE
        } else {
            COMMAND_SIZE
        }
    }

    pub fn encode(&self) -> BytesMut {
        encode_command(self)
    }
}

/// Decodes a plaintext command.
///
/// The buffer must be exactly one command: 76 bytes when `shingles_count`
/// is zero, 332 bytes otherwise.
pub fn decode_command(buf: &[u8]) -> Result<DecodedCommand, FormatError> {
    if buf.len() < COMMAND_SIZE {
        return Err(FormatError::BadSize {
            expected: COMMAND_SIZE,
            actual: buf.len(),
        });
    }

    let has_shingles = buf[2] > 0;
    let expected = if has_shingles {
        SHINGLE_COMMAND_SIZE
    } else {
        COMMAND_SIZE
    };
    if buf.len() != expected {
        return Err(FormatError::BadSize {
            expected,
            actual: buf.len(),
        });
    }

    let mut cur = buf;
    let command = Command::read(&mut cur)?;
    let shingles = has_shingles.then(|| Shingles::read(&mut cur));

    Ok(DecodedCommand { command, shingles })
}

/// Encodes a command (and shingles) into its wire form.
pub fn encode_command(cmd: &DecodedCommand) -> BytesMut {
    let mut buf = BytesMut::with_capacity(cmd.wire_size());
    cmd.command.put(&mut buf);
    if let Some(shingles) = &cmd.shingles {
        shingles.put(&mut buf);
    }
    buf
}

/// Splits a request into the command bytes and the trailing extension chain.
///
/// The command size is chosen by `shingles_count` (byte 2).
pub fn split_request(buf: &[u8]) -> Result<(&[u8], &[u8]), FormatError> {
    if buf.len() < COMMAND_SIZE {
        return Err(FormatError::BadSize {
            expected: COMMAND_SIZE,
            actual: buf.len(),
        });
    }
    let size = if buf[2] > 0 {
        SHINGLE_COMMAND_SIZE
    } else {
        COMMAND_SIZE
    };
    if buf.len() < size {
        return Err(FormatError::BadSize {
            expected: size,
            actual: buf.len(),
        });
    }
    Ok(buf.split_at(size))
}

/// Reads the tag of a possibly malformed plaintext request.
pub fn peek_tag(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(8..12)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// A reply in its full form. EPOCH10 replies carry only the first four fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub value: i32,
    pub flag: u32,
    pub tag: u32,
    pub prob: f32,
    pub digest: Digest,
    pub ts: u32,
}

impl Reply {
    /// The "no result" reply.
    pub fn empty(tag: u32) -> Self {
        Self {
            value: 0,
            flag: 0,
            tag,
            prob: 0.0,
            digest: [0u8; HASH_BYTES],
            ts: 0,
        }
    }

    /// A refusal carrying `code` as its value.
    pub fn rejected(tag: u32, code: RejectCode) -> Self {
        Self {
            value: code.value(),
            ..Self::empty(tag)
        }
    }

    /// A successful, non-lookup reply (probability 1).
    pub fn ok(tag: u32, value: i32, flag: u32) -> Self {
        Self {
            value,
            flag,
            prob: 1.0,
            ..Self::empty(tag)
        }
    }

    /// Returns true if the reply reports a match.
    pub fn is_match(&self) -> bool {
        self.prob > 0.5
    }
}

/// Encodes a reply in the layout of the given epoch.
pub fn encode_reply(reply: &Reply, epoch: Epoch) -> BytesMut {
    let mut buf = BytesMut::with_capacity(epoch.reply_size());
    let prob = if reply.prob.is_nan() {
        0.0
    } else {
        reply.prob.clamp(0.0, 1.0)
    };

    buf.put_i32_le(reply.value);
    buf.put_u32_le(reply.flag);
    buf.put_u32_le(reply.tag);
    buf.put_f32_le(prob);

    if epoch == Epoch::Epoch11 {
        buf.put_slice(&reply.digest);
        buf.put_u32_le(reply.ts);
        buf.put_bytes(0, 12);
    }
    buf
}

/// Decodes a reply, inferring the epoch from its length.
pub fn decode_reply(buf: &[u8]) -> Result<(Reply, Epoch), FormatError> {
    let epoch = match buf.len() {
        REPLY_V1_SIZE => Epoch::Epoch10,
        REPLY_SIZE => Epoch::Epoch11,
        other => return Err(FormatError::BadReplySize(other)),
    };

    let mut cur = buf;
    let mut reply = Reply {
        value: cur.get_i32_le(),
        flag: cur.get_u32_le(),
        tag: cur.get_u32_le(),
        prob: cur.get_f32_le(),
        ..Reply::empty(0)
    };

    if epoch == Epoch::Epoch11 {
        cur.copy_to_slice(&mut reply.digest);
        reply.ts = cur.get_u32_le();
    }

    Ok((reply, epoch))
}
