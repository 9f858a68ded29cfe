//! Internal peer commands.
//!
//! A peer command is what the update queue stores and what a master pushes
//! to its replicas:
//!
//! ```text
//! +------------+------------------------------------------+
//! | is_shingle | command union                            |
//! | i32 LE     | 332 bytes (plain commands zero padded)   |
//! +------------+------------------------------------------+
//! ```
//!
//! Masters push revisioned batches, split into [`UpdateChunk`]s small enough
//! to fit one sealed frame each:
//!
//! ```text
//! +----------+--------+--------+-------+----------+---------------------+
//! | revision | seq    | count  | flags | reserved | count peer commands |
//! | u64 LE   | u32 LE | u16 LE | u8    | u8       |                     |
//! +----------+--------+--------+-------+----------+---------------------+
//! ```

use crate::envelope::ENC_REQ_HEADER_SIZE;
use crate::error::FormatError;
use crate::frame::MAX_FRAME_SIZE;
use crate::wire::{Command, DecodedCommand, Digest, Opcode, Shingles, COMMAND_SIZE, SHINGLE_COMMAND_SIZE};
use bytes::{Buf, BufMut, BytesMut};

/// Size of an encoded peer command.
pub const PEER_COMMAND_SIZE: usize = 4 + SHINGLE_COMMAND_SIZE;

/// Size of the header in front of a chunk's commands.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Most commands one chunk carries once sealed into a single frame.
pub const MAX_CHUNK_COMMANDS: usize =
    (MAX_FRAME_SIZE - ENC_REQ_HEADER_SIZE - CHUNK_HEADER_SIZE) / PEER_COMMAND_SIZE;

const LAST_CHUNK: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Normal(Command),
    Shingle(Command, Shingles),
}

impl PeerCommand {
    /// Builds a TTL refresh for an entry that was just matched.
    pub fn refresh(flag: u8, digest: Digest, shingles: Option<Shingles>) -> Self {
        let command = Command::new(Opcode::Refresh, flag, digest);
        Self::from(DecodedCommand::new(command, shingles))
    }

    pub fn command(&self) -> &Command {
        match self {
            PeerCommand::Normal(cmd) | PeerCommand::Shingle(cmd, _) => cmd,
        }
    }

    pub fn command_mut(&mut self) -> &mut Command {
        match self {
            PeerCommand::Normal(cmd) | PeerCommand::Shingle(cmd, _) => cmd,
        }
    }

    pub fn shingles(&self) -> Option<&Shingles> {
        match self {
            PeerCommand::Normal(_) => None,
            PeerCommand::Shingle(_, shingles) => Some(shingles),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.command().cmd
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PEER_COMMAND_SIZE);
        match self {
            PeerCommand::Normal(cmd) => {
                buf.put_i32_le(0);
                cmd.put(&mut buf);
                buf.put_bytes(0, SHINGLE_COMMAND_SIZE - COMMAND_SIZE);
            }
            PeerCommand::Shingle(cmd, shingles) => {
                buf.put_i32_le(1);
                cmd.put(&mut buf);
                shingles.put(&mut buf);
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() != PEER_COMMAND_SIZE {
            return Err(FormatError::BadSize {
                expected: PEER_COMMAND_SIZE,
                actual: buf.len(),
            });
        }

        let mut cur = buf;
        let is_shingle = cur.get_i32_le() != 0;
        let command = Command::read(&mut cur)?;

        if is_shingle {
            Ok(PeerCommand::Shingle(command, Shingles::read(&mut cur)))
        } else {
            Ok(PeerCommand::Normal(command))
        }
    }
}

impl From<DecodedCommand> for PeerCommand {
    fn from(decoded: DecodedCommand) -> Self {
        match decoded.shingles {
            Some(shingles) => PeerCommand::Shingle(decoded.command, shingles),
            None => PeerCommand::Normal(decoded.command),
        }
    }
}

impl From<PeerCommand> for DecodedCommand {
    fn from(cmd: PeerCommand) -> Self {
        match cmd {
            PeerCommand::Normal(command) => DecodedCommand::new(command, None),
            PeerCommand::Shingle(command, shingles) => DecodedCommand::new(command, Some(shingles)),
        }
    }
}

/// One piece of a revisioned update batch.
///
/// Chunks of a batch share its revision, are numbered from zero and the
/// final one is flagged `last`. A receiver applies nothing until it holds
/// the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateChunk {
    pub revision: u64,
    pub seq: u32,
    pub last: bool,
    pub commands: Vec<PeerCommand>,
}

impl UpdateChunk {
    /// Splits a batch into chunks. An empty batch still yields one chunk so
    /// the revision itself is delivered.
    pub fn split(revision: u64, commands: &[PeerCommand]) -> Vec<UpdateChunk> {
        if commands.is_empty() {
            return vec![UpdateChunk {
                revision,
                seq: 0,
                last: true,
                commands: Vec::new(),
            }];
        }

        let total = commands.len().div_ceil(MAX_CHUNK_COMMANDS);
        commands
            .chunks(MAX_CHUNK_COMMANDS)
            .enumerate()
            .map(|(idx, part)| UpdateChunk {
                revision,
                seq: idx as u32,
                last: idx + 1 == total,
                commands: part.to_vec(),
            })
            .collect()
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf =
            BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.commands.len() * PEER_COMMAND_SIZE);
        buf.put_u64_le(self.revision);
        buf.put_u32_le(self.seq);
        buf.put_u16_le(self.commands.len() as u16);
        buf.put_u8(if self.last { LAST_CHUNK } else { 0 });
        buf.put_u8(0);
        for cmd in &self.commands {
            buf.put_slice(&cmd.encode());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(FormatError::BadSize {
                expected: CHUNK_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut cur = buf;
        let revision = cur.get_u64_le();
        let seq = cur.get_u32_le();
        let count = cur.get_u16_le() as usize;
        let flags = cur.get_u8();
        cur.advance(1);

        let expected = CHUNK_HEADER_SIZE + count * PEER_COMMAND_SIZE;
        if buf.len() != expected {
            return Err(FormatError::BadSize {
                expected,
                actual: buf.len(),
            });
        }

        let commands = cur
            .chunks_exact(PEER_COMMAND_SIZE)
            .map(PeerCommand::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            revision,
            seq,
            last: flags & LAST_CHUNK != 0,
            commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HASH_BYTES, SHINGLE_COUNT};

    #[test]
    fn test_normal_is_zero_padded() {
        let cmd = PeerCommand::Normal(Command::new(Opcode::Del, 2, [5u8; HASH_BYTES]));
        let bytes = cmd.encode();

        assert_eq!(bytes.len(), PEER_COMMAND_SIZE);
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert!(bytes[4 + COMMAND_SIZE..].iter().all(|b| *b == 0));
        assert_eq!(PeerCommand::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_shingle_peer_command() {
        let shingles = Shingles([42u64; SHINGLE_COUNT]);
        let cmd = PeerCommand::refresh(1, [6u8; HASH_BYTES], Some(shingles));

        assert_eq!(cmd.opcode(), Opcode::Refresh);
        assert_eq!(cmd.command().shingles_count, SHINGLE_COUNT as u8);

        let bytes = cmd.encode();
        assert_eq!(&bytes[..4], &1i32.to_le_bytes());
        let decoded = PeerCommand::decode(&bytes).unwrap();
        assert_eq!(decoded.shingles(), Some(&shingles));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            PeerCommand::decode(&[0u8; 10]),
            Err(FormatError::BadSize { .. })
        ));

        let mut bytes = PeerCommand::refresh(1, [1u8; HASH_BYTES], None)
            .encode()
            .to_vec();
        bytes[5] = 77;
        assert_eq!(
            PeerCommand::decode(&bytes).unwrap_err(),
            FormatError::UnknownCommand(77)
        );
    }

    fn writes(n: usize) -> Vec<PeerCommand> {
        (0..n)
            .map(|i| {
                PeerCommand::Normal(
                    Command::new(Opcode::Write, 1, [i as u8; HASH_BYTES]).with_value(i as i32),
                )
            })
            .collect()
    }

    #[test]
    fn test_chunk_fits_sealed_frame() {
        let chunk = UpdateChunk {
            revision: 1,
            seq: 0,
            last: true,
            commands: writes(MAX_CHUNK_COMMANDS),
        };
        assert!(chunk.encode().len() + ENC_REQ_HEADER_SIZE <= MAX_FRAME_SIZE);
    }

    #[test]
    fn test_split_numbers_chunks() {
        let batch = writes(MAX_CHUNK_COMMANDS * 2 + 1);
        let chunks = UpdateChunk::split(7, &batch);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            chunks.iter().map(|c| c.last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert!(chunks.iter().all(|c| c.revision == 7));
        assert_eq!(chunks[2].commands, batch[MAX_CHUNK_COMMANDS * 2..].to_vec());

        let decoded = UpdateChunk::decode(&chunks[1].encode()).unwrap();
        assert_eq!(decoded, chunks[1]);
    }

    #[test]
    fn test_empty_batch_keeps_revision() {
        let chunks = UpdateChunk::split(3, &[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].last);

        let decoded = UpdateChunk::decode(&chunks[0].encode()).unwrap();
        assert_eq!(decoded.revision, 3);
        assert!(decoded.commands.is_empty());
    }

    #[test]
    fn test_chunk_count_mismatch() {
        let chunk = UpdateChunk::split(1, &writes(2)).remove(0);
        let bytes = chunk.encode();
        assert!(matches!(
            UpdateChunk::decode(&bytes[..bytes.len() - 1]),
            Err(FormatError::BadSize { .. })
        ));
        assert!(matches!(
            UpdateChunk::decode(&bytes[..4]),
            Err(FormatError::BadSize { .. })
        ));
    }

    #[test]
    fn test_command_mut() {
        let mut cmd = PeerCommand::refresh(1, [1u8; HASH_BYTES], None);
        cmd.command_mut().cmd = Opcode::Dup;
        assert_eq!(cmd.opcode(), Opcode::Dup);
    }
}
