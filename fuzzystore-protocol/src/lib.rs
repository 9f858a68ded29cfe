//! # fuzzystore-protocol
//!
//! Wire protocol shared by fuzzystore clients and the server.
//!
//! This crate provides:
//! - Packed command and reply structures with explicit little-endian encoding
//! - The authenticated encryption envelope (X25519 + XChaCha20-Poly1305)
//! - The optional request extension chain
//! - Internal peer commands and the chunked batches masters push to replicas
//! - Length-prefixed framing for stream transports

pub mod codec;
pub mod envelope;
pub mod error;
pub mod extension;
pub mod frame;
pub mod peer;
pub mod wire;

pub use codec::Decoder;
pub use envelope::{KeyId, Keypair, Keyring, Opened, ENCRYPTED_MAGIC};
pub use error::{CryptoError, FormatError, ProtocolError, RejectCode};
pub use extension::{Extension, Extensions};
pub use frame::{Frame, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use peer::{PeerCommand, UpdateChunk, MAX_CHUNK_COMMANDS, PEER_COMMAND_SIZE};
pub use wire::{
    decode_command, decode_reply, encode_command, encode_reply, peek_tag, split_request, Command,
    DecodedCommand, Digest, Epoch, Opcode, Reply, Shingles,
};

/// Current protocol version carried in the low bits of `Command::version`.
pub const PROTOCOL_VERSION: u8 = 4;

/// Mask selecting the protocol version from the version byte.
pub const VERSION_MASK: u8 = 0x0f;

/// Version bit marking a low-confidence ("weak") write.
pub const WEAK_FLAG: u8 = 1 << 7;

/// Highest opcode a client may send; larger opcodes are internal.
pub const CLIENT_MAX: u8 = 4;

/// Size of a content digest in bytes.
pub const HASH_BYTES: usize = 64;

/// Number of shingle sub-hashes in a shingle command.
pub const SHINGLE_COUNT: usize = 32;

/// Default port for the fuzzy storage service.
pub const DEFAULT_PORT: u16 = 11335;
