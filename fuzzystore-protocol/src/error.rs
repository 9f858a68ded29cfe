//! Protocol error types and reply rejection codes.

use std::fmt;
use thiserror::Error;

/// Errors decoding a plaintext command or reply.
///
/// These are always answerable: the sender is identifiable, so the server
/// replies with an empty result instead of dropping the datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("bad command size: {actual} bytes (expected {expected})")]
    BadSize { expected: usize, actual: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown command opcode: {0}")]
    UnknownCommand(u8),

    #[error("bad reply size: {0} bytes")]
    BadReplySize(usize),
}

/// Errors opening or sealing an encryption envelope.
///
/// None of these are ever answered on the server side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid envelope magic")]
    BadMagic,

    #[error("truncated envelope: {0} bytes")]
    Truncated(usize),

    #[error("unknown key id: {0}")]
    UnknownKey(String),

    #[error("peer public key is not contributory")]
    BadPublicKey,

    #[error("message authentication failed")]
    AuthFailed,

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Errors from stream framing and I/O.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("empty frame")]
    EmptyFrame,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Values placed in `Reply::value` when a request is refused.
///
/// These are part of the wire contract with existing clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCode {
    /// The digest is on the skip list and was not stored.
    Skipped,
    /// Access policy refused the request.
    Forbidden,
}

impl RejectCode {
    /// Returns the value carried in the reply.
    pub fn value(&self) -> i32 {
        match self {
            RejectCode::Skipped => 401,
            RejectCode::Forbidden => 403,
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectCode::Skipped => write!(f, "SKIPPED"),
            RejectCode::Forbidden => write!(f, "FORBIDDEN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_code_values() {
        assert_eq!(RejectCode::Skipped.value(), 401);
        assert_eq!(RejectCode::Forbidden.value(), 403);
        assert_eq!(format!("{}", RejectCode::Forbidden), "FORBIDDEN");
    }

    #[test]
    fn test_format_error_display() {
        let err = FormatError::BadSize {
            expected: 76,
            actual: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("76"));
        assert!(msg.contains("10"));

        let err = FormatError::UnsupportedVersion(9);
        assert!(err.to_string().contains('9'));

        let err = FormatError::UnknownCommand(42);
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_protocol_error_from() {
        let err: ProtocolError = FormatError::UnknownCommand(7).into();
        assert!(matches!(err, ProtocolError::Format(_)));

        let err: ProtocolError = CryptoError::AuthFailed.into();
        assert!(err.to_string().contains("authentication"));
    }
}
