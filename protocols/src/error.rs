//! Protocol error types.

use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Message body too long: {len} bytes (max {max})")]
    BodyTooLong { len: usize, max: usize },

    #[error("Unknown handshake message type: {0}")]
    UnknownHandshakeType(u8),

    #[error("Unknown control command type: {0}")]
    UnknownCommandType(u32),

    #[error("Handshake field mismatch: {field} expected {expected}, got {actual}")]
    Mismatch {
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("Handshake authentication tag mismatch")]
    BadTag,

    #[error("Too many control commands: {count} (max {max})")]
    TooManyCommands { count: usize, max: usize },

    #[error("Control message does not start with a header slot")]
    MissingHeader,
}
