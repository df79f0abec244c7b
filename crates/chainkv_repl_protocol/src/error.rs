//! Protocol errors.

use std::io;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors while encoding, decoding or framing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame did not contain a valid message.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer sent a message that is not valid at this point.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// What the receiver was waiting for.
        expected: &'static str,
        /// What arrived.
        actual: &'static str,
    },

    /// The stream ended.
    #[error("connection closed by peer")]
    ConnectionClosed,
}
