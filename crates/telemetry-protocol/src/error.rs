//! Error types for the wire protocol.

use thiserror::Error;

/// Errors raised while framing or parsing messages.
///
/// `BadMagic` and `FrameTooLarge` mean the byte stream can no longer be
/// reinterpreted; the connection must be abandoned.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The header did not start with the protocol magic byte.
    #[error("protocol desync: expected magic 0x{expected:02x}, found 0x{found:02x}")]
    BadMagic { expected: u8, found: u8 },

    /// The declared payload length exceeds the accepted maximum.
    #[error("frame of {length} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    /// The payload could not be encoded or decoded.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns true when the stream position is lost and no further frame
    /// can be trusted.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::BadMagic { .. } | Self::FrameTooLarge { .. })
    }
}
