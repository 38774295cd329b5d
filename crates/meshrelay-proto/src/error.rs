//! Wire protocol errors

use thiserror::Error;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Frame did not start with the expected magic
    #[error("Bad magic")]
    BadMagic,

    /// Unsupported protocol version
    #[error("Bad version: 0x{0:02x}")]
    BadVersion(u8),

    /// Recomputed HMAC differs from the frame trailer
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// Payload does not fit the 16-bit length field
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Frame not complete within the read deadline
    #[error("Read timed out")]
    Timeout,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload decode error
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Result type for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;
