//! Relay errors

use meshrelay_proto::ProtoError;
use thiserror::Error;

/// Relay data-plane errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Handshake referenced an unknown stream id
    #[error("Allocation not found: {0}")]
    AllocationNotFound(u64),

    /// Sender peer id matches neither side of the allocation
    #[error("Sender matches neither side of the allocation")]
    BadPeer,

    /// Second handshake for an occupied side
    #[error("Side already bridged")]
    SideAlreadyBridged,

    /// Start called on a running manager
    #[error("Already running")]
    AlreadyRunning,

    /// Frame type other than the one expected at this point
    #[error("Unexpected frame type: 0x{0:02x}")]
    UnexpectedFrame(u8),

    /// Relay refused the handshake
    #[error("Relay rejected handshake: {0}")]
    Rejected(String),

    /// OS randomness source failed
    #[error("Randomness source failed: {0}")]
    Rng(#[from] rand::Error),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
