//! MeshRelay Core
//!
//! The relay data plane for peers that cannot reach each other directly:
//! - Mint a rendezvous (stream id, token, endpoint) for a peer pair
//! - Authenticate both arriving TCP connections against it
//! - Splice the two byte streams until either side closes
//! - Reap rendezvous that were never (or only half) claimed

mod allocation;
mod bridge;

pub mod client;
pub mod config;
pub mod error;
pub mod manager;

pub use allocation::AllocationState;
pub use client::StreamInfo;
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use manager::{RelayManager, StreamGrant};

/// Token length; doubles as the HMAC-SHA256 key size
pub const TOKEN_LEN: usize = 32;
