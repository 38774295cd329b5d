//! MeshRelay Wire Protocol
//!
//! Framing and message vocabulary shared by the relay and its peers:
//! - Authenticated data-plane frames (handshake request/ack)
//! - Length/type control framing for delivering stream handles
//! - Protobuf message bodies
//! - Opaque peer identifiers

pub mod control;
pub mod error;
pub mod frame;
pub mod messages;
pub mod peer;

pub use error::{ProtoError, ProtoResult};
pub use peer::PeerId;
