//! Relay Client Connector
//!
//! Dials a relay rendezvous and authenticates one side of it. On success the
//! returned stream is the raw bridged pipe to the counterparty; whatever the
//! peers run above it (their own secure transport, usually) is none of the
//! relay's business.

use std::time::Duration;

use meshrelay_proto::frame::{
    self, FRAME_TYPE_HANDSHAKE_ACK, FRAME_TYPE_HANDSHAKE_REQUEST,
};
use meshrelay_proto::messages::{HandshakeAck, HandshakeRequest};
use meshrelay_proto::{PeerId, ProtoError};
use prost::Message;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::TOKEN_LEN;

/// Ack wait deadline, mirroring the relay's handshake deadline
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// A minted rendezvous, as delivered over the control plane
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// TCP endpoint of the relay data plane
    pub endpoint: String,
    /// Stream id of the allocation
    pub stream_id: u64,
    /// Shared secret proving receipt of this handle
    pub token: [u8; TOKEN_LEN],
    /// Our own peer id, which must match one side of the allocation
    pub peer_id: PeerId,
}

/// Connect to the relay and claim our side of the rendezvous.
pub async fn connect(info: &StreamInfo) -> RelayResult<TcpStream> {
    let mut conn = TcpStream::connect(info.endpoint.as_str()).await?;
    send_handshake(&mut conn, info).await?;
    read_ack(&mut conn, &info.token).await?;
    debug!("Relay stream {} established via {}", info.stream_id, info.endpoint);
    Ok(conn)
}

pub(crate) async fn send_handshake(conn: &mut TcpStream, info: &StreamInfo) -> RelayResult<()> {
    let req = HandshakeRequest {
        stream_id: info.stream_id,
        sender_peer_id: info.peer_id.as_bytes().to_vec(),
    };
    frame::write_frame(
        conn,
        FRAME_TYPE_HANDSHAKE_REQUEST,
        &info.token,
        &req.encode_to_vec(),
    )
    .await?;
    Ok(())
}

pub(crate) async fn read_ack(conn: &mut TcpStream, token: &[u8]) -> RelayResult<()> {
    let (header, data, tag) = frame::read_frame(conn, ACK_TIMEOUT).await?;
    frame::verify_frame(&header, &data, &tag, token)?;
    if header.frame_type != FRAME_TYPE_HANDSHAKE_ACK {
        return Err(RelayError::UnexpectedFrame(header.frame_type));
    }
    let ack = HandshakeAck::decode(data.as_slice()).map_err(ProtoError::from)?;
    if !ack.ok {
        return Err(RelayError::Rejected(ack.error));
    }
    Ok(())
}
