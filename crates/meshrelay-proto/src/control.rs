//! Control-Plane Framing
//!
//! Stream handles travel to the peers over an out-of-band control channel.
//! The channel transport belongs to the surrounding P2P layer; this module
//! only fixes the framing so both ends agree on the bytes:
//!
//! ```text
//! Length (LE16) -- length of Data
//! Type (LE16)
//! Data (NB) -- protobuf-encoded payload
//! ```

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, ProtoResult};

/// Client asks the server peer to arrange a relayed stream
pub const CONTROL_TYPE_START_RELAY_STREAM_REQUEST: u16 = 0x0101;
/// Server peer's answer, carrying the stream handle
pub const CONTROL_TYPE_START_RELAY_STREAM_RESPONSE: u16 = 0x0102;
/// Server peer asks the relay to mint an allocation
pub const CONTROL_TYPE_CREATE_STREAM_REQUEST: u16 = 0x0201;
/// Relay's answer with (id, token, endpoint)
pub const CONTROL_TYPE_CREATE_STREAM_RESPONSE: u16 = 0x0202;

/// Write one control frame. `data` is the protobuf-encoded payload.
pub async fn write_control_frame<W>(w: &mut W, control_type: u16, data: &[u8]) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > u16::MAX as usize {
        return Err(ProtoError::PayloadTooLarge(data.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u16_le(data.len() as u16);
    buf.put_u16_le(control_type);
    buf.put_slice(data);

    w.write_all(&buf).await?;
    Ok(())
}

/// Read one control frame under `timeout`, returning type and payload.
pub async fn read_control_frame<R>(r: &mut R, timeout: Duration) -> ProtoResult<(u16, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, async {
        let length = r.read_u16_le().await?;
        let control_type = r.read_u16_le().await?;
        let mut data = vec![0u8; length as usize];
        r.read_exact(&mut data).await?;
        Ok((control_type, data))
    })
    .await
    .map_err(|_| ProtoError::Timeout)?
}
